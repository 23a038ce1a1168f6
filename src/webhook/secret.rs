//! Webhook request authentication.
//!
//! The secret header is run through a configurable regex because providers
//! decorate it (GitHub sends `sha256=<hex>`). The secret is always the
//! **second** capture group. A regex with only one group therefore never
//! yields a secret and every request fails with
//! [`AuthenticationError::MissingSecret`].

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::AuthenticationError;
use crate::config::{SecretString, SecretType, WebhookParams};

type HmacSha256 = Hmac<Sha256>;

/// Checks webhook requests against the shared secret of the tracked source.
#[derive(Debug)]
pub struct SecretValidator {
    /// `None` turns validation off entirely.
    secret: Option<SecretString>,
    header_name: String,
    parser: Regex,
    secret_type: SecretType,
}

impl SecretValidator {
    pub fn new(secret: Option<SecretString>, params: &WebhookParams) -> Result<Self> {
        let parser = Regex::new(&params.secret_parsing_regex)
            .context("invalid webhook secret_parsing_regex")?;
        Ok(Self {
            secret,
            header_name: params.secret_header_name.clone(),
            parser,
            secret_type: params.secret_type,
        })
    }

    /// Authenticate one request. `body` must be the raw, unparsed bytes.
    pub fn validate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AuthenticationError> {
        let Some(configured) = &self.secret else {
            return Ok(());
        };

        let provided = self
            .extract_secret(headers)
            .ok_or(AuthenticationError::MissingSecret)?;

        match self.secret_type {
            SecretType::Signature => {
                let ours = sign(configured.expose().as_bytes(), body)
                    .map_err(|_| AuthenticationError::SignatureMismatch)?;
                if bool::from(ours.as_bytes().ct_eq(provided.as_bytes())) {
                    Ok(())
                } else {
                    Err(AuthenticationError::SignatureMismatch)
                }
            }
            SecretType::Token => {
                if bool::from(provided.as_bytes().ct_eq(configured.expose().as_bytes())) {
                    Ok(())
                } else {
                    Err(AuthenticationError::TokenMismatch)
                }
            }
        }
    }

    /// The effective secret from the configured header, if any.
    ///
    /// A missing header is treated like an empty one.
    fn extract_secret<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        let raw = headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        self.parser
            .captures(raw)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Lowercase hex HMAC-SHA256 of `body` keyed by `key`.
pub fn sign(key: &[u8], body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const BODY: &[u8] = br#"{"repository":{"clone_url":"https://github.com/acme/policy.git"}}"#;

    fn github_params() -> WebhookParams {
        WebhookParams::default()
    }

    fn token_params() -> WebhookParams {
        WebhookParams {
            secret_header_name: "x-gitlab-token".into(),
            secret_parsing_regex: r"(\w+)=(\w+)".into(),
            secret_type: SecretType::Token,
            ..WebhookParams::default()
        }
    }

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn validator(secret: Option<&str>, params: &WebhookParams) -> SecretValidator {
        SecretValidator::new(secret.map(SecretString::new), params).unwrap()
    }

    // ── Signature mode ────────────────────────────────────────────────

    #[test]
    fn test_signature_accepted() {
        let v = validator(Some("topsecret"), &github_params());
        let sig = format!("sha256={}", sign(b"topsecret", BODY).unwrap());
        assert_eq!(v.validate(&headers("x-hub-signature-256", &sig), BODY), Ok(()));
    }

    #[test]
    fn test_signature_without_prefix_accepted() {
        // The prefix group is optional in the default regex.
        let v = validator(Some("topsecret"), &github_params());
        let sig = sign(b"topsecret", BODY).unwrap();
        assert_eq!(v.validate(&headers("x-hub-signature-256", &sig), BODY), Ok(()));
    }

    #[test]
    fn test_signature_rejected_on_flipped_body_bit() {
        let v = validator(Some("topsecret"), &github_params());
        let sig = format!("sha256={}", sign(b"topsecret", BODY).unwrap());

        let mut tampered = BODY.to_vec();
        tampered[10] ^= 0x01;
        assert_eq!(
            v.validate(&headers("x-hub-signature-256", &sig), &tampered),
            Err(AuthenticationError::SignatureMismatch)
        );
    }

    #[test]
    fn test_signature_rejected_with_wrong_key() {
        let v = validator(Some("topsecret"), &github_params());
        let sig = format!("sha256={}", sign(b"othersecret", BODY).unwrap());
        assert_eq!(
            v.validate(&headers("x-hub-signature-256", &sig), BODY),
            Err(AuthenticationError::SignatureMismatch)
        );
    }

    #[test]
    fn test_signature_missing_header() {
        let v = validator(Some("topsecret"), &github_params());
        assert_eq!(
            v.validate(&HeaderMap::new(), BODY),
            Err(AuthenticationError::MissingSecret)
        );
    }

    #[test]
    fn test_known_hmac_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            sign(b"Jefe", b"what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    // ── Token mode ────────────────────────────────────────────────────

    #[test]
    fn test_token_second_group_is_secret() {
        let v = validator(Some("ABC"), &token_params());
        assert_eq!(v.validate(&headers("x-gitlab-token", "prefix=ABC"), BODY), Ok(()));
    }

    #[test]
    fn test_token_single_char_difference_rejected() {
        let v = validator(Some("ABC"), &token_params());
        assert_eq!(
            v.validate(&headers("x-gitlab-token", "prefix=ABD"), BODY),
            Err(AuthenticationError::TokenMismatch)
        );
        assert_eq!(
            v.validate(&headers("x-gitlab-token", "prefix=AB"), BODY),
            Err(AuthenticationError::TokenMismatch)
        );
    }

    #[test]
    fn test_token_first_group_is_ignored() {
        let v = validator(Some("prefix"), &token_params());
        assert_eq!(
            v.validate(&headers("x-gitlab-token", "prefix=ABC"), BODY),
            Err(AuthenticationError::TokenMismatch)
        );
    }

    #[test]
    fn test_single_group_regex_never_yields_secret() {
        let params = WebhookParams {
            secret_parsing_regex: "(.*)".into(),
            ..token_params()
        };
        let v = validator(Some("ABC"), &params);
        assert_eq!(
            v.validate(&headers("x-gitlab-token", "ABC"), BODY),
            Err(AuthenticationError::MissingSecret)
        );
    }

    #[test]
    fn test_non_matching_header_is_missing_secret() {
        let v = validator(Some("ABC"), &token_params());
        assert_eq!(
            v.validate(&headers("x-gitlab-token", "no-equals-sign"), BODY),
            Err(AuthenticationError::MissingSecret)
        );
    }

    // ── No secret configured ──────────────────────────────────────────

    #[test]
    fn test_no_secret_accepts_anything() {
        let v = validator(None, &github_params());
        assert_eq!(v.validate(&HeaderMap::new(), BODY), Ok(()));
        assert_eq!(
            v.validate(&headers("x-hub-signature-256", "sha256=deadbeef"), b"junk"),
            Ok(())
        );

        let v = validator(None, &token_params());
        assert_eq!(v.validate(&headers("x-gitlab-token", "prefix=nope"), BODY), Ok(()));
    }

    #[test]
    fn test_invalid_regex_rejected_at_construction() {
        let params = WebhookParams {
            secret_parsing_regex: "([".into(),
            ..WebhookParams::default()
        };
        assert!(SecretValidator::new(None, &params).is_err());
    }
}
