use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::config::SecretString;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdminAuthError {
    #[error("missing Authorization header")]
    MissingCredentials,
    #[error("Authorization header must use the Bearer scheme")]
    InvalidScheme,
    #[error("invalid bearer token")]
    InvalidToken,
}

/// Gate for administrative routes (scope management, data updates, and the
/// webhook route when the policy source is an API bundle).
pub trait AdminAuthenticator: Send + Sync {
    /// `false` when every caller is let through.
    fn enabled(&self) -> bool;

    fn authenticate(&self, headers: &HeaderMap) -> Result<(), AdminAuthError>;
}

/// Accepts `Authorization: Bearer <token>` matching a single master token.
pub struct MasterTokenAuthenticator {
    token: Option<SecretString>,
}

impl MasterTokenAuthenticator {
    pub fn new(token: Option<SecretString>) -> Self {
        Self { token }
    }

    /// Read the token from the environment variable named `env_name`.
    pub fn from_env(env_name: &str) -> Self {
        let token = std::env::var(env_name)
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::new);
        if token.is_none() {
            warn!(
                env = %env_name,
                "admin token not configured; administrative routes are unauthenticated"
            );
        }
        Self::new(token)
    }
}

impl AdminAuthenticator for MasterTokenAuthenticator {
    fn enabled(&self) -> bool {
        self.token.is_some()
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<(), AdminAuthError> {
        let Some(expected) = &self.token else {
            return Ok(());
        };

        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AdminAuthError::MissingCredentials)?;

        let (scheme, token) = value
            .split_once(' ')
            .ok_or(AdminAuthError::InvalidScheme)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AdminAuthError::InvalidScheme);
        }

        if token.trim().as_bytes().ct_eq(expected.expose().as_bytes()).into() {
            Ok(())
        } else {
            Err(AdminAuthError::InvalidToken)
        }
    }
}
