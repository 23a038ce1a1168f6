//! Git-hosting webhook pipeline.
//!
//! A request flows through three stages, each of which must succeed before
//! the next runs:
//!
//! 1. [`secret::SecretValidator`] authenticates the request (HMAC signature
//!    or shared token).
//! 2. [`repo_urls::affected_repo_urls`] normalises the provider payload into
//!    the set of repository URLs it mentions.
//! 3. [`dispatch::WebhookDispatcher`] matches the set against the tracked
//!    source and decides whether to publish.
//!
//! Publishing is the only side effect and happens last, so any error leaves
//! nothing behind.

pub mod dispatch;
pub mod repo_urls;
pub mod secret;

use thiserror::Error;

use crate::auth::admin::AdminAuthError;

/// The webhook did not prove it came from the configured provider.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("no secret was provided")]
    MissingSecret,
    #[error("signatures didn't match")]
    SignatureMismatch,
    #[error("secret tokens didn't match")]
    TokenMismatch,
}

/// The webhook was authentic but unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("repo url not found in payload")]
    NoRepoUrlFound,
    #[error("webhook body is not valid JSON: {0}")]
    MalformedPayload(String),
}

/// Defects in static configuration noticed while handling a request.
///
/// These are logged and never fail the request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("webhook params set neither event_header_name nor event_request_key")]
    MissingEventDiscriminator,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Unauthorized(#[from] AdminAuthError),
    /// The pub/sub channel refused the notification.
    #[error("failed to publish webhook notification: {0:#}")]
    Publish(anyhow::Error),
}
