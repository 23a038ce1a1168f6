//! Authentication for administrative callers.
//!
//! Webhook callers are authenticated separately by
//! [`crate::webhook::secret::SecretValidator`].

pub mod admin;
