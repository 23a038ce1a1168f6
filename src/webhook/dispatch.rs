//! Webhook dispatch: decide whether a validated webhook triggers a publish.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderMap;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use super::repo_urls::affected_repo_urls;
use super::secret::SecretValidator;
use super::{ConfigurationError, ValidationError, WebhookError};
use crate::auth::admin::AdminAuthenticator;
use crate::config::{PolicySourceConfig, PolicySourceType, WebhookParams};
use crate::coordination::pubsub::{publish_detached, Publisher};

/// Event name used when the provider does not say which event fired.
const DEFAULT_EVENT: &str = "ping";
/// Event reported for API-bundle triggers.
const API_TRIGGER_EVENT: &str = "webhook_trigger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Ok,
    Ignored,
}

/// JSON body returned to the webhook caller.
///
/// `repo_url` is left out of `ignored` bodies and is `null` when the source
/// has no URL configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    /// `None` only when the event discriminator is misconfigured.
    pub event: Option<String>,
    pub repo_url: Option<String>,
    /// Whether a notification went out. Not part of the response body.
    pub published: bool,
}

impl Serialize for WebhookResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ignored = self.status == WebhookStatus::Ignored;
        let mut map = serializer.serialize_map(Some(if ignored { 2 } else { 3 }))?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("event", &self.event)?;
        if !ignored {
            map.serialize_entry("repo_url", &self.repo_url)?;
        }
        map.end()
    }
}

/// How requests are authenticated and matched. Fixed at construction.
enum Mode {
    Git {
        validator: SecretValidator,
        params: WebhookParams,
        repo_url: Option<String>,
    },
    Api {
        authenticator: Arc<dyn AdminAuthenticator>,
        bundle_url: Option<String>,
    },
}

/// Handles `POST /webhook` for the tracked policy source.
pub struct WebhookDispatcher {
    mode: Mode,
    topic: String,
    publisher: Arc<dyn Publisher>,
}

impl WebhookDispatcher {
    /// Build the dispatcher for the configured source type.
    pub fn new(
        source: &PolicySourceConfig,
        authenticator: Arc<dyn AdminAuthenticator>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let mode = match source.source_type {
            PolicySourceType::Git => Mode::Git {
                validator: SecretValidator::new(
                    source.webhook_secret.clone(),
                    &source.webhook_params,
                )?,
                params: source.webhook_params.clone(),
                repo_url: source.repo_url.clone(),
            },
            PolicySourceType::Api => Mode::Api {
                authenticator,
                bundle_url: source.bundle_url.clone(),
            },
        };
        Ok(Self {
            mode,
            topic: source.webhook_topic.clone(),
            publisher,
        })
    }

    pub fn source_type(&self) -> PolicySourceType {
        match self.mode {
            Mode::Git { .. } => PolicySourceType::Git,
            Mode::Api { .. } => PolicySourceType::Api,
        }
    }

    /// Process one webhook. `body` is the raw request body.
    ///
    /// Authentication and payload validation finish before the publish is
    /// attempted; an error return means nothing was published.
    #[instrument(skip_all, fields(source_type = ?self.source_type()))]
    pub async fn handle(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookResponse, WebhookError> {
        match &self.mode {
            Mode::Git {
                validator,
                params,
                repo_url,
            } => {
                validator.validate(headers, body).map_err(|e| {
                    warn!(error = %e, "webhook authentication failed");
                    e
                })?;
                let payload: Value = serde_json::from_slice(body)
                    .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
                let urls = affected_repo_urls(&payload)?;
                let event = event_name(params, headers, &payload);
                self.dispatch_git(params, repo_url.as_deref(), &urls, event)
                    .await
            }
            Mode::Api {
                authenticator,
                bundle_url,
            } => {
                authenticator.authenticate(headers).map_err(|e| {
                    warn!(error = %e, "webhook trigger rejected");
                    e
                })?;
                info!("triggered webhook to check API bundle URL");
                self.publish().await?;
                Ok(WebhookResponse {
                    status: WebhookStatus::Ok,
                    event: Some(API_TRIGGER_EVENT.to_string()),
                    repo_url: bundle_url.clone(),
                    published: true,
                })
            }
        }
    }

    async fn dispatch_git(
        &self,
        params: &WebhookParams,
        tracked: Option<&str>,
        urls: &BTreeSet<String>,
        event: Option<String>,
    ) -> Result<WebhookResponse, WebhookError> {
        let Some(tracked) = tracked.filter(|t| urls.contains(*t)) else {
            warn!(
                tracked = ?tracked,
                urls = ?urls,
                event = ?event,
                "got a webhook not matching the tracked repo"
            );
            return Ok(WebhookResponse {
                status: WebhookStatus::Ignored,
                event,
                repo_url: None,
                published: false,
            });
        };

        info!(repo = %tracked, event = ?event, "triggered webhook on tracked repo");
        let published = event.as_deref() == Some(params.push_event_value.as_str());
        if published {
            self.publish().await?;
        }
        Ok(WebhookResponse {
            status: WebhookStatus::Ok,
            event,
            repo_url: Some(tracked.to_string()),
            published,
        })
    }

    async fn publish(&self) -> Result<(), WebhookError> {
        publish_detached(Arc::clone(&self.publisher), self.topic.clone(), None)
            .await
            .map_err(WebhookError::Publish)
    }
}

/// Resolve the event name: header first, then body key, else undefined.
fn event_name(params: &WebhookParams, headers: &HeaderMap, payload: &Value) -> Option<String> {
    if let Some(header) = &params.event_header_name {
        let event = headers
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_EVENT);
        return Some(event.to_string());
    }
    if let Some(key) = &params.event_request_key {
        let event = match payload.get(key.as_str()) {
            None | Some(Value::Null) => DEFAULT_EVENT.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        return Some(event);
    }
    error!(error = %ConfigurationError::MissingEventDiscriminator, "webhook config defect");
    None
}
