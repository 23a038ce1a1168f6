//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST /webhook`               - Git-hosting webhook / API bundle trigger
//! - `GET  <data.config_route>`    - Data source configuration
//! - `POST <data.config_route>`    - Data update trigger (admin)
//! - `/scopes/...`                 - Scope administration (admin), see [`super::scopes`]
//! - `GET  /healthz`               - Health check
//! - `GET  /metrics`               - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use tracing::{error, instrument, warn};

use crate::data::{DataSourceConfig, DataUpdate};
use crate::metrics::WebhookOutcome;
use crate::scopes::ScopeError;
use crate::webhook::dispatch::{WebhookResponse, WebhookStatus};
use crate::webhook::WebhookError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let data_route = state.config.data.config_route.clone();
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route(
            &data_route,
            get(handle_data_config).post(handle_data_update),
        )
        .merge(super::scopes::routes())
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /webhook`
///
/// The body is taken raw: the signature covers the exact bytes received.
#[instrument(skip_all)]
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let result = state.dispatcher.handle(&headers, &body).await;
    state.metrics.metrics.record_webhook(webhook_outcome(&result));
    Ok(Json(result?))
}

fn webhook_outcome(result: &Result<WebhookResponse, WebhookError>) -> WebhookOutcome {
    match result {
        Ok(resp) if resp.published => WebhookOutcome::Published,
        Ok(resp) if resp.status == WebhookStatus::Ignored => WebhookOutcome::Ignored,
        Ok(_) => WebhookOutcome::Acknowledged,
        Err(WebhookError::Authentication(_) | WebhookError::Unauthorized(_)) => {
            WebhookOutcome::Unauthorized
        }
        Err(WebhookError::Validation(_)) => WebhookOutcome::Rejected,
        Err(WebhookError::Publish(_)) => WebhookOutcome::Failed,
    }
}

/// `GET <data.config_route>`
async fn handle_data_config(State(state): State<Arc<AppState>>) -> Json<DataSourceConfig> {
    Json(state.data.get_source_config().clone())
}

/// `POST <data.config_route>`
///
/// The update is forwarded as-is. Authentication runs before the body is
/// parsed so anonymous callers always see 401.
#[instrument(skip_all)]
async fn handle_data_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers)?;
    let update: DataUpdate = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("data update is not valid JSON: {e}")))?;

    state.metrics.metrics.data_updates_total.inc();
    state.data.publish_update(&update).await?;
    Ok(Json(json!({})))
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Gate for administrative routes.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    state.authenticator.authenticate(headers).map_err(|e| {
        warn!(error = %e, "admin authentication failed");
        AppError::Unauthorized(e.to_string())
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The caller is not authenticated or not authorised.
    Unauthorized(String),
    BadRequest(String),
    NotFound(String),
    /// Well-formed but unusable input (e.g. an unparseable SSH key).
    Unprocessable(String),
    /// An unexpected internal error, including publish failures.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer realm=\"policysync\"")],
                Json(json!({ "detail": msg })),
            )
                .into_response(),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": msg }))).into_response()
            }
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "detail": msg }))).into_response()
            }
            AppError::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "detail": { "error": msg } })),
            )
                .into_response(),
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": format!("{err:#}") })),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Authentication(_) | WebhookError::Unauthorized(_) => {
                AppError::Unauthorized(err.to_string())
            }
            WebhookError::Validation(_) => AppError::BadRequest(err.to_string()),
            WebhookError::Publish(e) => AppError::Internal(e),
        }
    }
}

impl From<ScopeError> for AppError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::NotFound(_) => AppError::NotFound(err.to_string()),
            ScopeError::InvalidPrivateKey(msg) => AppError::Unprocessable(msg.to_string()),
            ScopeError::Storage(e) => AppError::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;

    use super::*;
    use crate::config::{PolicySourceType, SecretString};
    use crate::http::test_support::{admin, body_json, test_app, test_config, TRACKED};
    use crate::webhook::secret::sign;

    fn webhook_request(event: &str, body: &serde_json::Value, secret: Option<&str>) -> Request<Body> {
        let bytes = serde_json::to_vec(body).unwrap();
        let mut builder = Request::post("/webhook")
            .header("content-type", "application/json")
            .header("x-github-event", event);
        if let Some(secret) = secret {
            let sig = format!("sha256={}", sign(secret.as_bytes(), &bytes).unwrap());
            builder = builder.header("x-hub-signature-256", sig);
        }
        builder.body(Body::from(bytes)).unwrap()
    }

    // ── /webhook ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_webhook_push_publishes_and_responds_ok() {
        let mut config = test_config();
        config.policy_source.webhook_secret = Some(SecretString::new("s3cret"));
        let app = test_app(config);

        let payload = json!({"repository": {"clone_url": TRACKED}});
        let resp = app
            .send(webhook_request("push", &payload, Some("s3cret")))
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "ok", "event": "push", "repo_url": TRACKED})
        );
        assert_eq!(app.publisher.topics(), vec!["webhook"]);

        let metrics = app.state.metrics.encode().unwrap();
        assert!(metrics.contains("policysync_webhook_requests_total{outcome=\"published\"} 1"));
        assert!(metrics.contains("policysync_data_updates_total 0"));
    }

    #[tokio::test]
    async fn test_webhook_bad_signature_is_401() {
        let mut config = test_config();
        config.policy_source.webhook_secret = Some(SecretString::new("s3cret"));
        let app = test_app(config);

        let payload = json!({"repository": {"clone_url": TRACKED}});
        let resp = app
            .send(webhook_request("push", &payload, Some("guess")))
            .await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_without_repo_url_is_400() {
        let app = test_app(test_config());
        let resp = app
            .send(webhook_request("push", &json!({"zen": "hi"}), None))
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(app.publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_untracked_repo_is_ignored() {
        let app = test_app(test_config());
        let payload = json!({"repository": {"clone_url": "https://github.com/acme/other.git"}});
        let resp = app.send(webhook_request("push", &payload, None)).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "ignored", "event": "push"})
        );
        assert!(app.publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_api_mode_requires_admin() {
        let mut config = test_config();
        config.policy_source.source_type = PolicySourceType::Api;
        config.policy_source.bundle_url = Some("https://bundles.example.com/b.tar.gz".into());
        let app = test_app(config);

        let resp = app
            .send(Request::post("/webhook").body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.publisher.calls().is_empty());

        let resp = app
            .send(admin(Request::post("/webhook")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({
                "status": "ok",
                "event": "webhook_trigger",
                "repo_url": "https://bundles.example.com/b.tar.gz"
            })
        );
        assert_eq!(app.publisher.topics(), vec!["webhook"]);
    }

    // ── data routes ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_get_data_config_is_public() {
        let mut config = test_config();
        config.data.sources = DataSourceConfig(json!({"entries": [{"url": "https://x/users"}]}));
        let app = test_app(config);

        let resp = app
            .send(Request::get("/data/config").body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"entries": [{"url": "https://x/users"}]})
        );
    }

    #[tokio::test]
    async fn test_post_data_update_forwards_body() {
        let app = test_app(test_config());
        let update = json!({"entries": [{"url": "https://x/users", "topics": ["users"]}]});

        let resp = app
            .send(
                admin(Request::post("/data/config"))
                    .header("content-type", "application/json")
                    .body(Body::from(update.to_string()))
                    .unwrap(),
            )
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({}));
        let calls = app.publisher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "policy_data");
        let sent: serde_json::Value = serde_json::from_str(calls[0].1.as_deref().unwrap()).unwrap();
        assert_eq!(sent, update);
    }

    #[tokio::test]
    async fn test_post_data_update_requires_admin() {
        let app = test_app(test_config());
        let resp = app
            .send(Request::post("/data/config").body(Body::from("{}")).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_post_data_update_rejects_non_json() {
        let app = test_app(test_config());
        let resp = app
            .send(
                admin(Request::post("/data/config"))
                    .body(Body::from("nope"))
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(app.publisher.calls().is_empty());
    }

    // ── health / metrics ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_healthz_ok_with_memory_store() {
        let app = test_app(test_config());
        let resp = app
            .send(Request::get("/healthz").body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = test_app(test_config());
        let resp = app
            .send(Request::get("/metrics").body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/openmetrics-text"));
    }

    #[test]
    fn test_scope_errors_map_to_status() {
        let cases = [
            (ScopeError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ScopeError::InvalidPrivateKey("private key is invalid"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ScopeError::Storage(anyhow::anyhow!("down")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
