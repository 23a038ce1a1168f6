//! Scope administration routes. Every route requires the admin token.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use super::handler::{require_admin, AppError};
use crate::data::DataSourceConfig;
use crate::scopes::{Scope, ScopeError, ScopeRepository, ScopeTask};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/scopes", get(list_scopes).put(put_scope))
        .route("/scopes/refresh", post(refresh_all_scopes))
        .route("/scopes/{scope_id}", get(get_scope).delete(delete_scope))
        .route("/scopes/{scope_id}/refresh", post(refresh_scope))
        .route("/scopes/{scope_id}/data", get(get_scope_data))
}

#[derive(Debug, Deserialize)]
struct PutScopeQuery {
    /// Whether the worker must fetch from the remote even if it has a clone.
    #[serde(default)]
    force_fetch: bool,
}

#[derive(Debug, Deserialize)]
struct RefreshQuery {
    /// Commit the worker should find locally; when missing it fetches.
    hinted_hash: Option<String>,
}

async fn load_scope(state: &AppState, scope_id: &str) -> Result<Scope, ScopeError> {
    state
        .scopes
        .get(scope_id)
        .await?
        .ok_or_else(|| ScopeError::NotFound(scope_id.to_string()))
}

async fn send_task(state: &AppState, task: ScopeTask) -> Result<(), AppError> {
    task.publish(&state.publisher, &state.config.scopes.sync_topic)
        .await?;
    Ok(())
}

/// `PUT /scopes?force_fetch=`
#[instrument(skip_all)]
async fn put_scope(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PutScopeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &headers)?;
    let scope: Scope = serde_json::from_slice(&body)
        .map_err(|e| AppError::Unprocessable(format!("invalid scope: {e}")))?;
    scope.verify_auth()?;

    let scope_id = scope.scope_id.clone();
    state.scopes.put(scope).await?;
    state.metrics.metrics.scope_writes_total.inc();

    info!(%scope_id, force_fetch = query.force_fetch, "sync scope");
    send_task(&state, ScopeTask::sync(scope_id, query.force_fetch)).await?;
    Ok(StatusCode::CREATED)
}

/// `GET /scopes`
async fn list_scopes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, AppError> {
    require_admin(&state, &headers)?;
    let views = state
        .scopes
        .all()
        .await?
        .iter()
        .map(Scope::public_view)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(views))
}

/// `GET /scopes/{scope_id}`
async fn get_scope(
    State(state): State<Arc<AppState>>,
    Path(scope_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let scope = load_scope(&state, &scope_id).await?;
    Ok(Json(scope.public_view()?))
}

/// `DELETE /scopes/{scope_id}`
#[instrument(skip(state, headers))]
async fn delete_scope(
    State(state): State<Arc<AppState>>,
    Path(scope_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &headers)?;
    if !state.scopes.delete(&scope_id).await? {
        info!("scope did not exist");
    }
    send_task(&state, ScopeTask::Delete { scope_id }).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /scopes/{scope_id}/refresh?hinted_hash=`
#[instrument(skip(state, headers, query))]
async fn refresh_scope(
    State(state): State<Arc<AppState>>,
    Path(scope_id): Path<String>,
    Query(query): Query<RefreshQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &headers)?;
    load_scope(&state, &scope_id).await?;

    info!("refresh scope");
    // Without a hint there is no way to tell whether the clone is stale.
    let force_fetch = query.hinted_hash.is_none();
    let task = ScopeTask::Sync {
        scope_id,
        force_fetch,
        hinted_hash: query.hinted_hash,
    };
    send_task(&state, task).await?;
    Ok(StatusCode::OK)
}

/// `POST /scopes/refresh`
#[instrument(skip_all)]
async fn refresh_all_scopes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &headers)?;
    let scopes = state.scopes.all().await?;
    info!(count = scopes.len(), "sync all scopes");
    for scope in scopes {
        send_task(&state, ScopeTask::sync(scope.scope_id, false)).await?;
    }
    Ok(StatusCode::OK)
}

/// `GET /scopes/{scope_id}/data`
async fn get_scope_data(
    State(state): State<Arc<AppState>>,
    Path(scope_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DataSourceConfig>, AppError> {
    require_admin(&state, &headers)?;
    let scope = load_scope(&state, &scope_id).await?;
    Ok(Json(scope.data))
}
