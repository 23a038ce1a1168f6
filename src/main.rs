mod auth;
mod config;
mod coordination;
mod data;
mod health;
mod http;
mod metrics;
mod scopes;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::admin::{AdminAuthenticator, MasterTokenAuthenticator};
use crate::config::{Config, ScopeBackend};
use crate::coordination::pubsub::{KeyDbPublisher, MeteredPublisher, Publisher};
use crate::data::DataUpdatePublisher;
use crate::metrics::MetricsRegistry;
use crate::scopes::repository::{KeyDbScopeRepository, MemoryScopeRepository};
use crate::scopes::ScopeRepository;
use crate::webhook::dispatch::WebhookDispatcher;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "policysync", about = "Policy-distribution control plane")]
struct Cli {
    /// Path to the YAML configuration file. Built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers. Immutable after startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub publisher: Arc<dyn Publisher>,
    pub scopes: Arc<dyn ScopeRepository>,
    pub authenticator: Arc<dyn AdminAuthenticator>,
    /// Source type is fixed here, once.
    pub dispatcher: Arc<WebhookDispatcher>,
    pub data: Arc<DataUpdatePublisher>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        metrics: MetricsRegistry,
        publisher: Arc<dyn Publisher>,
        scopes: Arc<dyn ScopeRepository>,
        authenticator: Arc<dyn AdminAuthenticator>,
    ) -> Result<Self> {
        let dispatcher = WebhookDispatcher::new(
            &config.policy_source,
            Arc::clone(&authenticator),
            Arc::clone(&publisher),
        )
        .context("failed to build webhook dispatcher")?;

        let data = DataUpdatePublisher::new(
            config.data.sources.clone(),
            config.data.update_topic.clone(),
            Arc::clone(&publisher),
        );

        Ok(Self {
            config,
            metrics,
            publisher,
            scopes,
            authenticator,
            dispatcher: Arc::new(dispatcher),
            data: Arc::new(data),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(cli.config.as_deref())?);
    tracing::info!(
        config_path = ?cli.config,
        source_type = ?config.policy_source.source_type,
        role = ?config.server.role,
        "starting policysync"
    );

    // ---- Infrastructure clients ----
    let keydb = coordination::redis::create_keydb_pool(&config.keydb).await?;

    // ---- Metrics + capabilities ----
    let metrics = MetricsRegistry::new();

    let publisher: Arc<dyn Publisher> = Arc::new(MeteredPublisher::new(
        Arc::new(KeyDbPublisher::new(keydb.clone())),
        metrics.clone(),
    ));

    let scope_repo: Arc<dyn ScopeRepository> = match config.scopes.backend {
        ScopeBackend::Keydb => Arc::new(KeyDbScopeRepository::new(keydb)),
        ScopeBackend::Memory => Arc::new(MemoryScopeRepository::new()),
    };
    tracing::info!(backend = ?config.scopes.backend, "scope repository initialised");

    let authenticator: Arc<dyn AdminAuthenticator> = Arc::new(
        MasterTokenAuthenticator::from_env(&config.auth.admin_token_env),
    );
    tracing::info!(enabled = authenticator.enabled(), "admin authenticator initialised");

    // ---- Seed default scope (before serving) ----
    if let Some(scope) = scopes::loader::load_scopes(&config, scope_repo.as_ref()).await? {
        metrics.metrics.scope_writes_total.inc();
        tracing::info!(scope_id = %scope.scope_id, "default scope loaded");
    }

    // ---- App state ----
    let state = AppState::new(config, metrics, publisher, scope_repo, authenticator)?;

    run_http_server(state).await?;

    tracing::info!("policysync shut down cleanly");
    Ok(())
}
