//! KeyDB / Redis client pool creation.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::KeyDbConfig;

const POOL_SIZE: usize = 4;
const DEFAULT_PORT: u16 = 6379;

/// Connect to KeyDB and verify the connection with a `PING`.
///
/// The password, if any, comes from the environment variable named by
/// `config.auth_token_env`.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let (host, port) = parse_endpoint(&config.endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        password: std::env::var(&config.auth_token_env)
            .ok()
            .filter(|t| !t.is_empty()),
        ..fred::types::config::Config::default()
    };

    let tls = use_tls(config);
    if tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host,
        port,
        tls,
        pool_size = POOL_SIZE,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// A `rediss://` endpoint turns TLS on even when `tls` is false.
fn use_tls(config: &KeyDbConfig) -> bool {
    config.tls || config.endpoint.starts_with("rediss://")
}

/// Split an endpoint such as `rediss://keydb.local:6380/0` into host and
/// port. The scheme and any path are ignored; the port defaults to 6379.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, DEFAULT_PORT)),
    }
}
