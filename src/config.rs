use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::data::DataSourceConfig;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Where policy comes from.
///
/// Selected once at startup; the webhook route is wired differently for each
/// variant and never re-evaluates the choice per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySourceType {
    /// A git repository, matched against webhook payload URLs.
    #[default]
    Git,
    /// A pre-built bundle served from `bundle_url`.
    Api,
}

impl FromStr for PolicySourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(Self::Git),
            "api" => Ok(Self::Api),
            other => anyhow::bail!("unknown policy source type: {other}"),
        }
    }
}

/// Role of this server in a replicated deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// The single instance allowed to seed shared state.
    #[default]
    Primary,
    Secondary,
}

impl FromStr for ServerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => anyhow::bail!("unknown server role: {other}"),
        }
    }
}

/// How the webhook secret header is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    /// HMAC-SHA256 of the raw body, hex-encoded (GitHub style).
    Signature,
    /// The shared secret itself, sent verbatim (GitLab style).
    Token,
}

/// Storage backend for scopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeBackend {
    #[default]
    Keydb,
    Memory,
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// A string that never shows up in `Debug` output.
///
/// It does serialise in clear, since scopes persist their SSH keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"<redacted>\"")
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub policy_source: PolicySourceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub scopes: ScopesConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:7002`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Only a primary seeds the default scope at startup.
    #[serde(default)]
    pub role: ServerRole,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            role: ServerRole::default(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:7002".to_string()
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    #[serde(default = "default_keydb_endpoint")]
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

impl Default for KeyDbConfig {
    fn default() -> Self {
        Self {
            endpoint: default_keydb_endpoint(),
            tls: false,
            auth_token_env: default_keydb_auth_env(),
        }
    }
}

fn default_keydb_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Policy source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PolicySourceConfig {
    #[serde(default)]
    pub source_type: PolicySourceType,
    /// Legacy single-repo URL. Drives both webhook matching and the default
    /// scope.
    #[serde(default)]
    pub repo_url: Option<String>,
    /// Bundle location when `source_type` is `api`.
    #[serde(default)]
    pub bundle_url: Option<String>,
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    /// Topic signalled when the tracked source changes.
    #[serde(default = "default_webhook_topic")]
    pub webhook_topic: String,
    /// Shared webhook secret. `None` disables webhook authentication.
    #[serde(default)]
    pub webhook_secret: Option<SecretString>,
    /// SSH private key with newlines encoded as `_`.
    #[serde(default)]
    pub ssh_key: Option<SecretString>,
    #[serde(default)]
    pub webhook_params: WebhookParams,
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            source_type: PolicySourceType::default(),
            repo_url: None,
            bundle_url: None,
            manifest_path: default_manifest_path(),
            main_branch: default_main_branch(),
            webhook_topic: default_webhook_topic(),
            webhook_secret: None,
            ssh_key: None,
            webhook_params: WebhookParams::default(),
        }
    }
}

fn default_manifest_path() -> String {
    ".manifest".to_string()
}

fn default_main_branch() -> String {
    "master".to_string()
}

fn default_webhook_topic() -> String {
    "webhook".to_string()
}

/// How to read the secret and the event name out of a provider's webhook.
///
/// Defaults describe GitHub: `X-Hub-Signature-256: sha256=<hex>` and
/// `X-GitHub-Event: push`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookParams {
    #[serde(default = "default_secret_header_name")]
    pub secret_header_name: String,
    /// Applied to the secret header. The second capture group is the secret.
    #[serde(default = "default_secret_parsing_regex")]
    pub secret_parsing_regex: String,
    #[serde(default = "default_secret_type")]
    pub secret_type: SecretType,
    #[serde(default = "default_event_header_name")]
    pub event_header_name: Option<String>,
    #[serde(default)]
    pub event_request_key: Option<String>,
    #[serde(default = "default_push_event_value")]
    pub push_event_value: String,
}

impl Default for WebhookParams {
    fn default() -> Self {
        Self {
            secret_header_name: default_secret_header_name(),
            secret_parsing_regex: default_secret_parsing_regex(),
            secret_type: default_secret_type(),
            event_header_name: default_event_header_name(),
            event_request_key: None,
            push_event_value: default_push_event_value(),
        }
    }
}

fn default_secret_header_name() -> String {
    "x-hub-signature-256".to_string()
}

fn default_secret_parsing_regex() -> String {
    "(sha256=)?(.*)".to_string()
}

fn default_secret_type() -> SecretType {
    SecretType::Signature
}

fn default_event_header_name() -> Option<String> {
    Some("X-GitHub-Event".to_string())
}

fn default_push_event_value() -> String {
    "push".to_string()
}

// ---------------------------------------------------------------------------
// Administrative auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Name of the environment variable that holds the admin bearer token.
    /// Unset variable means admin routes are unauthenticated.
    #[serde(default = "default_admin_token_env")]
    pub admin_token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token_env: default_admin_token_env(),
        }
    }
}

fn default_admin_token_env() -> String {
    "POLICYSYNC_ADMIN_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Data updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_config_route")]
    pub config_route: String,
    #[serde(default = "default_data_update_topic")]
    pub update_topic: String,
    /// Served verbatim to clients; never interpreted here.
    #[serde(default)]
    pub sources: DataSourceConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            config_route: default_data_config_route(),
            update_topic: default_data_update_topic(),
            sources: DataSourceConfig::default(),
        }
    }
}

fn default_data_config_route() -> String {
    "/data/config".to_string()
}

fn default_data_update_topic() -> String {
    "policy_data".to_string()
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ScopesConfig {
    #[serde(default)]
    pub backend: ScopeBackend,
    /// Topic on which fetch workers receive scope sync/delete tasks.
    #[serde(default = "default_scope_sync_topic")]
    pub sync_topic: String,
}

impl Default for ScopesConfig {
    fn default() -> Self {
        Self {
            backend: ScopeBackend::default(),
            sync_topic: default_scope_sync_topic(),
        }
    }
}

fn default_scope_sync_topic() -> String {
    "scope_sync".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file, apply environment overrides
/// and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Overlay the recognised environment options on top of the file config.
///
/// `lookup` abstracts the environment so tests can supply their own.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let source = &mut config.policy_source;

    if let Some(v) = lookup("POLICY_SOURCE_TYPE") {
        source.source_type = v.parse().context("invalid POLICY_SOURCE_TYPE")?;
    }
    if let Some(v) = lookup("POLICY_REPO_URL") {
        source.repo_url = Some(v);
    }
    if let Some(v) = lookup("POLICY_BUNDLE_URL") {
        source.bundle_url = Some(v);
    }
    if let Some(v) = lookup("POLICY_REPO_WEBHOOK_SECRET") {
        source.webhook_secret = Some(SecretString::new(v));
    }
    if let Some(v) = lookup("POLICY_REPO_WEBHOOK_PARAMS") {
        source.webhook_params =
            serde_json::from_str(&v).context("invalid POLICY_REPO_WEBHOOK_PARAMS")?;
    }
    if let Some(v) = lookup("POLICY_REPO_WEBHOOK_TOPIC") {
        source.webhook_topic = v;
    }
    if let Some(v) = lookup("POLICY_REPO_SSH_KEY") {
        source.ssh_key = Some(SecretString::new(v));
    }
    if let Some(v) = lookup("POLICY_REPO_MANIFEST_PATH") {
        source.manifest_path = v;
    }
    if let Some(v) = lookup("POLICY_REPO_MAIN_BRANCH") {
        source.main_branch = v;
    }
    if let Some(v) = lookup("SERVER_ROLE") {
        config.server.role = v.parse().context("invalid SERVER_ROLE")?;
    }
    Ok(())
}

/// Paths the router registers itself. `/scopes` also covers its sub-paths.
const RESERVED_ROUTES: &[&str] = &["/webhook", "/healthz", "/metrics", "/scopes"];

fn is_reserved_route(route: &str) -> bool {
    let route = route.trim_end_matches('/');
    RESERVED_ROUTES.iter().any(|reserved| {
        route == *reserved
            || route
                .strip_prefix(reserved)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Sanity checks that cannot be expressed purely with serde.
///
/// Defects that only affect request handling are logged, not rejected.
fn validate_config(config: &Config) -> Result<()> {
    config
        .server
        .http_listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.server.http_listen))?;

    let source = &config.policy_source;
    regex::Regex::new(&source.webhook_params.secret_parsing_regex)
        .context("invalid webhook secret_parsing_regex")?;

    anyhow::ensure!(
        config.data.config_route.starts_with('/'),
        "data.config_route must start with '/'"
    );
    anyhow::ensure!(
        !is_reserved_route(&config.data.config_route),
        "data.config_route {} collides with a built-in route",
        config.data.config_route
    );
    anyhow::ensure!(
        !config.data.config_route.contains(['{', '}', '*']),
        "data.config_route must be a literal path"
    );
    anyhow::ensure!(
        !source.webhook_topic.is_empty(),
        "policy_source.webhook_topic must not be empty"
    );

    match source.source_type {
        PolicySourceType::Git => {
            let params = &source.webhook_params;
            if params.event_header_name.is_none() && params.event_request_key.is_none() {
                error!(
                    "webhook params set neither event_header_name nor event_request_key; \
                     push events can never be recognised"
                );
            }
            if source.repo_url.is_none() {
                warn!("git policy source has no repo_url; webhooks will never match");
            }
        }
        PolicySourceType::Api => {
            if source.bundle_url.is_none() {
                warn!("api policy source has no bundle_url");
            }
        }
    }
    Ok(())
}
