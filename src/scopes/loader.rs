//! Startup seeding of the `default` scope from the legacy single-repo
//! options (`POLICY_REPO_URL` and friends).

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{
    AuthData, GitPolicyScopeSource, PolicySource, Scope, ScopeRepository, SshAuthData,
};
use crate::config::{Config, SecretString, ServerRole};
use crate::data::DataSourceConfig;

pub const DEFAULT_SCOPE_ID: &str = "default";

/// Seed the default scope. Runs once, before any request is served.
///
/// Only a primary writes; replicas must not race it. Re-running on every
/// primary start just overwrites the same record. Returns the scope written,
/// if any.
pub async fn load_scopes(config: &Config, repo: &dyn ScopeRepository) -> Result<Option<Scope>> {
    if config.server.role != ServerRole::Primary {
        debug!(role = ?config.server.role, "not primary, skipping default scope");
        return Ok(None);
    }
    info!("server is primary, loading default scope");

    let source = &config.policy_source;
    let Some(url) = &source.repo_url else {
        debug!("no legacy repo url configured");
        return Ok(None);
    };
    info!(%url, "adding default scope from config");

    let auth = match &source.ssh_key {
        Some(key) => AuthData::Ssh(SshAuthData {
            username: "git".to_string(),
            private_key: SecretString::new(restore_ssh_key(key.expose())),
        }),
        None => AuthData::None,
    };

    let scope = Scope {
        scope_id: DEFAULT_SCOPE_ID.to_string(),
        policy: PolicySource::Git(GitPolicyScopeSource {
            url: url.clone(),
            manifest_path: source.manifest_path.clone(),
            branch: source.main_branch.clone(),
            auth,
        }),
        data: DataSourceConfig::default(),
    };

    repo.put(scope.clone())
        .await
        .context("failed to store default scope")?;
    Ok(Some(scope))
}

/// Undo the env-safe encoding of an SSH key: every `_` was a newline, and
/// the key must end with one.
fn restore_ssh_key(encoded: &str) -> String {
    let mut key = encoded.replace('_', "\n");
    if !key.ends_with('\n') {
        key.push('\n');
    }
    key
}
