use std::collections::HashMap;

use anyhow::{Context, Result};
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::CustomCommand;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::Scope;

/// Upsert-by-id storage for scopes.
///
/// `put` must replace the whole scope atomically: a concurrent reader sees
/// either the old value or the new one, never a mix.
#[async_trait::async_trait]
pub trait ScopeRepository: Send + Sync {
    async fn all(&self) -> Result<Vec<Scope>>;

    async fn get(&self, scope_id: &str) -> Result<Option<Scope>>;

    async fn put(&self, scope: Scope) -> Result<()>;

    /// Returns whether the scope existed.
    async fn delete(&self, scope_id: &str) -> Result<bool>;

    /// Cheap liveness check for `/healthz`.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// KeyDB
// ---------------------------------------------------------------------------

const KEY_PREFIX: &str = "policysync:scope:";

fn scope_key(scope_id: &str) -> String {
    format!("{KEY_PREFIX}{scope_id}")
}

/// Scopes stored as one JSON string per key. `SET` replaces the value in a
/// single command, so writers never interleave.
pub struct KeyDbScopeRepository {
    pool: fred::clients::Pool,
}

impl KeyDbScopeRepository {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScopeRepository for KeyDbScopeRepository {
    /// Uses `KEYS`; scope counts are small.
    async fn all(&self) -> Result<Vec<Scope>> {
        let pattern = format!("{KEY_PREFIX}*");
        let keys: Vec<String> = self
            .pool
            .custom(
                CustomCommand::new_static("KEYS", None::<u16>, false),
                vec![pattern.clone()],
            )
            .await
            .with_context(|| format!("KEYS {pattern}"))?;

        let mut scopes = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(scope_id) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            // A scope deleted between KEYS and GET is simply skipped.
            if let Some(scope) = self.get(scope_id).await? {
                scopes.push(scope);
            }
        }
        debug!(count = scopes.len(), "listed scopes");
        Ok(scopes)
    }

    async fn get(&self, scope_id: &str) -> Result<Option<Scope>> {
        let key = scope_key(scope_id);
        let raw: Option<String> = self.pool.get(&key).await.context("GET scope")?;
        let Some(raw) = raw else {
            trace!(%scope_id, "scope not found");
            return Ok(None);
        };
        let scope = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt scope record at {key}"))?;
        Ok(Some(scope))
    }

    async fn put(&self, scope: Scope) -> Result<()> {
        let key = scope_key(&scope.scope_id);
        let json = serde_json::to_string(&scope).context("failed to serialise scope")?;
        let _: () = self
            .pool
            .set(&key, json, None, None, false)
            .await
            .context("SET scope")?;
        debug!(scope_id = %scope.scope_id, "scope written");
        Ok(())
    }

    async fn delete(&self, scope_id: &str) -> Result<bool> {
        let removed: i64 = self
            .pool
            .del(scope_key(scope_id))
            .await
            .context("DEL scope")?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("KeyDB PING failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryScopeRepository {
    scopes: RwLock<HashMap<String, Scope>>,
}

impl MemoryScopeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ScopeRepository for MemoryScopeRepository {
    async fn all(&self) -> Result<Vec<Scope>> {
        let mut scopes: Vec<Scope> = self.scopes.read().await.values().cloned().collect();
        scopes.sort_by(|a, b| a.scope_id.cmp(&b.scope_id));
        Ok(scopes)
    }

    async fn get(&self, scope_id: &str) -> Result<Option<Scope>> {
        Ok(self.scopes.read().await.get(scope_id).cloned())
    }

    async fn put(&self, scope: Scope) -> Result<()> {
        self.scopes
            .write()
            .await
            .insert(scope.scope_id.clone(), scope);
        Ok(())
    }

    async fn delete(&self, scope_id: &str) -> Result<bool> {
        Ok(self.scopes.write().await.remove(scope_id).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
