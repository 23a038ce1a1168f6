//! Data update trigger surface.
//!
//! Administrative callers use this to tell data-layer clients that they
//! should refetch. Neither the source configuration nor the update body is
//! interpreted here; both are opaque JSON blobs owned by the clients.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordination::pubsub::{publish_detached, Publisher};

/// Static description of where clients fetch data from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSourceConfig(pub serde_json::Value);

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }
}

/// An update event sent by an administrative caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataUpdate(pub serde_json::Value);

/// Serves the data source configuration and triggers data update
/// notifications.
pub struct DataUpdatePublisher {
    sources: DataSourceConfig,
    topic: String,
    publisher: Arc<dyn Publisher>,
}

impl DataUpdatePublisher {
    pub fn new(sources: DataSourceConfig, topic: String, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            sources,
            topic,
            publisher,
        }
    }

    pub fn get_source_config(&self) -> &DataSourceConfig {
        &self.sources
    }

    /// Forward `update` to subscribers exactly as received.
    pub async fn publish_update(&self, update: &DataUpdate) -> Result<()> {
        let payload =
            serde_json::to_string(&update.0).context("failed to serialise data update")?;
        info!(topic = %self.topic, "publishing received data update event");
        publish_detached(Arc::clone(&self.publisher), self.topic.clone(), Some(payload)).await
    }
}
