use std::sync::Arc;

use anyhow::{Context, Result};
use fred::interfaces::PubsubInterface;
use tracing::{debug, info};

use crate::metrics::{MetricsRegistry, TopicLabels};

/// Capability to signal a topic to every subscribed policy client.
///
/// Delivery is at-most-once: an `Ok` means the channel accepted the message,
/// not that any subscriber received it.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Publish on `topic`. Without a payload subscribers receive the topic
    /// name itself, which is enough to trigger a refetch.
    async fn publish(&self, topic: &str, payload: Option<&str>) -> Result<()>;
}

/// Channel name for a topic.
pub fn topic_channel(topic: &str) -> String {
    format!("policysync:topic:{topic}")
}

// ---------------------------------------------------------------------------
// KeyDB
// ---------------------------------------------------------------------------

/// [`Publisher`] backed by KeyDB `PUBLISH`.
pub struct KeyDbPublisher {
    pool: fred::clients::Pool,
}

impl KeyDbPublisher {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Publisher for KeyDbPublisher {
    /// Uses `pool.next()` to get a `Client` since `Pool` does not implement
    /// `PubsubInterface` in fred v10.
    async fn publish(&self, topic: &str, payload: Option<&str>) -> Result<()> {
        let channel = topic_channel(topic);
        let message = payload.unwrap_or(topic);
        let receivers: i64 = self
            .pool
            .next()
            .publish(&channel, message)
            .await
            .with_context(|| format!("PUBLISH to {channel}"))?;
        debug!(%topic, receivers, "published notification");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metrics decorator
// ---------------------------------------------------------------------------

/// Counts publishes and publish failures per topic.
pub struct MeteredPublisher {
    inner: Arc<dyn Publisher>,
    metrics: MetricsRegistry,
}

impl MeteredPublisher {
    pub fn new(inner: Arc<dyn Publisher>, metrics: MetricsRegistry) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait::async_trait]
impl Publisher for MeteredPublisher {
    async fn publish(&self, topic: &str, payload: Option<&str>) -> Result<()> {
        let labels = TopicLabels {
            topic: topic.to_string(),
        };
        let result = self.inner.publish(topic, payload).await;
        match result {
            Ok(()) => self.metrics.metrics.publish_total.get_or_create(&labels).inc(),
            Err(_) => self
                .metrics
                .metrics
                .publish_failures_total
                .get_or_create(&labels)
                .inc(),
        };
        result
    }
}

// ---------------------------------------------------------------------------
// Detached publish
// ---------------------------------------------------------------------------

/// Publish on a spawned task and wait for it.
///
/// If the awaiting request future is dropped (client hung up) the spawned
/// publish still runs to completion. Errors from the channel are returned to
/// the caller.
pub async fn publish_detached(
    publisher: Arc<dyn Publisher>,
    topic: String,
    payload: Option<String>,
) -> Result<()> {
    let handle = tokio::spawn(async move {
        let result = publisher.publish(&topic, payload.as_deref()).await;
        if result.is_ok() {
            info!(%topic, "topic notified");
        }
        result
    });
    handle.await.context("publish task panicked")?
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::test_support::RecordingPublisher;
    use super::*;

    #[test]
    fn test_topic_channel() {
        assert_eq!(topic_channel("webhook"), "policysync:topic:webhook");
    }

    #[tokio::test]
    async fn test_publish_detached_delivers() {
        let recorder = Arc::new(RecordingPublisher::default());
        publish_detached(recorder.clone(), "webhook".into(), None)
            .await
            .unwrap();
        assert_eq!(recorder.calls(), vec![("webhook".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_publish_detached_completes_after_caller_is_dropped() {
        let recorder = Arc::new(RecordingPublisher::slow(Duration::from_millis(100)));

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            publish_detached(recorder.clone(), "webhook".into(), None),
        )
        .await;
        assert!(gave_up.is_err());
        assert!(recorder.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(recorder.calls(), vec![("webhook".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_publish_detached_propagates_failure() {
        let recorder = Arc::new(RecordingPublisher::failing());
        let err = publish_detached(recorder, "webhook".into(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel rejected"));
    }

    #[tokio::test]
    async fn test_metered_publisher_counts_outcomes() {
        let metrics = MetricsRegistry::new();
        let labels = TopicLabels {
            topic: "webhook".into(),
        };

        let ok = MeteredPublisher::new(Arc::new(RecordingPublisher::default()), metrics.clone());
        ok.publish("webhook", None).await.unwrap();
        ok.publish("webhook", Some("{}")).await.unwrap();

        let failing =
            MeteredPublisher::new(Arc::new(RecordingPublisher::failing()), metrics.clone());
        assert!(failing.publish("webhook", None).await.is_err());

        assert_eq!(
            metrics.metrics.publish_total.get_or_create(&labels).get(),
            2
        );
        assert_eq!(
            metrics
                .metrics
                .publish_failures_total
                .get_or_create(&labels)
                .get(),
            1
        );
    }
}
