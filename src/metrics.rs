use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub outcome: WebhookOutcome,
}

/// Final disposition of a webhook request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Matched and published.
    Published,
    /// Matched, but not a push event.
    Acknowledged,
    /// Did not mention the tracked repository.
    Ignored,
    Unauthorized,
    Rejected,
    Failed,
}

impl WebhookOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Acknowledged => "acknowledged",
            Self::Ignored => "ignored",
            Self::Unauthorized => "unauthorized",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl EncodeLabelValue for WebhookOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TopicLabels {
    pub topic: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the server.
pub struct Metrics {
    pub webhook_requests_total: Family<WebhookLabels, Counter>,
    pub publish_total: Family<TopicLabels, Counter>,
    pub publish_failures_total: Family<TopicLabels, Counter>,
    pub scope_writes_total: Counter,
    pub data_updates_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let webhook_requests_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "policysync_webhook_requests",
            "Webhook requests by outcome",
            webhook_requests_total.clone(),
        );

        let publish_total = Family::<TopicLabels, Counter>::default();
        registry.register(
            "policysync_publish",
            "Notifications accepted by the pub/sub channel",
            publish_total.clone(),
        );

        let publish_failures_total = Family::<TopicLabels, Counter>::default();
        registry.register(
            "policysync_publish_failures",
            "Notifications rejected by the pub/sub channel",
            publish_failures_total.clone(),
        );

        let scope_writes_total = Counter::default();
        registry.register(
            "policysync_scope_writes",
            "Scope upserts",
            scope_writes_total.clone(),
        );

        let data_updates_total = Counter::default();
        registry.register(
            "policysync_data_updates",
            "Administrative data update triggers",
            data_updates_total.clone(),
        );

        Self {
            webhook_requests_total,
            publish_total,
            publish_failures_total,
            scope_writes_total,
            data_updates_total,
        }
    }

    pub fn record_webhook(&self, outcome: WebhookOutcome) {
        self.webhook_requests_total
            .get_or_create(&WebhookLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
