//! Prometheus metrics for queue workers
//!
//! Every metric carries a `queue` label. Item tags are added as extra labels on the
//! per-item counters: `key:value` tags become `key="value"`. Bare tags, and keyed
//! tags whose key is reserved or already taken, are joined into one `tags` label
//! in their original order.

use metrics::{counter, gauge, Label};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format, or `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    prometheus_handle().map(|h| h.render())
}

/// Label names owned by the worker itself.
const RESERVED_LABELS: [&str; 2] = ["queue", "tags"];

/// Turn item tags into metric labels.
pub fn tag_labels(tags: &[String]) -> Vec<Label> {
    let mut labels: Vec<Label> = Vec::with_capacity(tags.len());
    let mut leftover: Vec<&str> = Vec::new();

    for tag in tags {
        match tag.split_once(':') {
            Some((key, value))
                if !key.is_empty()
                    && !RESERVED_LABELS.contains(&key)
                    && labels.iter().all(|label| label.key() != key) =>
            {
                labels.push(Label::new(key.to_string(), value.to_string()));
            }
            _ => leftover.push(tag),
        }
    }

    if !leftover.is_empty() {
        labels.push(Label::new("tags", leftover.join(",")));
    }
    labels
}

/// Queue worker metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    /// Queue key for labeling
    queue_name: String,
}

impl QueueMetrics {
    /// Create new QueueMetrics
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
        }
    }

    fn labels_with_tags(&self, tags: &[String]) -> Vec<Label> {
        let mut labels = vec![Label::new("queue", self.queue_name.clone())];
        labels.extend(tag_labels(tags));
        labels
    }

    /// Record a batch leaving the transport
    pub fn items_dequeued(&self, count: usize) {
        counter!(
            "queue_processor_total_dequeued",
            "queue" => self.queue_name.clone()
        )
        .increment(count as u64);
    }

    /// Record an item processed successfully
    pub fn item_processed(&self, tags: &[String]) {
        counter!("queue_processor_total_processed", self.labels_with_tags(tags)).increment(1);
    }

    /// Record an item failing
    pub fn item_failed(&self, tags: &[String]) {
        counter!("queue_processor_total_errors", self.labels_with_tags(tags)).increment(1);
    }

    /// Record an item being re-enqueued
    pub fn item_retried(&self) {
        counter!(
            "queue_processor_total_retried",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    /// Record an item dropped after exhausting its retries
    pub fn item_dropped(&self) {
        counter!(
            "queue_processor_total_dropped",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    /// Update the in-flight gauge
    pub fn in_flight(&self, count: u64) {
        gauge!(
            "queue_processor_in_flight",
            "queue" => self.queue_name.clone()
        )
        .set(count as f64);
    }

    /// Update the queue depth gauge
    pub fn queue_depth(&self, depth: u64) {
        gauge!(
            "queue_processor_queue_depth",
            "queue" => self.queue_name.clone()
        )
        .set(depth as f64);
    }

    /// Record a message published on a channel
    pub fn message_published(channel: &str, message_type: &str) {
        counter!(
            "queue_processor_messages_published",
            "channel" => channel.to_string(),
            "type" => message_type.to_string()
        )
        .increment(1);
    }
}
