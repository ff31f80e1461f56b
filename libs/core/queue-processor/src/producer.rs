//! Queue producer for item enqueuing
//!
//! Typed producer over a [`Transport`]. Workers hold one internally, and producer-only
//! services can build their own against the same queue key.
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_processor::{QueueItem, QueueProducer, RedisTransport};
//!
//! let transport = Arc::new(RedisTransport::connect(&redis_config).await?);
//! let producer = QueueProducer::<ScoreJob>::new(transport, "queue:scores");
//!
//! producer.push(QueueItem::new(job).with_tags(["ruleset:mania"])).await?;
//! ```

use crate::error::QueueError;
use crate::item::{QueueItem, QueuePayload};
use crate::metrics::QueueMetrics;
use crate::transport::Transport;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Typed producer for one queue.
pub struct QueueProducer<T> {
    transport: Arc<dyn Transport>,
    queue_key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T: QueuePayload> QueueProducer<T> {
    /// Create a new QueueProducer for a full queue key (`<prefix>:<name>`).
    pub fn new(transport: Arc<dyn Transport>, queue_key: impl Into<String>) -> Self {
        Self {
            transport,
            queue_key: queue_key.into(),
            _payload: PhantomData,
        }
    }

    /// Get the queue key.
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Enqueue a single item.
    pub async fn push(&self, item: QueueItem<T>) -> Result<(), QueueError> {
        let entry = serde_json::to_vec(&item)?;
        self.transport.push(&self.queue_key, vec![entry]).await?;

        debug!(queue = %self.queue_key, retry_count = item.retry_count, "Enqueued item");
        Ok(())
    }

    /// Wrap a payload in a fresh item and enqueue it.
    pub async fn send(&self, data: T) -> Result<(), QueueError> {
        self.push(QueueItem::new(data)).await
    }

    /// Enqueue several items with one transport call, preserving their order.
    pub async fn push_batch<I>(&self, items: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = QueueItem<T>>,
    {
        let entries = items
            .into_iter()
            .map(|item| serde_json::to_vec(&item))
            .collect::<Result<Vec<_>, _>>()?;

        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len();
        self.transport.push(&self.queue_key, entries).await?;

        debug!(queue = %self.queue_key, count = count, "Enqueued batch of items");
        Ok(())
    }

    /// Get the current queue length.
    pub async fn queue_size(&self) -> Result<u64, QueueError> {
        self.transport.len(&self.queue_key).await
    }

    /// Remove every pending item.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.transport.clear(&self.queue_key).await?;
        debug!(queue = %self.queue_key, "Cleared queue");
        Ok(())
    }

    /// Publish a JSON message on a broadcast channel.
    pub async fn publish<M: Serialize>(&self, channel: &str, message: &M) -> Result<(), QueueError> {
        let json = serde_json::to_string(message)?;
        self.transport.publish(channel, json).await?;

        QueueMetrics::message_published(channel, short_type_name::<M>());
        Ok(())
    }
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            queue_key: self.queue_key.clone(),
            _payload: PhantomData,
        }
    }
}

/// `my_crate::models::ScoreUpdate` -> `ScoreUpdate`
fn short_type_name<M>() -> &'static str {
    let full = std::any::type_name::<M>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
