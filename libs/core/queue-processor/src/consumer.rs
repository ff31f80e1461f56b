//! Queue consumer
//!
//! Pops raw entries off the transport and turns them into typed items.

use crate::error::QueueError;
use crate::item::{QueueItem, QueuePayload};
use crate::transport::Transport;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{error, warn};

/// Typed consumer for one queue.
pub struct QueueConsumer<T> {
    transport: Arc<dyn Transport>,
    queue_key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T: QueuePayload> QueueConsumer<T> {
    /// Create a new QueueConsumer
    pub fn new(transport: Arc<dyn Transport>, queue_key: impl Into<String>) -> Self {
        Self {
            transport,
            queue_key: queue_key.into(),
            _payload: PhantomData,
        }
    }

    /// Get the queue key
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Pop up to `count` items.
    ///
    /// Blank entries are skipped. If any entry fails to decode (invalid JSON or
    /// invalid UTF-8), the well-formed entries of the same pop are pushed back onto
    /// the queue and a `Serialization` error is returned; the malformed entries are
    /// discarded.
    pub async fn dequeue(&self, count: usize) -> Result<Vec<QueueItem<T>>, QueueError> {
        let raw = self.transport.pop(&self.queue_key, count).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = Vec::with_capacity(raw.len());
        let mut valid_raw = Vec::with_capacity(raw.len());
        let mut first_error = None;

        for entry in raw {
            if entry.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<QueueItem<T>>(&entry) {
                Ok(item) => {
                    items.push(item);
                    valid_raw.push(entry);
                }
                Err(e) => {
                    error!(
                        queue = %self.queue_key,
                        entry = %String::from_utf8_lossy(&entry),
                        error = %e,
                        "Failed to deserialize queue entry"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(e) = first_error else {
            return Ok(items);
        };

        if !valid_raw.is_empty() {
            warn!(
                queue = %self.queue_key,
                count = valid_raw.len(),
                "Returning well-formed entries to the queue"
            );
            self.transport.push(&self.queue_key, valid_raw).await?;
        }

        Err(e.into())
    }
}

impl<T> Clone for QueueConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            queue_key: self.queue_key.clone(),
            _payload: PhantomData,
        }
    }
}
