//! Queue item envelope
//!
//! Wraps a domain payload with the metadata the worker needs to retry it and to label
//! its telemetry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Bound for payload types carried through a queue.
///
/// Payloads are flattened into the envelope on the wire, so they must serialize as
/// JSON objects (structs or maps).
pub trait QueuePayload: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {}

impl<T> QueuePayload for T where T: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {}

/// A queue entry: the payload plus retry and telemetry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem<T> {
    /// The domain payload
    #[serde(flatten)]
    pub data: T,

    /// Attempts already made. Only the worker changes this.
    #[serde(default)]
    pub retry_count: u32,

    /// Opaque labels forwarded to telemetry (`key:value` or bare)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Set by a handler to fail the item without returning an error.
    /// Process-local; never written to the transport.
    #[serde(skip)]
    pub failed: bool,
}

impl<T> QueueItem<T> {
    /// Wrap a payload as a fresh item
    pub fn new(data: T) -> Self {
        Self {
            data,
            retry_count: 0,
            tags: Vec::new(),
            failed: false,
        }
    }

    /// Attach telemetry tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Mark this item as failed without raising an error
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Check if this item has been delivered before
    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }
}

impl<T> From<T> for QueueItem<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}
