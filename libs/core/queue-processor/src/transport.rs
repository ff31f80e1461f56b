//! Queue transport abstraction
//!
//! A transport is a set of named FIFO lists shared between producers and workers.
//! Entries are pushed onto the head of a list and popped from its tail, which gives
//! insertion-order delivery across the whole list. Every popped entry is handed out
//! exactly once, even with many concurrent consumers.
//!
//! Implementations:
//! - [`RedisTransport`](crate::RedisTransport): `LPUSH` / `RPOP key count`
//! - [`MemoryTransport`]: in-process lists for tests and local tooling

use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Raw list operations the worker needs from a queue backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append entries to the head of the list, in order.
    async fn push(&self, queue: &str, entries: Vec<Vec<u8>>) -> Result<(), QueueError>;

    /// Atomically remove up to `max_count` entries from the tail.
    ///
    /// Entries come back as raw bytes; decoding is left to the caller so one bad
    /// entry cannot fail the whole pop after it has left the list. A missing or
    /// empty list yields an empty vector, not an error.
    async fn pop(&self, queue: &str, max_count: usize) -> Result<Vec<Vec<u8>>, QueueError>;

    /// Number of entries currently in the list.
    async fn len(&self, queue: &str) -> Result<u64, QueueError>;

    /// Remove the list entirely.
    async fn clear(&self, queue: &str) -> Result<(), QueueError>;

    /// Publish a message on a broadcast channel.
    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// In-process transport backed by `VecDeque`s.
///
/// Cloning is not supported; share it behind an `Arc` so producers and workers see
/// the same lists.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far, as `(channel, message)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    fn lists(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<Vec<u8>>>>, QueueError> {
        self.lists
            .lock()
            .map_err(|_| QueueError::transport("memory transport lock poisoned"))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn push(&self, queue: &str, entries: Vec<Vec<u8>>) -> Result<(), QueueError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut lists = self.lists()?;
        let list = lists.entry(queue.to_string()).or_default();
        for entry in entries {
            list.push_front(entry);
        }
        Ok(())
    }

    async fn pop(&self, queue: &str, max_count: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        let mut lists = self.lists()?;
        let Some(list) = lists.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let take = max_count.min(list.len());
        let popped: Vec<Vec<u8>> = (0..take).filter_map(|_| list.pop_back()).collect();

        // Redis deletes a list once its last element is gone.
        if list.is_empty() {
            lists.remove(queue);
        }

        Ok(popped)
    }

    async fn len(&self, queue: &str) -> Result<u64, QueueError> {
        let lists = self.lists()?;
        Ok(lists.get(queue).map_or(0, |list| list.len() as u64))
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        self.lists()?.remove(queue);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError> {
        self.published
            .lock()
            .map_err(|_| QueueError::transport("memory transport lock poisoned"))?
            .push((channel.to_string(), message));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
