//! Processor traits
//!
//! Application code plugs into the worker through one of two traits:
//! - [`BatchProcessor`]: receives every dequeued batch as a whole
//! - [`ItemProcessor`]: receives one item at a time, wrapped in [`PerItem`]
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_processor::{ItemProcessor, PerItem, QueueError, QueueItem, QueueWorker};
//!
//! struct ScoreProcessor;
//!
//! #[async_trait]
//! impl ItemProcessor<ScoreJob> for ScoreProcessor {
//!     async fn process(&self, item: &mut QueueItem<ScoreJob>) -> Result<(), QueueError> {
//!         if item.data.is_stale() {
//!             item.mark_failed();
//!         }
//!         Ok(())
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "ScoreProcessor"
//!     }
//! }
//!
//! let worker = QueueWorker::new(transport, PerItem(ScoreProcessor), config);
//! ```

use crate::error::QueueError;
use crate::item::{QueueItem, QueuePayload};
use async_trait::async_trait;

/// Handles whole batches of dequeued items.
///
/// Returning `Err` fails every item of the batch. Individual items can be failed
/// without an error through [`QueueItem::mark_failed`].
#[async_trait]
pub trait BatchProcessor<T: QueuePayload>: Send + Sync {
    /// Process one dequeued batch.
    async fn process_batch(&self, items: &mut [QueueItem<T>]) -> Result<(), QueueError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;
}

/// Handles a single dequeued item.
#[async_trait]
pub trait ItemProcessor<T: QueuePayload>: Send + Sync {
    /// Process one item.
    async fn process(&self, item: &mut QueueItem<T>) -> Result<(), QueueError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;
}

/// Runs an [`ItemProcessor`] over each item of a batch, in arrival order.
///
/// The first error stops the batch and fails all of its items.
pub struct PerItem<P>(pub P);

#[async_trait]
impl<T, P> BatchProcessor<T> for PerItem<P>
where
    T: QueuePayload,
    P: ItemProcessor<T>,
{
    async fn process_batch(&self, items: &mut [QueueItem<T>]) -> Result<(), QueueError> {
        for item in items.iter_mut() {
            self.0.process(item).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.0.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
    }

    struct Recorder {
        seen: Mutex<Vec<u32>>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl ItemProcessor<Job> for Recorder {
        async fn process(&self, item: &mut QueueItem<Job>) -> Result<(), QueueError> {
            self.seen.lock().unwrap().push(item.data.id);
            if self.fail_on == Some(item.data.id) {
                return Err(QueueError::processing("boom"));
            }
            if item.data.id % 2 == 0 {
                item.mark_failed();
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Recorder"
        }
    }

    fn batch(ids: &[u32]) -> Vec<QueueItem<Job>> {
        ids.iter().map(|&id| QueueItem::new(Job { id })).collect()
    }

    #[tokio::test]
    async fn test_per_item_runs_in_order() {
        let processor = PerItem(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let mut items = batch(&[1, 2, 3]);

        processor.process_batch(&mut items).await.unwrap();

        assert_eq!(*processor.0.seen.lock().unwrap(), vec![1, 2, 3]);
        assert!(!items[0].failed);
        assert!(items[1].failed);
        assert_eq!(BatchProcessor::<Job>::name(&processor), "Recorder");
    }

    #[tokio::test]
    async fn test_per_item_stops_at_first_error() {
        let processor = PerItem(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: Some(3),
        });
        let mut items = batch(&[1, 3, 5]);

        let err = processor.process_batch(&mut items).await.unwrap_err();

        assert!(matches!(err, QueueError::Processing(_)));
        assert_eq!(*processor.0.seen.lock().unwrap(), vec![1, 3]);
    }
}
