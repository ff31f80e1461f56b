//! Change-log watcher
//!
//! Polls a [`ChangeLogSource`] for rows past a cursor and reports them in order. The
//! next poll is scheduled only after the previous one settles (fixed delay, not a
//! fixed rate), so polls never overlap. Poll errors are logged and retried after a
//! short delay; they never stop the watcher.
//!
//! # Example
//!
//! ```rust,ignore
//! let source = PgChangeLog::connect(&DatabaseConfig::from_env()?, ChangeLogTable::default()).await?;
//! let handle = ChangeWatcher::new(source)
//!     .with_poll_interval(Duration::from_secs(5))
//!     .start(|batch| info!(ids = ?batch.resource_ids, "Resources changed"))
//!     .await?;
//!
//! // later
//! handle.shutdown().await;
//! ```

use crate::change_log::ChangeLogSource;
use crate::error::QueueError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resource ids reported by one poll, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub resource_ids: Vec<i64>,
    /// Highest sequence id in the batch; the cursor after this poll.
    pub last_sequence_id: i64,
}

/// Cursor-based change-log poller.
pub struct ChangeWatcher<S> {
    source: Arc<S>,
    poll_interval: Duration,
    limit: usize,
    error_delay: Duration,
}

impl<S: ChangeLogSource + 'static> ChangeWatcher<S> {
    pub fn new(source: S) -> Self {
        Self::from_arc(Arc::new(source))
    }

    /// Create from an Arc source (for sharing it with other readers).
    pub fn from_arc(source: Arc<S>) -> Self {
        Self {
            source,
            poll_interval: Duration::from_secs(10),
            limit: 50,
            error_delay: Duration::from_secs(1),
        }
    }

    /// Delay between a settled poll and the next one.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Maximum rows reported per poll.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Delay before polling again after a failed poll.
    pub fn with_error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Current end of the log, used as the starting cursor.
    pub async fn seed(&self) -> Result<i64, QueueError> {
        let cursor = self.source.latest_sequence_id().await?;
        debug!(cursor = cursor, "Seeded change watcher");
        Ok(cursor)
    }

    /// Read the rows after `cursor` once. `None` when there is nothing new.
    pub async fn poll_once(&self, cursor: i64) -> Result<Option<ChangeBatch>, QueueError> {
        poll(self.source.as_ref(), cursor, self.limit).await
    }

    /// Seed from the current end of the log, then poll in the background.
    pub async fn start<F>(&self, callback: F) -> Result<WatcherHandle, QueueError>
    where
        F: FnMut(ChangeBatch) + Send + 'static,
    {
        let cursor = self.seed().await?;
        Ok(self.start_polling(cursor, callback))
    }

    /// Poll in the background starting after `initial_cursor`.
    ///
    /// `callback` runs on the polling task, once per non-empty poll. A panicking
    /// callback is logged and polling carries on after the error delay.
    pub fn start_polling<F>(&self, initial_cursor: i64, mut callback: F) -> WatcherHandle
    where
        F: FnMut(ChangeBatch) + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cursor = Arc::new(AtomicI64::new(initial_cursor));

        let source = self.source.clone();
        let shared_cursor = cursor.clone();
        let poll_interval = self.poll_interval;
        let error_delay = self.error_delay;
        let limit = self.limit;

        info!(
            cursor = initial_cursor,
            poll_interval_ms = poll_interval.as_millis() as u64,
            limit = limit,
            "Starting change watcher"
        );

        let task = tokio::spawn(async move {
            let mut current = initial_cursor;

            loop {
                let polled = tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    result = poll(source.as_ref(), current, limit) => result,
                };

                let delay = match polled {
                    Ok(Some(batch)) => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        current = batch.last_sequence_id;
                        shared_cursor.store(current, Ordering::SeqCst);

                        // The batch counts as delivered even if the callback panics.
                        match panic::catch_unwind(AssertUnwindSafe(|| callback(batch))) {
                            Ok(()) => poll_interval,
                            Err(_) => {
                                warn!(cursor = current, "Change watcher callback panicked");
                                error_delay
                            }
                        }
                    }
                    Ok(None) => poll_interval,
                    Err(e) => {
                        warn!(cursor = current, error = %e, "Change-log poll failed");
                        error_delay
                    }
                };

                tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            debug!(cursor = current, "Change watcher stopped");
        });

        WatcherHandle {
            stop: stop_tx,
            task: Some(task),
            cursor,
        }
    }
}

async fn poll<S: ChangeLogSource + ?Sized>(
    source: &S,
    cursor: i64,
    limit: usize,
) -> Result<Option<ChangeBatch>, QueueError> {
    let entries = source.entries_after(cursor, limit).await?;

    let Some(last) = entries.last() else {
        return Ok(None);
    };

    Ok(Some(ChangeBatch {
        last_sequence_id: last.sequence_id,
        resource_ids: entries.iter().map(|e| e.resource_id).collect(),
    }))
}

/// Resolves once a stop is requested or the handle is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to a running watcher. Dropping it stops polling.
pub struct WatcherHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    cursor: Arc<AtomicI64>,
}

impl WatcherHandle {
    /// Stop polling. No poll starts and no callback runs after this returns,
    /// except a callback already executing.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop polling and wait for the polling task to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Change watcher task ended abnormally");
            }
        }
    }

    /// Sequence id of the last reported row.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}
