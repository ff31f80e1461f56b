//! Queue worker engine
//!
//! A single poll loop pops batches off the transport and hands each one to a bounded
//! worker pool. The loop never waits for a batch to finish; it only consults the
//! in-flight count for backpressure. Each item of a finished batch is then resolved:
//!
//! - success: counted as processed, failure streak cleared
//! - failure (error, panic or `failed` flag): counted as an error, reported to the
//!   error hook, and pushed back with `retry_count + 1` until `max_retries` is exceeded
//!
//! On shutdown the loop stops dequeuing and the worker waits until every in-flight
//! item has resolved before returning.

use crate::config::QueueConfig;
use crate::consumer::QueueConsumer;
use crate::error::QueueError;
use crate::item::{QueueItem, QueuePayload};
use crate::metrics::QueueMetrics;
use crate::processor::BatchProcessor;
use crate::producer::QueueProducer;
use crate::shutdown::GracefulShutdown;
use crate::stats::{QueueStats, StatsSnapshot};
use crate::transport::Transport;
use futures::FutureExt;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often the stats reporter samples gauges and logs counters.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between in-flight checks while draining.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Callback invoked for every failed item, with the batch error if there was one.
pub type ErrorHook<T> = Arc<dyn Fn(Option<&QueueError>, &QueueItem<T>) + Send + Sync>;

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Generic queue worker that processes items using a batch processor.
///
/// # Type Parameters
///
/// * `T` - The payload type carried by the queue
/// * `P` - The processor type (must implement `BatchProcessor<T>`)
///
/// # Example
///
/// ```rust,ignore
/// let transport = Arc::new(RedisTransport::connect(&RedisConfig::from_env()?).await?);
/// let worker = QueueWorker::new(transport, PerItem(ScoreProcessor), QueueConfig::from_env()?);
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// worker.run(shutdown_rx).await?;
/// ```
pub struct QueueWorker<T, P>
where
    T: QueuePayload,
    P: BatchProcessor<T>,
{
    config: QueueConfig,
    processor: Arc<P>,
    consumer: QueueConsumer<T>,
    completion: Completion<T>,
    /// Limits concurrently running batches
    pool: Arc<Semaphore>,
    state: watch::Sender<EngineState>,
}

impl<T, P> QueueWorker<T, P>
where
    T: QueuePayload,
    P: BatchProcessor<T> + 'static,
{
    /// Create a new queue worker.
    pub fn new(transport: Arc<dyn Transport>, processor: P, config: QueueConfig) -> Self {
        Self::with_arc_processor(transport, Arc::new(processor), config)
    }

    /// Create a new queue worker with an Arc processor.
    pub fn with_arc_processor(
        transport: Arc<dyn Transport>,
        processor: Arc<P>,
        config: QueueConfig,
    ) -> Self {
        let queue_key = config.queue_key();
        let pool_size = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let (state, _) = watch::channel(EngineState::Idle);

        Self {
            consumer: QueueConsumer::new(transport.clone(), queue_key.clone()),
            completion: Completion {
                producer: QueueProducer::new(transport, queue_key.clone()),
                stats: Arc::new(QueueStats::new()),
                metrics: QueueMetrics::new(queue_key),
                error_hook: None,
                max_retries: config.max_retries,
            },
            processor,
            pool: Arc::new(Semaphore::new(pool_size)),
            state,
            config,
        }
    }

    /// Register a callback for failed items.
    ///
    /// Runs on the worker pool before the item is retried or dropped. The error is
    /// `None` when the item was failed through its `failed` flag.
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&QueueError>, &QueueItem<T>) + Send + Sync + 'static,
    {
        self.completion.error_hook = Some(Arc::new(hook));
        self
    }

    /// Get the worker configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get the logical queue name.
    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// Get the producer for this worker's queue.
    pub fn producer(&self) -> &QueueProducer<T> {
        &self.completion.producer
    }

    /// Enqueue a single item.
    pub async fn push(&self, item: QueueItem<T>) -> Result<(), QueueError> {
        self.completion.producer.push(item).await
    }

    /// Enqueue several items.
    pub async fn push_batch<I>(&self, items: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = QueueItem<T>>,
    {
        self.completion.producer.push_batch(items).await
    }

    /// Get the current queue length.
    pub async fn queue_size(&self) -> Result<u64, QueueError> {
        self.completion.producer.queue_size().await
    }

    /// Remove every pending item.
    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        self.completion.producer.clear().await
    }

    /// Counters of the current (or last) run.
    pub fn stats(&self) -> StatsSnapshot {
        self.completion.stats.snapshot()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Run the worker until `shutdown` reads `true`, Ctrl+C, or SIGTERM.
    ///
    /// Returns once every dequeued item has resolved. Fails with
    /// `ErrorThresholdExceeded` if the failure streak passes the configured threshold,
    /// and with `AlreadyRunning` if another run of this worker is active.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        self.config.validate()?;

        let started = self.state.send_if_modified(|state| match state {
            EngineState::Running | EngineState::Draining => false,
            EngineState::Idle | EngineState::Stopped => {
                *state = EngineState::Running;
                true
            }
        });
        if !started {
            return Err(QueueError::AlreadyRunning);
        }
        let _guard = StopOnDrop(&self.state);

        self.completion.stats.reset();

        info!(
            queue = %self.config.queue_key(),
            processor = %self.processor.name(),
            poll_interval_ms = %self.config.poll_interval_ms,
            max_in_flight = %self.config.max_in_flight,
            max_retries = %self.config.max_retries,
            error_threshold = %self.config.error_threshold,
            batch_size = %self.config.batch_size,
            pool_size = %self.pool.available_permits(),
            "Starting queue worker"
        );

        let shutdown = GracefulShutdown::new(shutdown);
        let reporter = self.spawn_stats_reporter();

        let outcome = self.poll_loop(shutdown.subscribe()).await;

        self.state.send_replace(EngineState::Draining);
        self.drain().await;
        self.state.send_replace(EngineState::Stopped);

        if let Err(e) = reporter.await {
            warn!(error = %e, "Stats reporter ended abnormally");
        }
        self.completion.report_stats().await;

        match &outcome {
            Ok(()) => info!(queue = %self.config.queue_key(), "Queue worker stopped"),
            Err(e) => error!(
                queue = %self.config.queue_key(),
                error = %e,
                "Queue worker aborted"
            ),
        }

        outcome
    }

    async fn poll_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let poll_interval = self.config.poll_interval();
        let stats = &self.completion.stats;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping worker");
                return Ok(());
            }

            let consecutive_errors = stats.consecutive_errors();
            if consecutive_errors > self.config.error_threshold {
                return Err(QueueError::ErrorThresholdExceeded {
                    consecutive_errors,
                    threshold: self.config.error_threshold,
                });
            }

            if stats.in_flight() >= self.config.max_in_flight as u64 {
                pause(&mut shutdown, poll_interval).await;
                continue;
            }

            match self.consumer.dequeue(self.config.batch_size).await {
                Ok(items) if items.is_empty() => pause(&mut shutdown, poll_interval).await,
                Ok(items) => self.dispatch(items),
                Err(e) => {
                    stats.record_consecutive_error();
                    error!(
                        queue = %self.config.queue_key(),
                        error = %e,
                        consecutive_errors = %stats.consecutive_errors(),
                        "Failed to dequeue items"
                    );
                    pause(&mut shutdown, poll_interval).await;
                }
            }
        }
    }

    /// Hand a batch to the worker pool without waiting for it.
    fn dispatch(&self, mut items: Vec<QueueItem<T>>) {
        let count = items.len();
        self.completion.stats.record_dequeued(count);
        self.completion.metrics.items_dequeued(count);
        debug!(queue = %self.config.queue_key(), count = count, "Dequeued batch");

        let processor = Arc::clone(&self.processor);
        let pool = Arc::clone(&self.pool);
        let completion = self.completion.clone();

        tokio::spawn(async move {
            // The pool is never closed, so a permit is always granted eventually.
            let _permit = pool.acquire_owned().await.ok();

            let outcome = AssertUnwindSafe(processor.process_batch(&mut items))
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(QueueError::from_panic(panic)),
            };

            if let Some(e) = &error {
                warn!(
                    processor = %processor.name(),
                    count = count,
                    error = %e,
                    "Batch processing failed"
                );
            }

            completion.complete_batch(items, error).await;
        });
    }

    async fn drain(&self) {
        let mut remaining = self.completion.stats.in_flight();
        while remaining > 0 {
            info!(
                queue = %self.config.queue_key(),
                in_flight = remaining,
                "Waiting for in-flight items to complete"
            );
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
            remaining = self.completion.stats.in_flight();
        }
    }

    /// Sample gauges and log counters every few seconds until the run stops.
    fn spawn_stats_reporter(&self) -> JoinHandle<()> {
        let completion = self.completion.clone();
        let mut state = self.state.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => completion.report_stats().await,
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow() == EngineState::Stopped {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Sleep for `duration`, waking early on a shutdown change.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Marks the worker stopped even if the run future is dropped early.
struct StopOnDrop<'a>(&'a watch::Sender<EngineState>);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(EngineState::Stopped);
    }
}

enum Resolution<T> {
    Processed,
    Retry(QueueItem<T>),
    Dropped,
}

/// Everything a pool task needs to resolve finished items.
struct Completion<T> {
    producer: QueueProducer<T>,
    stats: Arc<QueueStats>,
    metrics: QueueMetrics,
    error_hook: Option<ErrorHook<T>>,
    max_retries: u32,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            stats: self.stats.clone(),
            metrics: self.metrics.clone(),
            error_hook: self.error_hook.clone(),
            max_retries: self.max_retries,
        }
    }
}

impl<T: QueuePayload> Completion<T> {
    async fn complete_batch(&self, items: Vec<QueueItem<T>>, error: Option<QueueError>) {
        for item in items {
            let resolution = self.resolve(item, error.as_ref());
            match resolution {
                Resolution::Processed => {}
                Resolution::Retry(item) => {
                    let retry_count = item.retry_count;
                    match self.producer.push(item).await {
                        Ok(()) => {
                            self.metrics.item_retried();
                            debug!(retry_count = retry_count, "Re-enqueued failed item");
                        }
                        Err(e) => error!(
                            retry_count = retry_count,
                            error = %e,
                            "Failed to re-enqueue item, it is lost"
                        ),
                    }
                    // Counted only once the item is back on the queue, so an idle
                    // worker always sees its retries in the queue.
                    self.stats.record_error();
                }
                Resolution::Dropped => self.stats.record_error(),
            }
        }
    }

    fn resolve(&self, mut item: QueueItem<T>, batch_error: Option<&QueueError>) -> Resolution<T> {
        if batch_error.is_none() && !item.failed {
            self.metrics.item_processed(&item.tags);
            self.stats.record_processed();
            return Resolution::Processed;
        }

        self.metrics.item_failed(&item.tags);
        match batch_error {
            Some(e) => error!(retry_count = item.retry_count, error = %e, "Item failed"),
            None => error!(retry_count = item.retry_count, "Item marked as failed"),
        }

        if let Some(hook) = &self.error_hook {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(batch_error, &item))).is_err() {
                warn!("Error hook panicked");
            }
        }

        item.failed = false;
        item.retry_count += 1;

        if item.retry_count <= self.max_retries {
            Resolution::Retry(item)
        } else {
            self.metrics.item_dropped();
            warn!(
                retry_count = item.retry_count,
                max_retries = self.max_retries,
                item = ?item.data,
                "Item exceeded max retries, dropping"
            );
            Resolution::Dropped
        }
    }

    async fn report_stats(&self) {
        let snapshot = self.stats.snapshot();
        self.metrics.in_flight(snapshot.in_flight);

        let queue_size = match self.producer.queue_size().await {
            Ok(size) => {
                self.metrics.queue_depth(size);
                Some(size)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read queue size");
                None
            }
        };

        info!(
            queue = %self.producer.queue_key(),
            dequeued = snapshot.dequeued,
            processed = snapshot.processed,
            errors = snapshot.errors,
            consecutive_errors = snapshot.consecutive_errors,
            in_flight = snapshot.in_flight,
            queue_size = ?queue_size,
            "Queue stats"
        );
    }
}
