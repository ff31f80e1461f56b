//! Queue Processor
//!
//! A Redis list-backed work queue engine with a change-log watcher.
//!
//! ## Features
//!
//! - **Generic worker**: `QueueWorker<T, P>` processes any serializable payload
//! - **Bounded concurrency**: batches run on a worker pool, with an in-flight ceiling
//! - **Retries**: failed items go back on the queue until `max_retries` is exceeded
//! - **Failure threshold**: too many consecutive failures abort the run
//! - **Graceful drain**: Ctrl+C, SIGTERM or the caller's signal stop dequeuing, and
//!   the worker waits for in-flight items before returning
//! - **Prometheus metrics**: per-queue counters and gauges, labelled by item tags
//! - **Health endpoints**: Axum router with liveness, readiness and `/metrics`
//! - **Change watcher**: cursor-based polling of an append-only change-log table
//!
//! ## Example
//!
//! ```ignore
//! use queue_processor::{ItemProcessor, PerItem, QueueConfig, QueueItem, QueueWorker, RedisTransport};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ScoreJob { score_id: u64 }
//!
//! struct ScoreProcessor;
//!
//! #[async_trait]
//! impl ItemProcessor<ScoreJob> for ScoreProcessor {
//!     async fn process(&self, item: &mut QueueItem<ScoreJob>) -> Result<(), QueueError> {
//!         /* ... */
//!         Ok(())
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "ScoreProcessor"
//!     }
//! }
//!
//! let transport = Arc::new(RedisTransport::connect(&RedisConfig::from_env()?).await?);
//! let worker = QueueWorker::new(transport, PerItem(ScoreProcessor), QueueConfig::from_env()?);
//! worker.run(shutdown_rx).await?;
//! ```

mod change_log;
mod config;
mod consumer;
mod error;
mod health;
mod item;
pub mod metrics;
mod processor;
mod producer;
mod redis_transport;
mod retry;
mod shutdown;
mod stats;
mod transport;
mod watcher;
mod worker;

// Re-export main types
pub use change_log::{ChangeLogEntry, ChangeLogSource, ChangeLogTable, MemoryChangeLog, PgChangeLog};
pub use config::{QueueConfig, DEFAULT_QUEUE_PREFIX};
pub use consumer::QueueConsumer;
pub use error::QueueError;
pub use health::{health_handler, health_router, metrics_handler, ready_handler, HealthResponse, HealthState};
pub use item::{QueueItem, QueuePayload};
pub use metrics::{init_metrics, render_metrics, QueueMetrics};
pub use processor::{BatchProcessor, ItemProcessor, PerItem};
pub use producer::QueueProducer;
pub use redis_transport::{
    connect as connect_redis, connect_with_retry as connect_redis_with_retry, RedisTransport,
};
pub use retry::{retry_with_backoff, RetryConfig};
pub use shutdown::GracefulShutdown;
pub use stats::{QueueStats, StatsSnapshot};
pub use transport::{MemoryTransport, Transport};
pub use watcher::{ChangeBatch, ChangeWatcher, WatcherHandle};
pub use worker::{EngineState, ErrorHook, QueueWorker};
