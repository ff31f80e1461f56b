//! Test Queue Processor
//!
//! A demo worker that feeds its own queue with fake items and processes them.
//!
//! ## Architecture
//!
//! ```text
//! interval (every --push-interval-ms)
//!   ↓ LPUSH queue:<name>
//! Redis list (or in-process list with --memory)
//!   ↓ RPOP queue:<name> <batch size>
//! QueueWorker<FakeData, PerItem<LoggingProcessor>>
//! ```
//!
//! Health, readiness and Prometheus metrics are served on `--metrics-port`
//! (`/health`, `/ready`, `/metrics`).
//!
//! Runs until Ctrl+C or SIGTERM. Exits non-zero if the worker aborts on its
//! consecutive error threshold.

use async_trait::async_trait;
use axum::Router;
use clap::Parser;
use core_config::redis::RedisConfig;
use core_config::tracing::init_tracing;
use core_config::{Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use queue_processor::{
    connect_redis_with_retry, health_router, init_metrics, HealthState, ItemProcessor,
    MemoryTransport, PerItem, QueueConfig, QueueError, QueueItem, QueueProducer, QueueWorker,
    RedisTransport, Transport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "test-queue-processor")]
#[command(about = "Push fake items onto a queue and process them")]
pub struct Cli {
    /// Queue name (overrides QUEUE_NAME)
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Redis URL (overrides REDIS_URL / REDIS_HOST)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Delay between generated items, in milliseconds
    #[arg(long, default_value_t = 20)]
    pub push_interval_ms: u64,

    /// Use an in-process queue instead of Redis
    #[arg(long)]
    pub memory: bool,

    /// Port for the health and metrics server
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,
}

/// Payload generated by the demo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeData {
    pub data: Uuid,
}

impl FakeData {
    pub fn new() -> Self {
        Self {
            data: Uuid::new_v4(),
        }
    }
}

impl Default for FakeData {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every item it receives.
pub struct LoggingProcessor;

#[async_trait]
impl ItemProcessor<FakeData> for LoggingProcessor {
    async fn process(&self, item: &mut QueueItem<FakeData>) -> Result<(), QueueError> {
        info!(
            data = %item.data.data,
            retry_count = item.retry_count,
            "Processed item"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingProcessor"
    }
}

/// Build the queue configuration from the environment and CLI overrides.
pub fn queue_config(cli: &Cli) -> Result<QueueConfig> {
    let mut config = QueueConfig::from_env().wrap_err("Failed to load queue configuration")?;
    if let Some(queue) = &cli.queue {
        config.queue_name = queue.clone();
    }
    config.validate().map_err(|e| eyre!("{}", e))?;
    Ok(config)
}

async fn transport(cli: &Cli) -> Result<Arc<dyn Transport>> {
    if cli.memory {
        info!("Using in-process queue");
        return Ok(Arc::new(MemoryTransport::new()));
    }

    let redis_config = match &cli.redis_url {
        Some(url) => RedisConfig::new(url.as_str()),
        None => RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?,
    };

    info!("Connecting to Redis...");
    let redis = connect_redis_with_retry(&redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    Ok(Arc::new(RedisTransport::new(redis)))
}

/// Start the health and metrics HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health and metrics server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Push a fresh fake item every `interval` until aborted.
fn spawn_pusher(producer: QueueProducer<FakeData>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let item = FakeData::new();
            match producer.send(item.clone()).await {
                Ok(()) => debug!(data = %item.data, "Pushed item"),
                Err(e) => warn!(error = %e, "Failed to push item"),
            }
        }
    })
}

/// Run the demo worker
pub async fn run(cli: Cli) -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);

    init_metrics().wrap_err("Failed to initialize metrics")?;

    info!(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), "Starting test queue processor");

    let config = queue_config(&cli)?;
    let transport = transport(&cli).await?;

    let worker = QueueWorker::new(transport, PerItem(LoggingProcessor), config).with_error_hook(
        |error, item| {
            warn!(
                error = ?error.map(|e| e.to_string()),
                data = %item.data.data,
                retry_count = item.retry_count,
                "Item failed"
            );
        },
    );

    let health_state = HealthState::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        worker.config().queue_key(),
        worker.subscribe_state(),
    );
    let metrics_port = cli.metrics_port;
    let health_server = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, metrics_port).await {
            error!(error = %e, "Health server error");
        }
    });

    let pusher = spawn_pusher(
        worker.producer().clone(),
        Duration::from_millis(cli.push_interval_ms.max(1)),
    );

    // Ctrl+C and SIGTERM are handled by the worker itself.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = worker.run(shutdown_rx).await;
    pusher.abort();
    health_server.abort();

    match outcome {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(eyre!("Queue worker aborted: {}", e)),
        Err(e) => return Err(eyre!("Queue worker failed to start: {}", e)),
    }

    info!("Test queue processor stopped");
    Ok(())
}
