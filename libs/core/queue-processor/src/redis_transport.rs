//! Redis list transport
//!
//! Producers `LPUSH` onto `<prefix>:<queue>`, workers `RPOP key count`. The pop with a
//! count is a single atomic command, so concurrent workers never see the same entry.
//! `RPOP` with a count needs Redis 6.2 or newer.

use crate::error::QueueError;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::transport::Transport;
use async_trait::async_trait;
use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info};

/// Connect to Redis and return a ConnectionManager
///
/// The ConnectionManager reconnects on its own after connection failures.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!(url = %url, "Connecting to Redis");

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Connect with exponential backoff, for startup when Redis may not be ready yet.
pub async fn connect_with_retry(
    config: &RedisConfig,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    let url = config.url.clone();
    retry_with_backoff(|| connect(&url), retry_config.unwrap_or_default()).await
}

/// Queue transport over Redis lists.
#[derive(Clone)]
pub struct RedisTransport {
    redis: ConnectionManager,
}

impl RedisTransport {
    /// Create a new RedisTransport
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Connect using a RedisConfig
    pub async fn connect(config: &RedisConfig) -> Result<Self, QueueError> {
        Ok(Self::new(connect(&config.url).await?))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn push(&self, queue: &str, entries: Vec<Vec<u8>>) -> Result<(), QueueError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let count = entries.len();

        let length: i64 = redis::cmd("LPUSH")
            .arg(queue)
            .arg(entries)
            .query_async(&mut conn)
            .await?;

        debug!(queue = %queue, count = count, length = length, "Pushed entries");
        Ok(())
    }

    async fn pop(&self, queue: &str, max_count: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        let mut conn = self.redis.clone();

        // Nil reply when the list does not exist.
        let entries: Option<Vec<Vec<u8>>> = redis::cmd("RPOP")
            .arg(queue)
            .arg(max_count.max(1))
            .query_async(&mut conn)
            .await?;

        Ok(entries.unwrap_or_default())
    }

    async fn len(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("LLEN").arg(queue).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("DEL").arg(queue).query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;

        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
