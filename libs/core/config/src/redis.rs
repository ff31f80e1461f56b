use crate::{ConfigError, FromEnv};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis configuration for the queue transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL)
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL`, falling back to `REDIS_HOST`, then to a local instance.
    ///
    /// A bare host name (no scheme) is accepted and turned into a `redis://` URL.
    fn from_env() -> Result<Self, ConfigError> {
        let raw = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_HOST"))
            .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        let url = if raw.contains("://") {
            raw
        } else {
            format!("redis://{}", raw)
        };

        Ok(Self { url })
    }
}
