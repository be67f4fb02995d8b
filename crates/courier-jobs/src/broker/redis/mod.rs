//! Redis-backed broker.

mod broker;
mod scripts;

pub use broker::RedisBroker;

use crate::error::{TaskError, TaskResult};
use courier_config::RedisConfig;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Build a Redis connection pool without connecting.
pub fn build_pool(config: &RedisConfig) -> TaskResult<Pool> {
    let cfg = Config::from_url(&config.url);

    cfg.builder()
        .map_err(|e| TaskError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .wait_timeout(Some(config.connect_timeout()))
        .create_timeout(Some(config.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| TaskError::Configuration(format!("Failed to create pool: {}", e)))
}

/// Create a Redis connection pool and check it with a PING.
pub async fn create_pool(config: &RedisConfig) -> TaskResult<Pool> {
    info!("Creating Redis connection pool for task broker...");

    let pool = build_pool(config)?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for the task broker.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Set of every known queue name.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Task hash (fields `msg` and `state`).
    pub fn task(&self, queue: &str, id: &str) -> String {
        format!("{}{}", self.task_prefix(queue), id)
    }

    /// Prefix of task hashes in a queue; scripts append the ID.
    pub fn task_prefix(&self, queue: &str) -> String {
        format!("{}:{}:t:", self.prefix, queue)
    }

    /// Pending task IDs (list; LPUSH to enqueue, RPOP to lease).
    pub fn pending(&self, queue: &str) -> String {
        format!("{}:{}:pending", self.prefix, queue)
    }

    /// Leased task IDs (sorted set by lease deadline).
    pub fn lease(&self, queue: &str) -> String {
        format!("{}:{}:lease", self.prefix, queue)
    }

    /// Scheduled task IDs (sorted set by process time).
    pub fn scheduled(&self, queue: &str) -> String {
        format!("{}:{}:scheduled", self.prefix, queue)
    }

    /// Retry task IDs (sorted set by retry time).
    pub fn retry(&self, queue: &str) -> String {
        format!("{}:{}:retry", self.prefix, queue)
    }

    /// Dead task IDs (sorted set by time of death).
    pub fn dead(&self, queue: &str) -> String {
        format!("{}:{}:dead", self.prefix, queue)
    }

    /// Processed counter.
    pub fn processed(&self, queue: &str) -> String {
        format!("{}:{}:processed", self.prefix, queue)
    }

    /// Failed attempts counter.
    pub fn failed(&self, queue: &str) -> String {
        format!("{}:{}:failed", self.prefix, queue)
    }

    /// Uniqueness lock.
    pub fn unique(&self, key: &str) -> String {
        format!("{}{}", self.unique_prefix(), key)
    }

    /// Prefix of uniqueness locks.
    pub fn unique_prefix(&self) -> String {
        format!("{}:unique:", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("courier")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.queues(), "test:queues");
        assert_eq!(keys.pending("default"), "test:default:pending");
        assert_eq!(keys.task("default", "123"), "test:default:t:123");
        assert_eq!(keys.dead("low"), "test:low:dead");
        assert_eq!(keys.unique("default:email:abc"), "test:unique:default:email:abc");
    }
}
