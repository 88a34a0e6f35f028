//! Redis-backed queue, dead letter backend and metrics sink.

mod dead_letter;
mod metrics;
mod queue;

pub use dead_letter::RedisDeadLetterBackend;
pub use metrics::RedisMetricsSink;
pub use queue::RedisJobQueue;

use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::JobKind;
use chrono::NaiveDate;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> QueueResult<Pool> {
    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder.
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

    /// Job record (JSON string).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    /// Prefix shared by all job record keys.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Visible jobs (sorted set by priority, then age).
    pub fn ready(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    /// Delayed jobs (sorted set by visibility time).
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Claimed jobs (hash: job_id -> claimed_at millis).
    pub fn active(&self) -> String {
        format!("{}:active", self.prefix)
    }

    /// Completed jobs (sorted set by completion time).
    pub fn completed(&self) -> String {
        format!("{}:completed", self.prefix)
    }

    /// Failed jobs (sorted set by failure time).
    pub fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    /// Singleton lock for a kind and key, holding the live job's ID.
    pub fn singleton(&self, kind: JobKind, key: &str) -> String {
        format!("{}:singleton:{}:{}", self.prefix, kind.as_str(), key)
    }

    /// Dead letter entries (hash: entry_id -> JSON).
    pub fn dead_letters(&self) -> String {
        format!("{}:dlq:entries", self.prefix)
    }

    /// Dead letter index (sorted set by creation time).
    pub fn dead_letter_index(&self) -> String {
        format!("{}:dlq:index", self.prefix)
    }

    /// Execution records for one UTC day (list of JSON).
    pub fn executions(&self, day: NaiveDate) -> String {
        format!("{}:metrics:executions:{}", self.prefix, day.format("%Y-%m-%d"))
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("ferry:jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.job("123"), "test:job:123");
        assert_eq!(keys.ready(), "test:ready");
        assert_eq!(
            keys.singleton(JobKind::WebhookProcessing, "evt_1"),
            "test:singleton:webhook-processing:evt_1"
        );
        assert_eq!(keys.dead_letter_index(), "test:dlq:index");
    }

    #[test]
    fn test_execution_keys_are_daily() {
        let keys = RedisKeys::default();
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(keys.executions(day), "ferry:jobs:metrics:executions:2024-03-09");
    }
}
