//! Redis sink for execution records.

use super::RedisKeys;
use crate::config::{MetricsConfig, RedisConfig};
use crate::error::MetricsError;
use crate::metrics::{ExecutionRecord, MetricsSink};
use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_redis::Pool;
use std::collections::BTreeMap;

/// Appends records to one list per UTC day; each list expires after the
/// retention period.
pub struct RedisMetricsSink {
    pool: Pool,
    keys: RedisKeys,
    retention_secs: i64,
}

impl RedisMetricsSink {
    pub fn new(pool: Pool, redis: &RedisConfig, metrics: &MetricsConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&redis.key_prefix),
            retention_secs: i64::from(metrics.retention_days) * 86_400,
        }
    }
}

#[async_trait]
impl MetricsSink for RedisMetricsSink {
    async fn write_batch(&self, records: &[ExecutionRecord]) -> Result<(), MetricsError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut by_day: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
        for record in records {
            by_day
                .entry(record.recorded_at.date_naive())
                .or_default()
                .push(serde_json::to_string(record)?);
        }

        let mut pipe = redis::pipe();
        for (day, rows) in by_day {
            let key = self.keys.executions(day);
            pipe.rpush(&key, rows).ignore();
            pipe.expire(&key, self.retention_secs).ignore();
        }

        let mut conn = self.pool.get().await?;
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }
}
