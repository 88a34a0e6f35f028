//! Redis dead letter backend.

use super::RedisKeys;
use crate::config::RedisConfig;
use crate::dead_letter::{DeadLetterBackend, DeadLetterEntry, DeadLetterId};
use crate::error::DeadLetterResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::warn;

/// Entries are JSON in a hash keyed by entry ID, indexed by a sorted set
/// scored with the creation time in milliseconds.
pub struct RedisDeadLetterBackend {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisDeadLetterBackend {
    pub fn new(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&config.key_prefix),
        }
    }

    async fn conn(&self) -> DeadLetterResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn fetch(
        &self,
        conn: &mut deadpool_redis::Connection,
        ids: &[String],
    ) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.dead_letters())
            .arg(ids)
            .query_async(&mut **conn)
            .await?;

        let mut entries = Vec::with_capacity(values.len());
        for (id, value) in ids.iter().zip(values) {
            let Some(json) = value else {
                continue;
            };
            match serde_json::from_str::<DeadLetterEntry>(&json) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(dead_letter_id = %id, error = %e, "Skipping undecodable dead letter entry"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterBackend for RedisDeadLetterBackend {
    async fn insert(&self, entry: &DeadLetterEntry) -> DeadLetterResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(entry)?;

        let _: () = redis::pipe()
            .atomic()
            .hset(self.keys.dead_letters(), entry.id.as_str(), json)
            .zadd(
                self.keys.dead_letter_index(),
                entry.id.as_str(),
                entry.created_at.timestamp_millis(),
            )
            .query_async(&mut *conn)
            .await?;

        Ok(())
    }

    async fn update(&self, entry: &DeadLetterEntry) -> DeadLetterResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(entry)?;
        let _: () = conn
            .hset(self.keys.dead_letters(), entry.id.as_str(), json)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &DeadLetterId) -> DeadLetterResult<bool> {
        let mut conn = self.conn().await?;
        let (removed, _): (u64, u64) = redis::pipe()
            .atomic()
            .hdel(self.keys.dead_letters(), id.as_str())
            .zrem(self.keys.dead_letter_index(), id.as_str())
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn pending_recovery(&self, limit: usize, max_retries: u32) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn().await?;
        let chunk = limit.max(1).saturating_mul(2);
        let mut offset = 0usize;
        let mut pending = Vec::new();

        while pending.len() < limit {
            let stop = offset.saturating_add(chunk - 1);
            let ids: Vec<String> = conn
                .zrange(
                    self.keys.dead_letter_index(),
                    isize::try_from(offset).unwrap_or(isize::MAX),
                    isize::try_from(stop).unwrap_or(isize::MAX),
                )
                .await?;
            if ids.is_empty() {
                break;
            }
            offset += ids.len();

            let entries = self.fetch(&mut conn, &ids).await?;
            pending.extend(
                entries
                    .into_iter()
                    .filter(|e| e.is_recoverable(max_retries)),
            );
        }

        pending.truncate(limit);
        Ok(pending)
    }

    async fn created_before(&self, cutoff: DateTime<Utc>) -> DeadLetterResult<Vec<DeadLetterId>> {
        let mut conn = self.conn().await?;
        // Exclusive upper bound.
        let ids: Vec<String> = conn
            .zrangebyscore(
                self.keys.dead_letter_index(),
                "-inf",
                format!("({}", cutoff.timestamp_millis()),
            )
            .await?;
        Ok(ids.iter().map(|id| DeadLetterId::from(id.as_str())).collect())
    }

    async fn list(&self, limit: usize) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let stop = isize::try_from(limit - 1).unwrap_or(-1);
        let ids: Vec<String> = conn
            .zrevrange(self.keys.dead_letter_index(), 0, stop)
            .await?;
        self.fetch(&mut conn, &ids).await
    }

    async fn count(&self) -> DeadLetterResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(self.keys.dead_letter_index()).await?)
    }
}
