//! Redis job queue implementation.

use super::RedisKeys;
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobStatus};
use crate::queue::{
    EnqueueOutcome, EnqueueRequest, PersistentQueue, QueueStats, MAX_PRIORITY, MIN_PRIORITY,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Claims a singleton key and stores the job in one step.
///
/// KEYS: singleton, job record, ready set.
/// ARGV: job id, job JSON, ready score, job key prefix.
/// Returns the live holder's id when the key belongs to a pending or active
/// job, otherwise takes the key over and returns the new id.
const ENQUEUE_SINGLETON_SCRIPT: &str = r#"
    local holder = redis.call("get", KEYS[1])
    if holder then
        local record = redis.call("get", ARGV[4] .. holder)
        if record then
            local status = cjson.decode(record)["status"]
            if status == "pending" or status == "active" then
                return holder
            end
        end
    end
    redis.call("set", KEYS[1], ARGV[1])
    redis.call("set", KEYS[2], ARGV[2])
    redis.call("zadd", KEYS[3], ARGV[3], ARGV[1])
    return ARGV[1]
"#;

/// Deletes a singleton key only while it still names the given job.
const RELEASE_SINGLETON_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// Error recorded on jobs whose claim outlived the recovery threshold.
const CLAIM_EXPIRED: &str = "claim expired before the job finished";

/// Redis-backed job queue.
///
/// Singleton claims run as a Lua script together with the job write, so
/// concurrent duplicate submissions from any number of processes converge
/// on one job and a key never points at a job that was not stored.
pub struct RedisJobQueue {
    pool: Pool,
    keys: RedisKeys,
    finished_retention: Duration,
}

impl RedisJobQueue {
    /// Create a new Redis job queue.
    pub fn new(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&config.key_prefix),
            finished_retention: Duration::from_secs(config.finished_retention_secs),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> QueueResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Score for the ready set. Higher priority = lower score (processed first).
    /// Score = -priority * 1e13 + created_at_ms
    ///
    /// Priority is clamped to `MIN_PRIORITY..=MAX_PRIORITY` so the score stays
    /// below 2^53 and keeps millisecond ordering within a priority.
    fn priority_score(priority: i32, created_at_ms: i64) -> f64 {
        let priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        -(f64::from(priority)) * 10_000_000_000_000.0 + created_at_ms as f64
    }

    /// Maps the enqueue script's reply to an outcome for `job_id`.
    fn singleton_outcome(job_id: JobId, holder: String) -> EnqueueOutcome {
        if holder == job_id.as_str() {
            EnqueueOutcome::Created(job_id)
        } else {
            EnqueueOutcome::Existing(JobId::from(holder))
        }
    }

    async fn load(&self, conn: &mut deadpool_redis::Connection, job_id: &JobId) -> QueueResult<Job> {
        let json: Option<String> = conn.get(self.keys.job(job_id.as_str())).await?;
        let json = json.ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        Ok(Job::from_json(&json)?)
    }

    async fn load_active(&self, conn: &mut deadpool_redis::Connection, job_id: &JobId) -> QueueResult<Job> {
        let job = self.load(conn, job_id).await?;
        if job.status != JobStatus::Active {
            return Err(QueueError::Unavailable(format!(
                "job {} is {}, not active",
                job_id, job.status
            )));
        }
        Ok(job)
    }

    /// Move delayed jobs whose visibility time has passed into the ready set.
    pub async fn promote_delayed(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore(self.keys.delayed(), "-inf", now)
            .await?;

        let mut moved = 0u64;
        for id in due {
            // Whoever removes the member owns the promotion.
            let removed: u64 = conn.zrem(self.keys.delayed(), &id).await?;
            if removed == 0 {
                continue;
            }

            match self.load(&mut conn, &JobId::from(id.as_str())).await {
                Ok(job) => {
                    let score = Self::priority_score(job.priority, job.created_at.timestamp_millis());
                    let _: () = conn.zadd(self.keys.ready(), &id, score).await?;
                    moved += 1;
                }
                Err(e) => warn!(job_id = %id, error = %e, "Dropping delayed entry without job record"),
            }
        }

        if moved > 0 {
            debug!(count = moved, "Promoted delayed jobs");
        }

        Ok(moved)
    }

    /// Release a singleton key if it still points at `job`.
    async fn release_singleton(&self, conn: &mut deadpool_redis::Connection, job: &Job) -> QueueResult<()> {
        if let Some(key) = &job.singleton_key {
            let _: i32 = redis::Script::new(RELEASE_SINGLETON_SCRIPT)
                .key(self.keys.singleton(job.kind, key))
                .arg(job.id.as_str())
                .invoke_async(&mut **conn)
                .await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistentQueue for RedisJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<EnqueueOutcome> {
        let job = Job::from_request(JobId::new(), request);
        let mut conn = self.conn().await?;
        let score = Self::priority_score(job.priority, job.created_at.timestamp_millis());

        if let Some(key) = &job.singleton_key {
            let holder: String = redis::Script::new(ENQUEUE_SINGLETON_SCRIPT)
                .key(self.keys.singleton(job.kind, key))
                .key(self.keys.job(job.id.as_str()))
                .key(self.keys.ready())
                .arg(job.id.as_str())
                .arg(job.to_json()?)
                .arg(score)
                .arg(self.keys.job_prefix())
                .invoke_async(&mut *conn)
                .await?;

            let outcome = Self::singleton_outcome(job.id.clone(), holder);
            if outcome.is_duplicate() {
                debug!(job_id = %outcome.job_id(), singleton_key = %key, "Singleton key already enqueued");
            } else {
                debug!(job_id = %job.id, job_kind = %job.kind, priority = job.priority, "Enqueued job");
            }
            return Ok(outcome);
        }

        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.job(job.id.as_str()), job.to_json()?)
            .zadd(self.keys.ready(), job.id.as_str(), score)
            .query_async(&mut *conn)
            .await?;

        debug!(job_id = %job.id, job_kind = %job.kind, priority = job.priority, "Enqueued job");

        Ok(EnqueueOutcome::Created(job.id))
    }

    async fn fetch_next(&self) -> QueueResult<Option<Job>> {
        if let Err(e) = self.promote_delayed().await {
            warn!(error = %e, "Failed to promote delayed jobs");
        }

        let mut conn = self.conn().await?;

        loop {
            // ZPOPMIN atomically claims the lowest score (highest priority).
            let popped: Vec<(String, f64)> = conn.zpopmin(self.keys.ready(), 1).await?;
            let Some((id, _score)) = popped.into_iter().next() else {
                return Ok(None);
            };

            let job_id = JobId::from(id);
            let mut job = match self.load(&mut conn, &job_id).await {
                Ok(job) => job,
                Err(QueueError::NotFound(_)) => {
                    warn!(job_id = %job_id, "Ready entry without job record");
                    continue;
                }
                Err(e) => return Err(e),
            };

            job.status = JobStatus::Active;
            job.attempts += 1;

            let _: () = redis::pipe()
                .atomic()
                .set(self.keys.job(job_id.as_str()), job.to_json()?)
                .hset(self.keys.active(), job_id.as_str(), Utc::now().timestamp_millis())
                .query_async(&mut *conn)
                .await?;

            debug!(job_id = %job.id, job_kind = %job.kind, attempt = job.attempts, "Dequeued job");

            return Ok(Some(job));
        }
    }

    async fn ack(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self.load_active(&mut conn, job_id).await?;
        job.status = JobStatus::Completed;

        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.keys.job(job_id.as_str()), job.to_json()?, self.finished_retention.as_secs())
            .hdel(self.keys.active(), job_id.as_str())
            .zadd(self.keys.completed(), job_id.as_str(), Utc::now().timestamp_millis())
            .query_async(&mut *conn)
            .await?;

        self.release_singleton(&mut conn, &job).await?;

        debug!(job_id = %job_id, "Completed job");

        Ok(())
    }

    async fn nack(&self, job_id: &JobId, delay: Duration, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self.load_active(&mut conn, job_id).await?;

        job.status = JobStatus::Pending;
        job.visible_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
        job.last_error = Some(error.to_string());

        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.job(job_id.as_str()), job.to_json()?)
            .hdel(self.keys.active(), job_id.as_str())
            .zadd(self.keys.delayed(), job_id.as_str(), job.visible_at.timestamp_millis())
            .query_async(&mut *conn)
            .await?;

        debug!(job_id = %job_id, retry_at = %job.visible_at, "Scheduled job retry");

        Ok(())
    }

    async fn fail(&self, job_id: &JobId, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self.load_active(&mut conn, job_id).await?;

        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());

        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.keys.job(job_id.as_str()), job.to_json()?, self.finished_retention.as_secs())
            .hdel(self.keys.active(), job_id.as_str())
            .zadd(self.keys.failed(), job_id.as_str(), Utc::now().timestamp_millis())
            .query_async(&mut *conn)
            .await?;

        self.release_singleton(&mut conn, &job).await?;

        debug!(job_id = %job_id, "Failed job");

        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        match self.load(&mut conn, job_id).await {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn depth(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let (ready, delayed): (u64, u64) = redis::pipe()
            .zcard(self.keys.ready())
            .zcard(self.keys.delayed())
            .query_async(&mut *conn)
            .await?;
        Ok(ready + delayed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;
        let (pending, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .zcard(self.keys.ready())
            .zcard(self.keys.delayed())
            .hlen(self.keys.active())
            .zcard(self.keys.completed())
            .zcard(self.keys.failed())
            .query_async(&mut *conn)
            .await?;

        Ok(QueueStats {
            pending,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn recover_stale(&self, older_than: Duration) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let cutoff = Utc::now() - ChronoDuration::from_std(older_than).unwrap_or_default();
        let cutoff_ms = cutoff.timestamp_millis();

        let claims: HashMap<String, i64> = conn.hgetall(self.keys.active()).await?;

        let mut recovered = 0u64;
        for (id, claimed_at) in claims {
            if claimed_at > cutoff_ms {
                continue;
            }

            // Whoever removes the claim owns the recovery.
            let removed: u64 = conn.hdel(self.keys.active(), &id).await?;
            if removed == 0 {
                continue;
            }

            let job_id = JobId::from(id.as_str());
            let mut job = match self.load(&mut conn, &job_id).await {
                Ok(job) if job.status == JobStatus::Active => job,
                Ok(_) => continue,
                Err(QueueError::NotFound(_)) => {
                    warn!(job_id = %job_id, "Dropping claim without job record");
                    continue;
                }
                Err(e) => return Err(e),
            };

            job.last_error = Some(CLAIM_EXPIRED.to_string());

            if job.is_exhausted() {
                job.status = JobStatus::Failed;
                let _: () = redis::pipe()
                    .atomic()
                    .set_ex(self.keys.job(job_id.as_str()), job.to_json()?, self.finished_retention.as_secs())
                    .zadd(self.keys.failed(), job_id.as_str(), Utc::now().timestamp_millis())
                    .query_async(&mut *conn)
                    .await?;
                self.release_singleton(&mut conn, &job).await?;
                warn!(job_id = %job_id, attempts = job.attempts, "Stale job out of attempts, marking failed");
            } else {
                job.status = JobStatus::Pending;
                job.visible_at = Utc::now();
                let score = Self::priority_score(job.priority, job.created_at.timestamp_millis());
                let _: () = redis::pipe()
                    .atomic()
                    .set(self.keys.job(job_id.as_str()), job.to_json()?)
                    .zadd(self.keys.ready(), job_id.as_str(), score)
                    .query_async(&mut *conn)
                    .await?;
                warn!(job_id = %job_id, attempts = job.attempts, "Requeued stale job");
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered stale jobs");
        }

        Ok(recovered)
    }

    async fn purge_finished(&self, older_than: Duration) -> QueueResult<u64> {
        let mut conn = self.conn().await?;

        let threshold = Utc::now() - ChronoDuration::from_std(older_than).unwrap_or_default();
        let threshold_ms = threshold.timestamp_millis();

        let mut removed = 0u64;
        for key in [self.keys.completed(), self.keys.failed()] {
            let count: u64 = redis::cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg(0i64)
                .arg(threshold_ms)
                .query_async(&mut *conn)
                .await?;
            removed += count;
        }

        if removed > 0 {
            info!(count = removed, "Purged finished jobs");
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_score_orders_priority_first() {
        let now = Utc::now().timestamp_millis();
        let high_late = RedisJobQueue::priority_score(5, now + 60_000);
        let low_early = RedisJobQueue::priority_score(0, now);
        assert!(high_late < low_early);
    }

    #[test]
    fn test_priority_score_orders_age_within_priority() {
        let now = Utc::now().timestamp_millis();
        let older = RedisJobQueue::priority_score(1, now);
        let newer = RedisJobQueue::priority_score(1, now + 1);
        assert!(older < newer);
    }

    #[test]
    fn test_priority_score_keeps_age_order_at_extremes() {
        let now = Utc::now().timestamp_millis();
        for priority in [MAX_PRIORITY, MIN_PRIORITY, i32::MAX, i32::MIN] {
            let older = RedisJobQueue::priority_score(priority, now);
            let newer = RedisJobQueue::priority_score(priority, now + 1);
            assert!(older < newer, "priority {}", priority);
        }
        assert_eq!(
            RedisJobQueue::priority_score(i32::MAX, now),
            RedisJobQueue::priority_score(MAX_PRIORITY, now)
        );
        assert!(RedisJobQueue::priority_score(MAX_PRIORITY, now).abs() < 2f64.powi(53));
    }

    #[test]
    fn test_singleton_outcome_distinguishes_holder() {
        let id = JobId::from("job-1");
        assert_eq!(
            RedisJobQueue::singleton_outcome(id.clone(), "job-1".into()),
            EnqueueOutcome::Created(id.clone())
        );
        assert_eq!(
            RedisJobQueue::singleton_outcome(id, "job-0".into()),
            EnqueueOutcome::Existing(JobId::from("job-0"))
        );
    }

    #[test]
    fn test_enqueue_script_addresses_job_records_by_prefix() {
        let keys = RedisKeys::new("test");
        assert_eq!(format!("{}{}", keys.job_prefix(), "abc"), keys.job("abc"));

        // The script compares the stored status against these wire names.
        for status in [JobStatus::Pending, JobStatus::Active] {
            let wire = serde_json::to_value(status).unwrap();
            let wire = wire.as_str().unwrap();
            assert!(ENQUEUE_SINGLETON_SCRIPT.contains(&format!("\"{}\"", wire)));
        }
    }

    #[test]
    fn test_negative_priority_sorts_last() {
        let now = Utc::now().timestamp_millis();
        assert!(RedisJobQueue::priority_score(0, now) < RedisJobQueue::priority_score(-1, now));
    }
}
