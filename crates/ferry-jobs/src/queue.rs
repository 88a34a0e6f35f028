//! Persistent queue abstraction.

use crate::error::QueueResult;
use crate::job::{Job, JobId, JobKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest accepted priority; larger values are clamped.
pub const MAX_PRIORITY: i32 = 500;

/// Lowest accepted priority; smaller values are clamped.
pub const MIN_PRIORITY: i32 = -500;

/// A submission handed to the persistent queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Job kind.
    pub kind: JobKind,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// Higher runs sooner.
    pub priority: i32,

    /// Idempotency key, unique per kind among pending and active jobs.
    pub singleton_key: Option<String>,

    /// Tenant for metrics attribution.
    pub tenant_id: Option<String>,

    /// Maximum claims before the job is dead-lettered.
    pub retry_limit: u32,

    /// First retry delay, in milliseconds.
    pub retry_delay_ms: u64,

    /// Times this payload has already been resubmitted from the dead letter store.
    #[serde(default)]
    pub resubmissions: u32,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was stored.
    Created(JobId),
    /// A live job with the same kind and singleton key already existed.
    Existing(JobId),
}

impl EnqueueOutcome {
    /// Returns the job ID, new or existing.
    pub fn job_id(&self) -> &JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => id,
        }
    }

    /// Returns true if the submission matched an existing job.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Existing(_))
    }
}

/// Durable queue with at-least-once delivery, delayed visibility and
/// per-kind singleton keys.
///
/// Implementations must enforce singleton uniqueness atomically: two
/// concurrent submissions with the same kind and key converge on one job.
#[async_trait]
pub trait PersistentQueue: Send + Sync {
    /// Store a job, or return the live job sharing its singleton key.
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<EnqueueOutcome>;

    /// Claim the next visible job, highest priority first.
    ///
    /// Claiming increments `attempts` and marks the job active.
    async fn fetch_next(&self) -> QueueResult<Option<Job>>;

    /// Mark an active job completed and release its singleton key.
    async fn ack(&self, job_id: &JobId) -> QueueResult<()>;

    /// Return an active job to pending, visible again after `delay`.
    async fn nack(&self, job_id: &JobId, delay: Duration, error: &str) -> QueueResult<()>;

    /// Mark an active job permanently failed and release its singleton key.
    async fn fail(&self, job_id: &JobId, error: &str) -> QueueResult<()>;

    /// Look up a job by ID.
    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>>;

    /// Number of pending jobs, delayed ones included.
    async fn depth(&self) -> QueueResult<u64>;

    /// Counts per status.
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Return jobs claimed more than `older_than` ago to pending.
    ///
    /// Covers workers that died or were cancelled between claim and
    /// ack/nack/fail. Returns the number of jobs requeued.
    async fn recover_stale(&self, older_than: Duration) -> QueueResult<u64>;

    /// Drop completed and failed jobs that finished more than `older_than` ago.
    async fn purge_finished(&self, older_than: Duration) -> QueueResult<u64>;
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs visible now.
    pub pending: u64,

    /// Jobs waiting for their retry delay.
    pub delayed: u64,

    /// Jobs claimed by workers.
    pub active: u64,

    /// Completed jobs still retained.
    pub completed: u64,

    /// Failed jobs still retained.
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_outcome_accessors() {
        let created = EnqueueOutcome::Created(JobId::from("a"));
        let existing = EnqueueOutcome::Existing(JobId::from("b"));

        assert_eq!(created.job_id().as_str(), "a");
        assert!(!created.is_duplicate());
        assert_eq!(existing.job_id().as_str(), "b");
        assert!(existing.is_duplicate());
    }
}
