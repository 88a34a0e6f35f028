//! Dead letter store.
//!
//! Jobs that exhaust their attempts, or fail with a terminal error, are
//! quarantined here with their last error. A periodic batch resubmits
//! retryable entries as fresh jobs and a cleanup pass removes entries past
//! retention. Terminal entries are only ever removed by cleanup.

mod memory;

pub use memory::InMemoryDeadLetterBackend;

use crate::config::DeadLetterConfig;
use crate::error::{DeadLetterError, DeadLetterResult, EnqueueError, ErrorCategory, JobError};
use crate::job::{JobId, JobKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique dead letter entry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterId(String);

impl DeadLetterId {
    /// Creates a new random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeadLetterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The error that sent a job to quarantine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFailure {
    pub message: String,
    pub category: ErrorCategory,
    pub code: String,
}

impl From<&JobError> for DeadLetterFailure {
    fn from(err: &JobError) -> Self {
        Self {
            message: err.to_string(),
            category: err.category(),
            code: err.code().to_string(),
        }
    }
}

/// A quarantined job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub original_job_id: JobId,
    pub job_kind: JobKind,
    pub payload: serde_json::Value,
    pub last_error: DeadLetterFailure,
    pub attempts_made: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub singleton_key: Option<String>,

    /// Failed resubmissions so far.
    #[serde(default)]
    pub recovery_attempts: u32,

    /// Times the payload had already been resubmitted before this entry was made.
    #[serde(default)]
    pub resubmissions: u32,
}

impl DeadLetterEntry {
    /// Whether a recovery pass may resubmit this entry.
    ///
    /// Terminal failures stay quarantined, as do payloads that already went
    /// through `max_retries` resubmissions and entries whose resubmission
    /// failed `max_retries` times.
    pub fn is_recoverable(&self, max_retries: u32) -> bool {
        !self.last_error.category.is_terminal()
            && self.resubmissions < max_retries
            && self.recovery_attempts < max_retries
    }
}

/// Job attributes carried into quarantine alongside the payload.
#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    pub attempts_made: u32,
    pub priority: i32,
    pub tenant_id: Option<String>,
    pub singleton_key: Option<String>,
    pub resubmissions: u32,
}

/// Options for one recovery batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Entries pulled from the store, oldest first.
    pub batch_size: usize,
}

/// Result of a recovery batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub recovered: usize,
    pub failed: usize,
}

/// Result of a retention cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupOutcome {
    pub cleaned: usize,
    pub errors: Vec<String>,
}

/// Aggregate view of the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_kind: BTreeMap<JobKind, u64>,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

/// Storage for dead letter entries.
#[async_trait]
pub trait DeadLetterBackend: Send + Sync {
    /// Persist a new entry.
    async fn insert(&self, entry: &DeadLetterEntry) -> DeadLetterResult<()>;

    /// Overwrite an existing entry.
    async fn update(&self, entry: &DeadLetterEntry) -> DeadLetterResult<()>;

    /// Delete an entry; returns false if it did not exist.
    async fn remove(&self, id: &DeadLetterId) -> DeadLetterResult<bool>;

    /// Oldest entries for which [`DeadLetterEntry::is_recoverable`] holds.
    async fn pending_recovery(&self, limit: usize, max_retries: u32) -> DeadLetterResult<Vec<DeadLetterEntry>>;

    /// IDs of entries created before `cutoff`.
    async fn created_before(&self, cutoff: DateTime<Utc>) -> DeadLetterResult<Vec<DeadLetterId>>;

    /// Newest entries first.
    async fn list(&self, limit: usize) -> DeadLetterResult<Vec<DeadLetterEntry>>;

    /// Number of stored entries.
    async fn count(&self) -> DeadLetterResult<u64>;
}

/// Resubmits a quarantined job as a fresh job.
#[async_trait]
pub trait JobResubmitter: Send + Sync {
    async fn resubmit(&self, entry: &DeadLetterEntry) -> Result<JobId, EnqueueError>;
}

/// Dead letter store over a pluggable backend.
pub struct DeadLetterStore {
    backend: Arc<dyn DeadLetterBackend>,
    config: DeadLetterConfig,
}

impl DeadLetterStore {
    /// Create a store over `backend`.
    pub fn new(backend: Arc<dyn DeadLetterBackend>, config: DeadLetterConfig) -> Self {
        Self { backend, config }
    }

    /// Create a store backed by memory.
    pub fn in_memory(config: DeadLetterConfig) -> Self {
        Self::new(Arc::new(InMemoryDeadLetterBackend::new()), config)
    }

    /// Store configuration.
    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Quarantine a failed job.
    pub async fn add_job(
        &self,
        original_job_id: &JobId,
        kind: JobKind,
        payload: serde_json::Value,
        error: &JobError,
        options: AddJobOptions,
    ) -> Result<DeadLetterId, DeadLetterError> {
        let entry = DeadLetterEntry {
            id: DeadLetterId::new(),
            original_job_id: original_job_id.clone(),
            job_kind: kind,
            payload,
            last_error: DeadLetterFailure::from(error),
            attempts_made: options.attempts_made,
            priority: options.priority,
            created_at: Utc::now(),
            tenant_id: options.tenant_id,
            singleton_key: options.singleton_key,
            recovery_attempts: 0,
            resubmissions: options.resubmissions,
        };

        self.backend.insert(&entry).await?;

        info!(
            dead_letter_id = %entry.id,
            job_id = %original_job_id,
            job_kind = %kind,
            error_code = %entry.last_error.code,
            attempts = entry.attempts_made,
            "Moved job to dead letter store"
        );

        Ok(entry.id)
    }

    /// Resubmit a batch of quarantined jobs, oldest first.
    ///
    /// Recovered entries are removed. Entries whose resubmission fails stay
    /// quarantined with their recovery counter bumped; once it reaches
    /// `max_retries` they are skipped and left for cleanup. Terminal entries
    /// and payloads resubmitted `max_retries` times are never picked up.
    pub async fn process_jobs(
        &self,
        options: BatchOptions,
        resubmitter: &dyn JobResubmitter,
    ) -> DeadLetterResult<BatchOutcome> {
        let entries = self
            .backend
            .pending_recovery(options.batch_size, self.config.max_retries)
            .await?;

        let mut outcome = BatchOutcome::default();

        for mut entry in entries {
            outcome.processed += 1;

            match resubmitter.resubmit(&entry).await {
                Ok(job_id) => {
                    if let Err(e) = self.backend.remove(&entry.id).await {
                        warn!(dead_letter_id = %entry.id, error = %e, "Failed to remove recovered entry");
                    }
                    outcome.recovered += 1;
                    debug!(
                        dead_letter_id = %entry.id,
                        job_id = %job_id,
                        job_kind = %entry.job_kind,
                        "Resubmitted dead letter entry"
                    );
                }
                Err(e) => {
                    entry.recovery_attempts += 1;
                    outcome.failed += 1;
                    warn!(
                        dead_letter_id = %entry.id,
                        job_kind = %entry.job_kind,
                        recovery_attempts = entry.recovery_attempts,
                        error = %e,
                        "Failed to resubmit dead letter entry"
                    );
                    if let Err(e) = self.backend.update(&entry).await {
                        warn!(dead_letter_id = %entry.id, error = %e, "Failed to update dead letter entry");
                    }
                }
            }
        }

        if outcome.processed > 0 {
            info!(
                processed = outcome.processed,
                recovered = outcome.recovered,
                failed = outcome.failed,
                "Processed dead letter batch"
            );
        }

        Ok(outcome)
    }

    /// Delete entries older than `retention_days`.
    ///
    /// Per-entry failures are collected and do not stop the pass.
    pub async fn cleanup(&self) -> DeadLetterResult<CleanupOutcome> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.config.retention_days));
        let expired = self.backend.created_before(cutoff).await?;

        let mut outcome = CleanupOutcome::default();
        for id in expired {
            match self.backend.remove(&id).await {
                Ok(_) => outcome.cleaned += 1,
                Err(e) => outcome.errors.push(format!("{}: {}", id, e)),
            }
        }

        if outcome.cleaned > 0 || !outcome.errors.is_empty() {
            info!(
                cleaned = outcome.cleaned,
                errors = outcome.errors.len(),
                retention_days = self.config.retention_days,
                "Cleaned up dead letter store"
            );
        }

        Ok(outcome)
    }

    /// Newest entries first.
    pub async fn list(&self, limit: usize) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        self.backend.list(limit).await
    }

    /// Number of quarantined entries.
    pub async fn count(&self) -> DeadLetterResult<u64> {
        self.backend.count().await
    }

    /// Totals per kind and the age of the oldest entry.
    pub async fn stats(&self) -> DeadLetterResult<DeadLetterStats> {
        let entries = self.backend.list(usize::MAX).await?;

        let mut stats = DeadLetterStats {
            total: entries.len() as u64,
            ..Default::default()
        };
        for entry in &entries {
            *stats.by_kind.entry(entry.job_kind).or_default() += 1;
            stats.oldest_created_at = match stats.oldest_created_at {
                Some(oldest) if oldest <= entry.created_at => Some(oldest),
                _ => Some(entry.created_at),
            };
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingResubmitter {
        fail_kind: Option<JobKind>,
        submitted: Mutex<Vec<DeadLetterEntry>>,
    }

    impl RecordingResubmitter {
        fn new(fail_kind: Option<JobKind>) -> Self {
            Self {
                fail_kind,
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobResubmitter for RecordingResubmitter {
        async fn resubmit(&self, entry: &DeadLetterEntry) -> Result<JobId, EnqueueError> {
            if Some(entry.job_kind) == self.fail_kind {
                return Err(EnqueueError::Rejected {
                    kind: entry.job_kind,
                    source: crate::error::QueueError::Unavailable("down".into()),
                });
            }
            self.submitted.lock().push(entry.clone());
            Ok(JobId::new())
        }
    }

    fn store(backend: Arc<InMemoryDeadLetterBackend>) -> DeadLetterStore {
        DeadLetterStore::new(backend, DeadLetterConfig::default())
    }

    async fn add(store: &DeadLetterStore, kind: JobKind, priority: i32) -> DeadLetterId {
        add_with(store, kind, priority, &JobError::Transient("connection reset".into()), 0).await
    }

    async fn add_with(
        store: &DeadLetterStore,
        kind: JobKind,
        priority: i32,
        error: &JobError,
        resubmissions: u32,
    ) -> DeadLetterId {
        store
            .add_job(
                &JobId::new(),
                kind,
                json!({ "n": priority }),
                error,
                AddJobOptions {
                    attempts_made: 3,
                    priority,
                    tenant_id: Some("tenant-a".into()),
                    singleton_key: Some(format!("key-{}", priority)),
                    resubmissions,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_job_records_failure() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend.clone());
        add(&store, JobKind::WebhookProcessing, 7).await;

        let entries = store.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.job_kind, JobKind::WebhookProcessing);
        assert_eq!(entry.priority, 7);
        assert_eq!(entry.attempts_made, 3);
        assert_eq!(entry.last_error.category, ErrorCategory::Transient);
        assert_eq!(entry.last_error.code, "TRANSIENT_ERROR");
        assert!(entry.last_error.message.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_process_jobs_preserves_job_attributes() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend);
        add(&store, JobKind::ReminderProcessing, 9).await;

        let resubmitter = RecordingResubmitter::new(None);
        let outcome = store
            .process_jobs(BatchOptions { batch_size: 10 }, &resubmitter)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome { processed: 1, recovered: 1, failed: 0 });
        assert_eq!(store.count().await.unwrap(), 0);

        let submitted = resubmitter.submitted.lock();
        assert_eq!(submitted[0].priority, 9);
        assert_eq!(submitted[0].tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(submitted[0].singleton_key.as_deref(), Some("key-9"));
        assert_eq!(submitted[0].payload, json!({ "n": 9 }));
    }

    #[tokio::test]
    async fn test_process_jobs_keeps_failed_entries() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend);
        add(&store, JobKind::WebhookProcessing, 1).await;
        add(&store, JobKind::ReminderProcessing, 2).await;

        let resubmitter = RecordingResubmitter::new(Some(JobKind::WebhookProcessing));
        let outcome = store
            .process_jobs(BatchOptions { batch_size: 10 }, &resubmitter)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome { processed: 2, recovered: 1, failed: 1 });
        let remaining = store.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].job_kind, JobKind::WebhookProcessing);
        assert_eq!(remaining[0].recovery_attempts, 1);
    }

    #[tokio::test]
    async fn test_process_jobs_skips_entries_out_of_recovery_attempts() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = DeadLetterStore::new(
            backend,
            DeadLetterConfig {
                max_retries: 2,
                ..Default::default()
            },
        );
        add(&store, JobKind::WebhookProcessing, 1).await;

        let resubmitter = RecordingResubmitter::new(Some(JobKind::WebhookProcessing));
        for _ in 0..2 {
            store
                .process_jobs(BatchOptions { batch_size: 10 }, &resubmitter)
                .await
                .unwrap();
        }

        let outcome = store
            .process_jobs(BatchOptions { batch_size: 10 }, &resubmitter)
            .await
            .unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_process_jobs_leaves_terminal_entries_quarantined() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend);
        add_with(&store, JobKind::WebhookProcessing, 1, &JobError::Validation("no id".into()), 0).await;
        add_with(&store, JobKind::WebhookProcessing, 2, &JobError::MalformedPayload("eof".into()), 0).await;
        add_with(&store, JobKind::ReminderProcessing, 3, &JobError::NoHandler(JobKind::ReminderProcessing), 0).await;
        add(&store, JobKind::ReminderProcessing, 4).await;

        let resubmitter = RecordingResubmitter::new(None);
        let outcome = store
            .process_jobs(BatchOptions { batch_size: 10 }, &resubmitter)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome { processed: 1, recovered: 1, failed: 0 });
        assert_eq!(resubmitter.submitted.lock()[0].priority, 4);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_process_jobs_stops_after_max_resubmissions() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = DeadLetterStore::new(
            backend,
            DeadLetterConfig {
                max_retries: 2,
                ..Default::default()
            },
        );
        let error = JobError::Transient("down".into());
        add_with(&store, JobKind::WebhookProcessing, 1, &error, 1).await;
        add_with(&store, JobKind::WebhookProcessing, 2, &error, 2).await;

        let resubmitter = RecordingResubmitter::new(None);
        let outcome = store
            .process_jobs(BatchOptions { batch_size: 10 }, &resubmitter)
            .await
            .unwrap();

        assert_eq!(outcome.recovered, 1);
        assert_eq!(resubmitter.submitted.lock()[0].resubmissions, 1);
        let remaining = store.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].resubmissions, 2);
    }

    #[test]
    fn test_entry_recoverability() {
        let entry = DeadLetterEntry {
            id: DeadLetterId::new(),
            original_job_id: JobId::new(),
            job_kind: JobKind::WebhookProcessing,
            payload: json!({}),
            last_error: DeadLetterFailure::from(&JobError::Timeout("30s".into())),
            attempts_made: 5,
            priority: 0,
            created_at: Utc::now(),
            tenant_id: None,
            singleton_key: None,
            recovery_attempts: 0,
            resubmissions: 0,
        };
        assert!(entry.is_recoverable(3));
        assert!(!entry.is_recoverable(0));

        let exhausted = DeadLetterEntry {
            resubmissions: 3,
            ..entry.clone()
        };
        assert!(!exhausted.is_recoverable(3));

        let stuck = DeadLetterEntry {
            recovery_attempts: 3,
            ..entry.clone()
        };
        assert!(!stuck.is_recoverable(3));

        let invalid = DeadLetterEntry {
            last_error: DeadLetterFailure::from(&JobError::Validation("bad".into())),
            ..entry
        };
        assert!(!invalid.is_recoverable(3));
    }

    #[tokio::test]
    async fn test_process_jobs_respects_batch_size_oldest_first() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend);
        for priority in 0..5 {
            add(&store, JobKind::ReminderProcessing, priority).await;
        }

        let resubmitter = RecordingResubmitter::new(None);
        let outcome = store
            .process_jobs(BatchOptions { batch_size: 2 }, &resubmitter)
            .await
            .unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(store.count().await.unwrap(), 3);
        let submitted = resubmitter.submitted.lock();
        assert_eq!(submitted[0].priority, 0);
        assert_eq!(submitted[1].priority, 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_entries() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend.clone());
        let fresh = add(&store, JobKind::WebhookProcessing, 1).await;
        let stale = add(&store, JobKind::WebhookProcessing, 2).await;
        backend.backdate(&stale, ChronoDuration::days(31));

        let outcome = store.cleanup().await.unwrap();

        assert_eq!(outcome.cleaned, 1);
        assert!(outcome.errors.is_empty());
        let remaining = store.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh);
    }

    #[tokio::test]
    async fn test_stats_by_kind() {
        let backend = Arc::new(InMemoryDeadLetterBackend::new());
        let store = store(backend);
        add(&store, JobKind::WebhookProcessing, 1).await;
        add(&store, JobKind::WebhookProcessing, 2).await;
        add(&store, JobKind::ReminderProcessing, 3).await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind[&JobKind::WebhookProcessing], 2);
        assert_eq!(stats.by_kind[&JobKind::ReminderProcessing], 1);
        assert!(stats.oldest_created_at.is_some());
    }
}
