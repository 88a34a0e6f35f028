//! Job queue service.
//!
//! Ties the persistent queue to handlers, per-kind circuit breakers, the
//! retry calculator, the dead letter store and the metrics recorder.

use crate::config::JobsConfig;
use crate::dead_letter::{
    AddJobOptions, BatchOptions, BatchOutcome, CleanupOutcome, DeadLetterEntry, DeadLetterStore,
    JobResubmitter,
};
use crate::error::{DeadLetterResult, EnqueueError, JobError, QueueResult};
use crate::handler::HandlerRegistry;
use crate::job::{Job, JobId, JobKind};
use crate::metrics::{resident_memory_bytes, ExecutionRecord, ExecutionStatus, MetricsRecorder};
use crate::queue::{EnqueueRequest, PersistentQueue, QueueStats, MAX_PRIORITY, MIN_PRIORITY};
use crate::retry::RetryPolicies;
use async_trait::async_trait;
use chrono::Utc;
use ferry_resilience::{with_timeout, CircuitBreakerError, CircuitBreakerRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Slack on top of the job timeout before a claim counts as abandoned.
const STALE_CLAIM_MARGIN: Duration = Duration::from_secs(30);

/// Producer-supplied options for a submission.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Idempotency key, unique per kind among live jobs.
    pub singleton_key: Option<String>,

    /// Higher runs sooner, clamped to `MIN_PRIORITY..=MAX_PRIORITY`.
    pub priority: i32,

    /// Tenant used for metrics attribution.
    pub tenant_id: Option<String>,
}

/// What happened to a job after one execution.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Handler succeeded and the job was acknowledged.
    Completed,
    /// Handler failed with a retryable error; the job is pending again after `delay`.
    Retrying { delay: Duration, error: JobError },
    /// The job is permanently failed.
    Failed { error: JobError, dead_lettered: bool },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }

    /// The handler error, if the attempt failed.
    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Retrying { error, .. } | JobOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// Runs jobs with retries, circuit breaking, quarantine and metrics.
///
/// Metrics and dead letter bookkeeping never fail a job: their errors are
/// logged where they happen and execution carries on.
pub struct JobQueueService {
    config: JobsConfig,
    queue: Arc<dyn PersistentQueue>,
    handlers: HandlerRegistry,
    breakers: CircuitBreakerRegistry,
    dead_letters: Arc<DeadLetterStore>,
    metrics: Arc<dyn MetricsRecorder>,
    retry: RetryPolicies,
}

impl JobQueueService {
    /// Create a new service.
    pub fn new(
        config: JobsConfig,
        queue: Arc<dyn PersistentQueue>,
        handlers: HandlerRegistry,
        dead_letters: Arc<DeadLetterStore>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.breaker_config());
        let retry = RetryPolicies::from_config(&config.retry);

        Self {
            config,
            queue,
            handlers,
            breakers,
            dead_letters,
            metrics,
            retry,
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Per-kind circuit breakers.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn queue(&self) -> &Arc<dyn PersistentQueue> {
        &self.queue
    }

    /// Submit a job.
    ///
    /// Returns the existing job's ID when a live job of the same kind shares
    /// the singleton key.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        self.submit(kind, payload, options, 0).await
    }

    async fn submit(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
        resubmissions: u32,
    ) -> Result<JobId, EnqueueError> {
        let EnqueueOptions {
            singleton_key,
            priority,
            tenant_id,
        } = options;

        let priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        let retry_delay = self.calculate_retry_delay(0, kind);
        let request = EnqueueRequest {
            kind,
            payload,
            priority,
            singleton_key,
            tenant_id: tenant_id.clone(),
            retry_limit: self.config.retry.max_attempts_for(kind),
            retry_delay_ms: u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX),
            resubmissions,
        };

        let outcome = self.queue.enqueue(request).await.map_err(|source| {
            error!(job_kind = %kind, error = %source, "Failed to enqueue job");
            EnqueueError::Rejected { kind, source }
        })?;

        if self.config.metrics.enabled {
            if let Err(e) =
                self.metrics
                    .record_job_enqueued(kind, tenant_id.as_deref(), priority, outcome.is_duplicate())
            {
                warn!(job_kind = %kind, error = %e, "Failed to record enqueue metric");
            }
        }

        if outcome.is_duplicate() {
            debug!(job_id = %outcome.job_id(), job_kind = %kind, "Singleton job already queued");
        } else {
            debug!(job_id = %outcome.job_id(), job_kind = %kind, priority, "Enqueued job");
        }

        Ok(outcome.job_id().clone())
    }

    /// Backoff for a zero-based `attempt` of `kind`.
    pub fn calculate_retry_delay(&self, attempt: u32, kind: JobKind) -> Duration {
        self.retry.for_kind(kind).delay_for_attempt(attempt)
    }

    /// Run one claimed job to its next state.
    pub async fn execute_job(&self, job: Job) -> JobOutcome {
        debug!(job_id = %job.id, job_kind = %job.kind, attempt = job.attempts, "Executing job");

        let started = Instant::now();
        let result = self.run_handler(&job).await;
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                self.record_job_metrics(&job, ExecutionStatus::Completed, duration, None)
                    .await;
                if let Err(e) = self.queue.ack(&job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to acknowledge job");
                }
                debug!(job_id = %job.id, job_kind = %job.kind, duration_ms = duration.as_millis() as u64, "Job completed");
                JobOutcome::Completed
            }
            Err(error) => {
                self.record_job_metrics(&job, ExecutionStatus::Failed, duration, Some(&error))
                    .await;
                if self.config.metrics.enabled {
                    if let Err(e) =
                        self.metrics
                            .record_job_error(job.kind, job.tenant_id.as_deref(), &error)
                    {
                        warn!(job_id = %job.id, error = %e, "Failed to record job error metric");
                    }
                }

                if error.is_retryable() && job.attempts < job.max_attempts {
                    let delay = self.calculate_retry_delay(job.attempts.saturating_sub(1), job.kind);
                    warn!(
                        job_id = %job.id,
                        job_kind = %job.kind,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job failed, scheduling retry"
                    );
                    if let Err(e) = self.queue.nack(&job.id, delay, &error.to_string()).await {
                        error!(job_id = %job.id, error = %e, "Failed to schedule job retry");
                    }
                    return JobOutcome::Retrying { delay, error };
                }

                warn!(
                    job_id = %job.id,
                    job_kind = %job.kind,
                    attempts = job.attempts,
                    retryable = error.is_retryable(),
                    error = %error,
                    "Job failed permanently"
                );

                let dead_lettered = if self.config.dead_letter_queue.enabled {
                    self.move_to_dead_letter_queue(&job, &error).await
                } else {
                    self.mark_failed(&job, &error).await;
                    false
                };

                JobOutcome::Failed {
                    error,
                    dead_lettered,
                }
            }
        }
    }

    async fn run_handler(&self, job: &Job) -> Result<(), JobError> {
        let handler = self.handlers.get(job.kind).ok_or(JobError::NoHandler(job.kind))?;
        let job_timeout = self.config.worker.job_timeout();
        let invoke = || with_timeout(job_timeout, || handler.handle(job));

        if !self.config.circuit_breaker.enabled {
            return invoke().await;
        }

        // Terminal errors say nothing about the downstream's health.
        let breaker = self.breakers.get_or_create(job.kind.as_str());
        match breaker.call_classified(invoke, JobError::is_retryable).await {
            Ok(()) => Ok(()),
            Err(CircuitBreakerError::Open(name)) => Err(JobError::CircuitOpen(name)),
            Err(CircuitBreakerError::Failure(e)) => Err(e),
        }
    }

    /// Quarantine a permanently failed job and mark it failed in the queue.
    ///
    /// Does nothing when the dead letter store is disabled. Returns whether an
    /// entry was stored; failures are logged, never returned.
    pub async fn move_to_dead_letter_queue(&self, job: &Job, error: &JobError) -> bool {
        if !self.config.dead_letter_queue.enabled {
            return false;
        }

        let options = AddJobOptions {
            attempts_made: job.attempts,
            priority: job.priority,
            tenant_id: job.tenant_id.clone(),
            singleton_key: job.singleton_key.clone(),
            resubmissions: job.resubmissions,
        };

        let stored = match self
            .dead_letters
            .add_job(&job.id, job.kind, job.payload.clone(), error, options)
            .await
        {
            Ok(_) => {
                if self.config.metrics.enabled {
                    if let Err(e) = self
                        .metrics
                        .record_dead_letter_job(job.kind, job.tenant_id.as_deref())
                    {
                        warn!(job_id = %job.id, error = %e, "Failed to record dead letter metric");
                    }
                }
                true
            }
            Err(e) => {
                error!(job_id = %job.id, job_kind = %job.kind, error = %e, "Failed to store dead letter entry");
                false
            }
        };

        self.mark_failed(job, error).await;
        stored
    }

    async fn mark_failed(&self, job: &Job, error: &JobError) {
        if let Err(e) = self.queue.fail(&job.id, &error.to_string()).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
        }
    }

    /// Forward an execution record to the recorder.
    ///
    /// Makes no recorder call at all when metrics are disabled.
    pub async fn record_job_metrics(
        &self,
        job: &Job,
        status: ExecutionStatus,
        duration: Duration,
        error: Option<&JobError>,
    ) {
        if !self.config.metrics.enabled {
            return;
        }

        let queue_depth = match self.queue.depth().await {
            Ok(depth) => depth,
            Err(e) => {
                debug!(error = %e, "Failed to read queue depth for metrics");
                0
            }
        };

        let record = ExecutionRecord {
            job_id: job.id.clone(),
            job_kind: job.kind,
            tenant_id: job.tenant_id.clone(),
            status,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            attempts: job.attempts,
            error_category: error.map(JobError::category),
            error_code: error.map(|e| e.code().to_string()),
            error_message: error.map(ToString::to_string),
            memory_usage_bytes: resident_memory_bytes(),
            queue_depth,
            recorded_at: Utc::now(),
        };

        if let Err(e) = self.metrics.record_job_execution(record) {
            warn!(job_id = %job.id, error = %e, "Failed to record job execution metric");
        }
    }

    /// Resubmit one batch of dead letter entries as fresh jobs.
    pub async fn process_dead_letters(&self) -> DeadLetterResult<BatchOutcome> {
        if !self.config.dead_letter_queue.enabled {
            return Ok(BatchOutcome::default());
        }

        let options = BatchOptions {
            batch_size: self.config.dead_letter_queue.batch_size,
        };
        self.dead_letters.process_jobs(options, self).await
    }

    /// Delete dead letter entries past retention.
    pub async fn cleanup_dead_letters(&self) -> DeadLetterResult<CleanupOutcome> {
        if !self.config.dead_letter_queue.enabled {
            return Ok(CleanupOutcome::default());
        }
        self.dead_letters.cleanup().await
    }

    /// Requeue jobs whose claim outlived the job timeout plus a margin.
    ///
    /// Picks up jobs left active by a crashed, panicked or cancelled worker.
    pub async fn recover_stale_jobs(&self) -> QueueResult<u64> {
        self.queue
            .recover_stale(self.config.worker.job_timeout() + STALE_CLAIM_MARGIN)
            .await
    }

    /// Drop finished jobs past the configured retention.
    pub async fn purge_finished_jobs(&self) -> QueueResult<u64> {
        self.queue
            .purge_finished(Duration::from_secs(self.config.redis.finished_retention_secs))
            .await
    }

    /// Job counts per status.
    pub async fn queue_stats(&self) -> QueueResult<QueueStats> {
        self.queue.stats().await
    }

    /// Sample resident memory and report it when above the threshold.
    ///
    /// Returns the sampled value, or `None` when metrics are disabled.
    pub fn sample_memory_pressure(&self) -> Option<u64> {
        if !self.config.metrics.enabled {
            return None;
        }

        let used = resident_memory_bytes();
        let threshold = self.config.metrics.memory_pressure_threshold_bytes;
        if used > threshold {
            if let Err(e) = self.metrics.record_memory_pressure(used, threshold) {
                warn!(error = %e, "Failed to record memory pressure");
            }
        }
        Some(used)
    }
}

#[async_trait]
impl JobResubmitter for JobQueueService {
    async fn resubmit(&self, entry: &DeadLetterEntry) -> Result<JobId, EnqueueError> {
        let options = EnqueueOptions {
            singleton_key: entry.singleton_key.clone(),
            priority: entry.priority,
            tenant_id: entry.tenant_id.clone(),
        };
        let resubmissions = entry.resubmissions.saturating_add(1);
        let job_id = self
            .submit(entry.job_kind, entry.payload.clone(), options, resubmissions)
            .await?;

        info!(
            job_id = %job_id,
            original_job_id = %entry.original_job_id,
            job_kind = %entry.job_kind,
            resubmissions,
            "Resubmitted dead letter job"
        );
        Ok(job_id)
    }
}
