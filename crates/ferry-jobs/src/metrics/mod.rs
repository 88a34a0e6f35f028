//! Job execution metrics.
//!
//! Counters and histograms go through the `metrics` facade as they happen.
//! Full execution records are buffered and flushed in batches to a
//! [`MetricsSink`] for retention beyond the scrape window.

mod buffered;
mod process;
mod sink;

pub use buffered::BufferedMetricsRecorder;
pub use process::resident_memory_bytes;
pub use sink::{InMemoryMetricsSink, MetricsSink};

use crate::error::{ErrorCategory, JobError, MetricsError};
use crate::job::{JobId, JobKind};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use serde::{Deserialize, Serialize};

/// Metric names.
pub mod names {
    /// Jobs accepted by the queue.
    pub const JOBS_ENQUEUED_TOTAL: &str = "ferry_jobs_enqueued_total";
    /// Enqueues that matched an existing singleton job.
    pub const JOBS_DEDUPLICATED_TOTAL: &str = "ferry_jobs_deduplicated_total";
    /// Job attempts that completed.
    pub const JOBS_COMPLETED_TOTAL: &str = "ferry_jobs_completed_total";
    /// Job attempts that failed.
    pub const JOBS_FAILED_TOTAL: &str = "ferry_jobs_failed_total";
    /// Errors by category.
    pub const JOB_ERRORS_TOTAL: &str = "ferry_jobs_errors_total";
    /// Jobs moved to the dead letter store.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "ferry_jobs_dead_lettered_total";
    /// Execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "ferry_jobs_duration_seconds";
    /// Pending jobs at the last execution.
    pub const QUEUE_DEPTH: &str = "ferry_jobs_queue_depth";
    /// Resident memory when pressure was last reported.
    pub const MEMORY_USAGE_BYTES: &str = "ferry_jobs_memory_usage_bytes";
    /// Memory pressure reports.
    pub const MEMORY_PRESSURE_TOTAL: &str = "ferry_jobs_memory_pressure_total";
    /// Execution records dropped because the buffer was full or the sink failed.
    pub const RECORDS_DROPPED_TOTAL: &str = "ferry_jobs_metric_records_dropped_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DEDUPLICATED_TOTAL,
        "Total number of enqueues deduplicated by singleton key"
    );
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of job attempts completed");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of job attempts failed");
    describe_counter!(names::JOB_ERRORS_TOTAL, "Total number of job errors by category");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the dead letter store"
    );
    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_gauge!(names::QUEUE_DEPTH, "Pending jobs observed at execution time");
    describe_gauge!(names::MEMORY_USAGE_BYTES, "Resident memory at the last pressure report");
    describe_counter!(names::MEMORY_PRESSURE_TOTAL, "Total number of memory pressure reports");
    describe_counter!(
        names::RECORDS_DROPPED_TOTAL,
        "Total number of execution records dropped before persistence"
    );
}

/// Outcome of a single job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// One row of execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub job_kind: JobKind,
    pub tenant_id: Option<String>,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error_category: Option<ErrorCategory>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub memory_usage_bytes: u64,
    pub queue_depth: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Receives job lifecycle metrics.
///
/// Every method returns a `Result` so callers see that recording can fail;
/// callers log the error and carry on.
pub trait MetricsRecorder: Send + Sync {
    /// Record a finished attempt.
    fn record_job_execution(&self, record: ExecutionRecord) -> Result<(), MetricsError>;

    /// Record an accepted submission.
    fn record_job_enqueued(
        &self,
        kind: JobKind,
        tenant_id: Option<&str>,
        priority: i32,
        duplicate: bool,
    ) -> Result<(), MetricsError>;

    /// Record a classified handler error.
    fn record_job_error(
        &self,
        kind: JobKind,
        tenant_id: Option<&str>,
        error: &JobError,
    ) -> Result<(), MetricsError>;

    /// Record a job moved to the dead letter store.
    fn record_dead_letter_job(&self, kind: JobKind, tenant_id: Option<&str>) -> Result<(), MetricsError>;

    /// Record resident memory above the configured threshold.
    fn record_memory_pressure(&self, used_bytes: u64, threshold_bytes: u64) -> Result<(), MetricsError>;
}

pub(crate) fn tenant_label(tenant_id: Option<&str>) -> String {
    tenant_id.unwrap_or("none").to_string()
}

/// Emits the facade counters shared by every recorder.
pub(crate) fn emit_enqueued(kind: JobKind, tenant_id: Option<&str>, priority: i32, duplicate: bool) {
    let name = if duplicate {
        names::JOBS_DEDUPLICATED_TOTAL
    } else {
        names::JOBS_ENQUEUED_TOTAL
    };
    counter!(
        name,
        "job_kind" => kind.as_str(),
        "tenant" => tenant_label(tenant_id),
        "priority" => priority.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_error(kind: JobKind, tenant_id: Option<&str>, error: &JobError) {
    counter!(
        names::JOB_ERRORS_TOTAL,
        "job_kind" => kind.as_str(),
        "tenant" => tenant_label(tenant_id),
        "category" => error.category().as_str(),
        "code" => error.code()
    )
    .increment(1);
}

pub(crate) fn emit_dead_letter(kind: JobKind, tenant_id: Option<&str>) {
    counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "job_kind" => kind.as_str(),
        "tenant" => tenant_label(tenant_id)
    )
    .increment(1);
}

pub(crate) fn emit_memory_pressure(used_bytes: u64) {
    counter!(names::MEMORY_PRESSURE_TOTAL).increment(1);
    gauge!(names::MEMORY_USAGE_BYTES).set(used_bytes as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        register_metrics();
    }

    #[test]
    fn test_emitters_without_recorder() {
        emit_enqueued(JobKind::WebhookProcessing, Some("tenant-a"), 0, false);
        emit_enqueued(JobKind::WebhookProcessing, None, 0, true);
        emit_error(JobKind::ReminderProcessing, None, &JobError::Timeout("5s".into()));
        emit_dead_letter(JobKind::ReminderProcessing, Some("tenant-b"));
        emit_memory_pressure(1024);
    }

    #[test]
    fn test_tenant_label_fallback() {
        assert_eq!(tenant_label(None), "none");
        assert_eq!(tenant_label(Some("acme")), "acme");
    }

    #[test]
    fn test_execution_status_labels() {
        assert_eq!(ExecutionStatus::Completed.as_str(), "completed");
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Failed).unwrap(),
            "\"failed\""
        );
    }
}
