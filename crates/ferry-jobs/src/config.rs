//! Job engine configuration.

use crate::job::JobKind;
use ferry_core::{FerryError, FerryResult};
use ferry_resilience::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Key used in `retry.max_attempts` for kinds without their own entry.
pub const DEFAULT_KIND_KEY: &str = "default";

/// Configuration for the job engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Retry and backoff configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker configuration.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Dead letter queue configuration.
    #[serde(default)]
    pub dead_letter_queue: DeadLetterConfig,

    /// Execution metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,
}

impl JobsConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> FerryResult<()> {
        let retry = &self.retry;
        if retry.backoff_multiplier <= 0.0 || !retry.backoff_multiplier.is_finite() {
            return Err(FerryError::configuration("retry.backoff_multiplier must be positive"));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(FerryError::configuration(
                "retry.max_delay_ms must not be below retry.base_delay_ms",
            ));
        }
        if retry.max_attempts.values().any(|attempts| *attempts == 0) {
            return Err(FerryError::configuration("retry.max_attempts entries must be at least 1"));
        }
        for name in retry.max_attempts.keys().chain(retry.kinds.keys()) {
            if name != DEFAULT_KIND_KEY && name.parse::<JobKind>().is_err() {
                return Err(FerryError::configuration(format!("unknown job kind in retry config: {}", name)));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(FerryError::configuration("circuit_breaker thresholds must be at least 1"));
        }
        if self.worker.concurrency == 0 {
            return Err(FerryError::configuration("worker.concurrency must be at least 1"));
        }
        if self.dead_letter_queue.batch_size == 0 || self.metrics.batch_size == 0 {
            return Err(FerryError::configuration("batch sizes must be at least 1"));
        }
        Ok(())
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Perturb delays by up to ±10%.
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Attempt ceiling per job kind, with a `default` fallback.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: HashMap<String, u32>,

    /// Per-kind backoff overrides.
    #[serde(default)]
    pub kinds: HashMap<String, RetryOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            kinds: HashMap::new(),
        }
    }
}

impl RetryConfig {
    /// Attempt ceiling for `kind`, falling back to the `default` entry.
    pub fn max_attempts_for(&self, kind: JobKind) -> u32 {
        self.max_attempts
            .get(kind.as_str())
            .or_else(|| self.max_attempts.get(DEFAULT_KIND_KEY))
            .copied()
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Optional per-kind backoff settings; unset fields inherit the global values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverride {
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_base_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    300_000 // 5 minutes
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_max_attempts() -> HashMap<String, u32> {
    HashMap::from([
        (DEFAULT_KIND_KEY.to_string(), DEFAULT_MAX_ATTEMPTS),
        (JobKind::WebhookProcessing.as_str().to_string(), 5),
    ])
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Route handler calls through per-kind breakers.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Failures within the window before opening.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,

    /// Time an open breaker waits before a trial call, in milliseconds.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Sliding window for counting failures, in milliseconds.
    #[serde(default = "default_monitoring_window")]
    pub monitoring_window_ms: u64,

    /// Successful trials needed to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,

    /// Trial calls allowed in flight while half-open.
    #[serde(default = "default_half_open_calls")]
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout(),
            monitoring_window_ms: default_monitoring_window(),
            success_threshold: default_success_threshold(),
            half_open_max_calls: default_half_open_calls(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Converts to the resilience crate's breaker configuration.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            monitoring_window: Duration::from_millis(self.monitoring_window_ms),
            half_open_max_calls: self.half_open_max_calls.max(1),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_recovery_timeout() -> u64 {
    60_000
}

fn default_monitoring_window() -> u64 {
    120_000
}

fn default_success_threshold() -> u64 {
    1
}

fn default_half_open_calls() -> u64 {
    1
}

/// Dead letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Enable dead letter queue.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Recovery attempts per entry before it is left for cleanup.
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,

    /// Entries older than this are deleted by cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Entries pulled per recovery batch.
    #[serde(default = "default_dlq_batch_size")]
    pub batch_size: usize,

    /// Interval between maintenance passes, in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_dlq_max_retries(),
            retention_days: default_retention_days(),
            batch_size: default_dlq_batch_size(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_dlq_max_retries() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    30
}

fn default_dlq_batch_size() -> usize {
    50
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Execution metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Record execution metrics.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Days persisted execution records are kept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Records per flush.
    #[serde(default = "default_metrics_batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval in milliseconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Records buffered before new ones are dropped.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Resident memory above which memory pressure is reported.
    #[serde(default = "default_memory_threshold")]
    pub memory_pressure_threshold_bytes: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
            batch_size: default_metrics_batch_size(),
            flush_interval_ms: default_flush_interval(),
            buffer_capacity: default_buffer_capacity(),
            memory_pressure_threshold_bytes: default_memory_threshold(),
        }
    }
}

impl MetricsConfig {
    /// Returns flush interval as Duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_metrics_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    5000
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_memory_threshold() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of jobs executed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Job execution timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_secs: default_job_timeout(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    // Use available parallelism or fallback to 4
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .max(4)
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How long completed and failed job records are kept, in seconds.
    #[serde(default = "default_finished_retention")]
    pub finished_retention_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
            finished_retention_secs: default_finished_retention(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "ferry:jobs".to_string()
}

fn default_finished_retention() -> u64 {
    86400 * 7 // 7 days
}
