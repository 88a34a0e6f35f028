//! Worker pool for processing jobs.

use crate::config::WorkerConfig;
use crate::service::{JobOutcome, JobQueueService};
use ferry_core::{FerryError, FerryResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of jobs executed concurrently.
    pub concurrency: usize,

    /// Idle polling interval.
    pub poll_interval: Duration,

    /// Time allowed for in-flight jobs to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Pulls jobs from the service's queue and executes them concurrently.
///
/// Each claimed job runs on its own task; a semaphore caps how many run at
/// once. Stopping the pool stops claiming and waits up to
/// `shutdown_timeout` for in-flight jobs.
pub struct WorkerPool {
    /// Unique pool ID.
    id: String,

    service: Arc<JobQueueService>,

    config: WorkerPoolConfig,

    semaphore: Arc<Semaphore>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Running flag.
    running: AtomicBool,

    /// Jobs completed.
    jobs_processed: Arc<AtomicU64>,

    /// Attempts that failed, retried or not.
    jobs_failed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(service: Arc<JobQueueService>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            id: format!("worker-pool-{}", Uuid::new_v4()),
            service,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            shutdown_tx,
            running: AtomicBool::new(false),
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run the pool until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> FerryResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FerryError::internal("Worker pool already running"));
        }

        info!(
            pool_id = %self.id,
            concurrency = self.config.concurrency,
            "Starting worker pool"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut last_sample: Option<Instant> = None;

        while !*shutdown_rx.borrow() {
            if last_sample.map_or(true, |at| at.elapsed() >= self.config.poll_interval) {
                self.service.sample_memory_pressure();
                last_sample = Some(Instant::now());
            }

            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.service.queue().fetch_next().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut shutdown_rx).await;
                    continue;
                }
                Err(e) => {
                    error!(pool_id = %self.id, error = %e, "Failed to fetch job");
                    drop(permit);
                    self.idle(&mut shutdown_rx).await;
                    continue;
                }
            };

            let service = self.service.clone();
            let jobs_processed = self.jobs_processed.clone();
            let jobs_failed = self.jobs_failed.clone();
            let span = tracing::info_span!("job", job_id = %job.id, job_kind = %job.kind);

            tokio::spawn(
                async move {
                    match service.execute_job(job).await {
                        JobOutcome::Completed => {
                            jobs_processed.fetch_add(1, Ordering::Relaxed);
                        }
                        JobOutcome::Retrying { .. } | JobOutcome::Failed { .. } => {
                            jobs_failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }

        info!(pool_id = %self.id, "Waiting for workers to finish...");
        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        if timeout(self.config.shutdown_timeout, self.semaphore.acquire_many(permits))
            .await
            .is_err()
        {
            warn!(
                pool_id = %self.id,
                in_flight = self.active_jobs(),
                "Shutdown timeout elapsed with jobs still running"
            );
        }

        self.running.store(false, Ordering::SeqCst);

        info!(
            pool_id = %self.id,
            processed = self.jobs_processed(),
            failed = self.jobs_failed(),
            "Worker pool stopped"
        );

        Ok(())
    }

    async fn idle(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Stop the worker pool.
    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool...");
        self.shutdown_tx.send_replace(true);
        debug!(pool_id = %self.id, "Shutdown signal sent");
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the number of jobs completed.
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    /// Get the number of failed attempts.
    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.config
            .concurrency
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            active_jobs: self.active_jobs(),
            jobs_processed: self.jobs_processed(),
            jobs_failed: self.jobs_failed(),
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Is running.
    pub running: bool,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Jobs executing right now.
    pub active_jobs: usize,

    /// Jobs completed.
    pub jobs_processed: u64,

    /// Attempts that failed.
    pub jobs_failed: u64,
}
