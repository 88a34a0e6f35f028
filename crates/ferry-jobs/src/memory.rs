//! In-process queue for tests and single-node deployments.

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobKind, JobStatus};
use crate::queue::{EnqueueOutcome, EnqueueRequest, PersistentQueue, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error recorded on jobs whose claim outlived the recovery threshold.
const CLAIM_EXPIRED: &str = "claim expired before the job finished";

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    singletons: HashMap<(JobKind, String), JobId>,
    claimed_at: HashMap<JobId, DateTime<Utc>>,
    finished_at: HashMap<JobId, DateTime<Utc>>,
}

impl QueueState {
    fn finish(&mut self, job: &Job) {
        self.claimed_at.remove(&job.id);
        self.finished_at.insert(job.id.clone(), Utc::now());
        self.release_singleton(job);
    }

    fn release_singleton(&mut self, job: &Job) {
        if let Some(key) = &job.singleton_key {
            let slot = (job.kind, key.clone());
            if self.singletons.get(&slot) == Some(&job.id) {
                self.singletons.remove(&slot);
            }
        }
    }

    fn active_job(&mut self, job_id: &JobId) -> QueueResult<&mut Job> {
        match self.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Active => Ok(job),
            Some(_) => Err(QueueError::Unavailable(format!("job {} is not active", job_id))),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }
}

/// Queue held entirely in memory behind one lock.
///
/// Singleton checks and inserts happen under the same lock, so concurrent
/// duplicate submissions converge on the first writer's job.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored jobs in any status.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Returns true if no job was ever stored.
    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    /// Shift every outstanding claim into the past.
    #[cfg(test)]
    pub(crate) fn backdate_claims(&self, by: ChronoDuration) {
        for claimed in self.state.lock().claimed_at.values_mut() {
            *claimed = *claimed - by;
        }
    }

    /// Makes every delayed job visible immediately.
    pub fn release_delayed(&self) {
        let now = Utc::now();
        for job in self.state.lock().jobs.values_mut() {
            if job.status == JobStatus::Pending && job.visible_at > now {
                job.visible_at = now;
            }
        }
    }
}

#[async_trait]
impl PersistentQueue for InMemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<EnqueueOutcome> {
        let mut state = self.state.lock();

        if let Some(key) = &request.singleton_key {
            if let Some(existing) = state.singletons.get(&(request.kind, key.clone())) {
                debug!(job_id = %existing, singleton_key = %key, "Singleton key already enqueued");
                return Ok(EnqueueOutcome::Existing(existing.clone()));
            }
        }

        let job = Job::from_request(JobId::new(), request);
        let job_id = job.id.clone();
        if let Some(key) = &job.singleton_key {
            state.singletons.insert((job.kind, key.clone()), job_id.clone());
        }
        state.jobs.insert(job_id.clone(), job);

        Ok(EnqueueOutcome::Created(job_id))
    }

    async fn fetch_next(&self) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let next = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.visible_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|job| job.id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        job.status = JobStatus::Active;
        job.attempts += 1;
        let job = job.clone();
        state.claimed_at.insert(job_id, Utc::now());

        Ok(Some(job))
    }

    async fn ack(&self, job_id: &JobId) -> QueueResult<()> {
        let mut state = self.state.lock();
        let job = state.active_job(job_id)?;
        job.status = JobStatus::Completed;
        let job = job.clone();
        state.finish(&job);
        Ok(())
    }

    async fn nack(&self, job_id: &JobId, delay: Duration, error: &str) -> QueueResult<()> {
        let mut state = self.state.lock();
        let job = state.active_job(job_id)?;
        job.status = JobStatus::Pending;
        job.visible_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
        job.last_error = Some(error.to_string());
        state.claimed_at.remove(job_id);
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, error: &str) -> QueueResult<()> {
        let mut state = self.state.lock();
        let job = state.active_job(job_id)?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        let job = job.clone();
        state.finish(&job);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn depth(&self) -> QueueResult<u64> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count() as u64)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock();
        let now = Utc::now();
        let mut stats = QueueStats::default();

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending if job.visible_at > now => stats.delayed += 1,
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }

    async fn recover_stale(&self, older_than: Duration) -> QueueResult<u64> {
        let mut state = self.state.lock();
        let cutoff = Utc::now() - ChronoDuration::from_std(older_than).unwrap_or_default();

        let stale: Vec<JobId> = state
            .claimed_at
            .iter()
            .filter(|(_, claimed)| **claimed <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut recovered = 0u64;
        for job_id in stale {
            state.claimed_at.remove(&job_id);
            let Ok(job) = state.active_job(&job_id) else {
                continue;
            };

            job.last_error = Some(CLAIM_EXPIRED.to_string());
            if job.is_exhausted() {
                job.status = JobStatus::Failed;
                let job = job.clone();
                warn!(job_id = %job.id, attempts = job.attempts, "Stale job out of attempts, marking failed");
                state.finish(&job);
            } else {
                job.status = JobStatus::Pending;
                job.visible_at = Utc::now();
                warn!(job_id = %job.id, attempts = job.attempts, "Requeued stale job");
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered stale jobs");
        }

        Ok(recovered)
    }

    async fn purge_finished(&self, older_than: Duration) -> QueueResult<u64> {
        let mut state = self.state.lock();
        let cutoff = Utc::now() - ChronoDuration::from_std(older_than).unwrap_or_default();

        let expired: Vec<JobId> = state
            .finished_at
            .iter()
            .filter(|(_, finished)| **finished <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in &expired {
            state.finished_at.remove(job_id);
            state.jobs.remove(job_id);
        }

        let purged = expired.len() as u64;
        if purged > 0 {
            info!(count = purged, "Purged finished jobs");
        }

        Ok(purged)
    }
}
