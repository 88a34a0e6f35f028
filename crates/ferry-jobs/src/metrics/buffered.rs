use super::{
    emit_dead_letter, emit_enqueued, emit_error, emit_memory_pressure, names, tenant_label,
    ExecutionRecord, ExecutionStatus, MetricsRecorder, MetricsSink,
};
use crate::config::MetricsConfig;
use crate::error::{JobError, MetricsError};
use crate::job::JobKind;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

enum Command {
    Record(ExecutionRecord),
    Flush(oneshot::Sender<Result<usize, MetricsError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Recorder that batches execution records for a [`MetricsSink`].
///
/// Records go through a bounded channel to a background flusher, which
/// writes a batch when `batch_size` records are buffered or on every
/// `flush_interval` tick. A full channel drops the record with
/// [`MetricsError::BufferFull`] rather than blocking the caller.
pub struct BufferedMetricsRecorder {
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedMetricsRecorder {
    /// Start the recorder and its flusher task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn MetricsSink>, config: &MetricsConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let flusher = Flusher {
            sink,
            batch_size: config.batch_size.max(1),
            buffer: Vec::new(),
        };
        let handle = tokio::spawn(flusher.run(rx, config.flush_interval()));

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Write buffered records now; returns how many were written.
    pub async fn flush(&self) -> Result<usize, MetricsError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| MetricsError::Closed)?;
        done.await.map_err(|_| MetricsError::Closed)?
    }

    /// Flush remaining records and stop the flusher.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), MetricsError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                counter!(names::RECORDS_DROPPED_TOTAL, "reason" => "buffer_full").increment(1);
                MetricsError::BufferFull
            }
            mpsc::error::TrySendError::Closed(_) => MetricsError::Closed,
        })
    }
}

impl MetricsRecorder for BufferedMetricsRecorder {
    fn record_job_execution(&self, record: ExecutionRecord) -> Result<(), MetricsError> {
        let name = match record.status {
            ExecutionStatus::Completed => names::JOBS_COMPLETED_TOTAL,
            ExecutionStatus::Failed => names::JOBS_FAILED_TOTAL,
        };
        counter!(
            name,
            "job_kind" => record.job_kind.as_str(),
            "tenant" => tenant_label(record.tenant_id.as_deref())
        )
        .increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_kind" => record.job_kind.as_str(),
            "status" => record.status.as_str()
        )
        .record(record.duration_ms as f64 / 1000.0);
        gauge!(names::QUEUE_DEPTH).set(record.queue_depth as f64);

        self.send(Command::Record(record))
    }

    fn record_job_enqueued(
        &self,
        kind: JobKind,
        tenant_id: Option<&str>,
        priority: i32,
        duplicate: bool,
    ) -> Result<(), MetricsError> {
        emit_enqueued(kind, tenant_id, priority, duplicate);
        Ok(())
    }

    fn record_job_error(
        &self,
        kind: JobKind,
        tenant_id: Option<&str>,
        error: &JobError,
    ) -> Result<(), MetricsError> {
        emit_error(kind, tenant_id, error);
        Ok(())
    }

    fn record_dead_letter_job(&self, kind: JobKind, tenant_id: Option<&str>) -> Result<(), MetricsError> {
        emit_dead_letter(kind, tenant_id);
        Ok(())
    }

    fn record_memory_pressure(&self, used_bytes: u64, threshold_bytes: u64) -> Result<(), MetricsError> {
        warn!(used_bytes, threshold_bytes, "Memory usage above threshold");
        emit_memory_pressure(used_bytes);
        Ok(())
    }
}

struct Flusher {
    sink: Arc<dyn MetricsSink>,
    batch_size: usize,
    buffer: Vec<ExecutionRecord>,
}

impl Flusher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Record(record)) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= self.batch_size {
                            let _ = self.flush().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        let _ = ack.send(self.flush().await);
                    }
                    Some(Command::Shutdown(ack)) => {
                        let _ = self.flush().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        let _ = self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let _ = self.flush().await;
                }
            }
        }

        info!("Metrics flusher stopped");
    }

    async fn flush(&mut self) -> Result<usize, MetricsError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut self.buffer);
        let count = batch.len();

        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                debug!(count, "Flushed execution records");
                Ok(count)
            }
            Err(e) => {
                counter!(names::RECORDS_DROPPED_TOTAL, "reason" => "sink_error").increment(count as u64);
                warn!(count, error = %e, "Failed to flush execution records");
                Err(e)
            }
        }
    }
}
