use super::ExecutionRecord;
use crate::error::MetricsError;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Durable destination for execution records.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Persist a batch of records.
    async fn write_batch(&self, records: &[ExecutionRecord]) -> Result<(), MetricsError>;
}

/// Sink that keeps every record in memory.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all persisted records.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn write_batch(&self, records: &[ExecutionRecord]) -> Result<(), MetricsError> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}
