use super::{DeadLetterBackend, DeadLetterEntry, DeadLetterId};
use crate::error::DeadLetterResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Dead letter backend held in memory, insertion ordered.
#[derive(Default)]
pub struct InMemoryDeadLetterBackend {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift an entry's creation time into the past.
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &DeadLetterId, by: chrono::Duration) {
        if let Some(entry) = self.entries.write().iter_mut().find(|e| &e.id == id) {
            entry.created_at = entry.created_at - by;
        }
    }
}

#[async_trait]
impl DeadLetterBackend for InMemoryDeadLetterBackend {
    async fn insert(&self, entry: &DeadLetterEntry) -> DeadLetterResult<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn update(&self, entry: &DeadLetterEntry) -> DeadLetterResult<()> {
        if let Some(existing) = self.entries.write().iter_mut().find(|e| e.id == entry.id) {
            *existing = entry.clone();
        }
        Ok(())
    }

    async fn remove(&self, id: &DeadLetterId) -> DeadLetterResult<bool> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| &e.id != id);
        Ok(entries.len() < before)
    }

    async fn pending_recovery(&self, limit: usize, max_retries: u32) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        let entries = self.entries.read();
        let mut pending: Vec<_> = entries
            .iter()
            .filter(|e| e.is_recoverable(max_retries))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn created_before(&self, cutoff: DateTime<Utc>) -> DeadLetterResult<Vec<DeadLetterId>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.id.clone())
            .collect())
    }

    async fn list(&self, limit: usize) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        let mut entries = self.entries.read().clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn count(&self) -> DeadLetterResult<u64> {
        Ok(self.entries.read().len() as u64)
    }
}
