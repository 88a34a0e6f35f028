//! Job handlers and their per-kind registry.

use crate::error::JobError;
use crate::job::{Job, JobKind, UnknownJobKind};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Executes jobs of one kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. Errors are classified by their variant.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Handler function type.
pub type HandlerFn = dyn Fn(Job) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync;

/// Adapts a closure into a [`JobHandler`].
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Job) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        (self.f)(job.clone()).await
    }
}

/// Maps each job kind to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `kind`.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        info!(job_kind = %kind, "Registered job handler");
        self
    }

    /// Register a handler by kind name, rejecting names that are not a known kind.
    pub fn register_named(
        &mut self,
        name: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&mut Self, UnknownJobKind> {
        let kind = name.parse::<JobKind>()?;
        Ok(self.register(kind, handler))
    }

    /// Register a closure as the handler for `kind`.
    pub fn register_fn<F>(&mut self, kind: JobKind, f: F) -> &mut Self
    where
        F: Fn(Job) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(FnHandler::new(f)))
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::queue::EnqueueRequest;
    use futures::FutureExt;
    use serde_json::json;

    fn job(kind: JobKind) -> Job {
        Job::from_request(
            JobId::new(),
            EnqueueRequest {
                kind,
                payload: json!({}),
                priority: 0,
                singleton_key: None,
                tenant_id: None,
                retry_limit: 3,
                retry_delay_ms: 1000,
                resubmissions: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_register_fn_dispatches() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::WebhookProcessing, |job| {
            async move {
                if job.kind == JobKind::WebhookProcessing {
                    Ok(())
                } else {
                    Err(JobError::Validation("wrong kind".into()))
                }
            }
            .boxed()
        });

        let handler = registry.get(JobKind::WebhookProcessing).unwrap();
        assert!(handler.handle(&job(JobKind::WebhookProcessing)).await.is_ok());
        assert!(registry.get(JobKind::ReminderProcessing).is_none());
    }

    #[test]
    fn test_register_named_rejects_unknown_kind() {
        let mut registry = HandlerRegistry::new();
        let handler: Arc<dyn JobHandler> =
            Arc::new(FnHandler::new(|_| async { Ok(()) }.boxed()));

        assert!(registry.register_named("reminder-processing", handler.clone()).is_ok());
        let err = registry.register_named("invoice-sync", handler).err().unwrap();
        assert_eq!(err.0, "invoice-sync");
        assert_eq!(registry.kinds(), vec![JobKind::ReminderProcessing]);
    }
}
