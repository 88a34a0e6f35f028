//! Ferry Jobs - Resilient Asynchronous Job Processing
//!
//! A job engine with:
//! - Typed job kinds routed to registered handlers
//! - Singleton keys for idempotent submission
//! - Exponential backoff with jitter and per-kind attempt limits
//! - Per-kind circuit breakers around handler execution
//! - A dead letter store with batch recovery and retention cleanup
//! - Buffered execution metrics that never fail a job
//! - In-memory and Redis-backed persistence
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Producer ── enqueue(kind, payload, options)                 │
//! │                 │                                            │
//! │                 ▼                                            │
//! │  ┌──────────────────────────────┐                            │
//! │  │ PersistentQueue              │  InMemoryQueue / Redis     │
//! │  │ ready · delayed · active     │                            │
//! │  └──────────────┬───────────────┘                            │
//! │                 │ fetch_next                                 │
//! │                 ▼                                            │
//! │  ┌──────────────────────────────┐                            │
//! │  │ WorkerPool ─▶ JobQueueService│                            │
//! │  │   breaker ─▶ timeout ─▶ handler                           │
//! │  └───┬──────────┬───────────┬───┘                            │
//! │      │ ack      │ nack      │ fail                           │
//! │      ▼          ▼ (backoff) ▼                                │
//! │  completed   delayed    DeadLetterStore ── process_jobs ─┐   │
//! │                                   ▲                      │   │
//! │                                   └──── resubmit ◀───────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ferry_jobs::prelude::*;
//! use futures::FutureExt;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_fn(JobKind::WebhookProcessing, |job| {
//!     async move {
//!         let event: WebhookEvent = job.payload_as()?;
//!         deliver(event).await.map_err(|e| JobError::Transient(e.to_string()))
//!     }
//!     .boxed()
//! });
//!
//! let service = Arc::new(JobQueueService::new(config, queue, handlers, dead_letters, metrics));
//! service
//!     .enqueue(
//!         JobKind::WebhookProcessing,
//!         payload,
//!         EnqueueOptions { singleton_key: Some(event_id), ..Default::default() },
//!     )
//!     .await?;
//! ```

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod handler;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod service;
pub mod worker;

pub use config::JobsConfig;
pub use dead_letter::{
    AddJobOptions, BatchOptions, BatchOutcome, CleanupOutcome, DeadLetterBackend, DeadLetterEntry,
    DeadLetterId, DeadLetterStats, DeadLetterStore, InMemoryDeadLetterBackend, JobResubmitter,
};
pub use error::{
    DeadLetterError, EnqueueError, ErrorCategory, JobError, JobResult, MetricsError, QueueError,
    QueueResult,
};
pub use handler::{FnHandler, HandlerRegistry, JobHandler};
pub use job::{Job, JobId, JobKind, JobStatus, UnknownJobKind};
pub use memory::InMemoryQueue;
pub use metrics::{
    register_metrics, BufferedMetricsRecorder, ExecutionRecord, ExecutionStatus,
    InMemoryMetricsSink, MetricsRecorder, MetricsSink,
};
pub use queue::{
    EnqueueOutcome, EnqueueRequest, PersistentQueue, QueueStats, MAX_PRIORITY, MIN_PRIORITY,
};
pub use retry::{RetryPolicies, RetryPolicy};
pub use service::{EnqueueOptions, JobOutcome, JobQueueService};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::handler::{HandlerRegistry, JobHandler};
    pub use crate::job::{Job, JobKind, JobStatus};
    pub use crate::queue::PersistentQueue;
    pub use crate::service::{EnqueueOptions, JobQueueService};
    pub use crate::{JobError, JobId, JobResult};
}
