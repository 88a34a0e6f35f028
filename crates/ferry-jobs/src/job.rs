//! Job model: identifiers, kinds, status and the queued job record.

use crate::error::JobError;
use crate::queue::EnqueueRequest;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The kinds of work the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Processing of an inbound webhook event.
    WebhookProcessing,
    /// Dispatch of a scheduled reminder.
    ReminderProcessing,
}

impl JobKind {
    /// Every known kind.
    pub const ALL: [JobKind; 2] = [JobKind::WebhookProcessing, JobKind::ReminderProcessing];

    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::WebhookProcessing => "webhook-processing",
            JobKind::ReminderProcessing => "reminder-processing",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a job kind name does not match any known kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// Job status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed, possibly delayed.
    #[default]
    Pending,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed permanently.
    Failed,
}

impl JobStatus {
    /// Returns true for states that never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work as stored by the persistent queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Queue-assigned identifier.
    pub id: JobId,

    /// Job kind, used for handler routing and breaker selection.
    pub kind: JobKind,

    /// Opaque payload interpreted by the handler.
    pub payload: serde_json::Value,

    /// Higher runs sooner.
    pub priority: i32,

    /// Number of times the job has been claimed.
    pub attempts: u32,

    /// Claim ceiling before the job is dead-lettered.
    pub max_attempts: u32,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// Tenant used for metrics attribution.
    pub tenant_id: Option<String>,

    /// Idempotency key, unique per kind among live jobs.
    pub singleton_key: Option<String>,

    /// First retry delay computed at enqueue time.
    pub retry_delay_ms: u64,

    /// Earliest time the job may be claimed.
    pub visible_at: DateTime<Utc>,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,

    /// Times this payload has already been resubmitted from the dead letter store.
    #[serde(default)]
    pub resubmissions: u32,
}

impl Job {
    /// Builds a pending job from an enqueue request.
    pub fn from_request(id: JobId, request: EnqueueRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            attempts: 0,
            max_attempts: request.retry_limit,
            status: JobStatus::Pending,
            created_at: now,
            tenant_id: request.tenant_id,
            singleton_key: request.singleton_key,
            retry_delay_ms: request.retry_delay_ms,
            visible_at: now,
            last_error: None,
            resubmissions: request.resubmissions,
        }
    }

    /// Decode the payload into a handler-specific type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Check if max attempts reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
