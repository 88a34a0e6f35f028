//! Handlers for the built-in job kinds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_jobs::{HandlerRegistry, Job, JobError, JobHandler, JobKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Inbound webhook delivered by an external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Reminder due for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub reminder_id: String,
    pub recipient: String,
    pub message: String,
    pub due_at: DateTime<Utc>,
}

pub struct WebhookHandler;

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let event: WebhookEvent = job.payload_as()?;
        if event.event_id.trim().is_empty() {
            return Err(JobError::Validation("webhook event_id is empty".to_string()));
        }
        if event.source.trim().is_empty() {
            return Err(JobError::Validation("webhook source is empty".to_string()));
        }

        info!(
            job_id = %job.id,
            event_id = %event.event_id,
            source = %event.source,
            event_type = %event.event_type,
            attempt = job.attempts,
            "Processing webhook event"
        );
        Ok(())
    }
}

pub struct ReminderHandler;

#[async_trait]
impl JobHandler for ReminderHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let reminder: Reminder = job.payload_as()?;
        if !reminder.recipient.contains('@') {
            return Err(JobError::Validation(format!(
                "invalid reminder recipient: {}",
                reminder.recipient
            )));
        }

        let lateness = Utc::now() - reminder.due_at;
        if lateness < chrono::Duration::zero() {
            debug!(reminder_id = %reminder.reminder_id, "Reminder dispatched ahead of due time");
        }

        info!(
            job_id = %job.id,
            reminder_id = %reminder.reminder_id,
            recipient = %reminder.recipient,
            lateness_secs = lateness.num_seconds(),
            "Dispatching reminder"
        );
        Ok(())
    }
}

/// Registry with a handler for every built-in kind.
pub fn default_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(JobKind::WebhookProcessing, Arc::new(WebhookHandler))
        .register(JobKind::ReminderProcessing, Arc::new(ReminderHandler));
    handlers
}
