use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Job lifecycle states as tracked by the print queue.
///
/// `Waiting → Sending → AwaitingCompletion → {Succeeded | Retrying → Waiting | PermanentlyFailed}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Waiting,
    Sending,
    AwaitingCompletion,
    Succeeded,
    Retrying,
    PermanentlyFailed,
}

impl JobState {
    /// Whether the job currently holds the render surface.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Sending | JobState::AwaitingCompletion)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::PermanentlyFailed)
    }
}

/// Head-of-line job summary included in status broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
    pub state: JobState,
}

/// Read-only queue snapshot, recomputed on every queue mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<JobSummary>,
}

/// Lifecycle events broadcast by the print queue.
///
/// Consumed by the notification reporter (desktop notifications, UI status
/// broadcast), telemetry and the SSE endpoint of the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    StatusChanged {
        status: QueueStatus,
    },
    JobQueued {
        job_id: String,
        position: usize,
    },
    JobDelivered {
        job_id: String,
        attempt: u32,
        max_retries: u32,
    },
    JobRetrying {
        job_id: String,
        retries: u32,
        max_retries: u32,
        /// Why the previous attempt did not complete
        reason: String,
    },
    JobSucceeded {
        job_id: String,
        attempts: u32,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<PathBuf>,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::StatusChanged { .. } => None,
            QueueEvent::JobQueued { job_id, .. }
            | QueueEvent::JobDelivered { job_id, .. }
            | QueueEvent::JobRetrying { job_id, .. }
            | QueueEvent::JobSucceeded { job_id, .. }
            | QueueEvent::JobFailed { job_id, .. } => Some(job_id),
        }
    }

    /// State the event moves its job into.
    pub fn job_state(&self) -> Option<JobState> {
        match self {
            QueueEvent::StatusChanged { .. } => None,
            QueueEvent::JobQueued { .. } => Some(JobState::Waiting),
            QueueEvent::JobDelivered { .. } => Some(JobState::AwaitingCompletion),
            QueueEvent::JobRetrying { .. } => Some(JobState::Retrying),
            QueueEvent::JobSucceeded { .. } => Some(JobState::Succeeded),
            QueueEvent::JobFailed { .. } => Some(JobState::PermanentlyFailed),
        }
    }
}
