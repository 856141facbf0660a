use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrintError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Render surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("Print job {job_id} timed out after {timeout:?}")]
    TimeoutExceeded { job_id: String, timeout: Duration },

    #[error("Print job {job_id} failed: {message}")]
    ReportedFailure { job_id: String, message: String },

    #[error("Print job {job_id} failed after {attempts} attempts")]
    RetriesExhausted { job_id: String, attempts: u32 },

    #[error("Print job {job_id} cancelled: print queue was cleared")]
    QueueCleared { job_id: String },

    #[error("Duplicate completion subscription for job {0}")]
    DuplicateSubscription(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PrintError {
    /// Job id the error refers to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            PrintError::TimeoutExceeded { job_id, .. }
            | PrintError::ReportedFailure { job_id, .. }
            | PrintError::RetriesExhausted { job_id, .. }
            | PrintError::QueueCleared { job_id } => Some(job_id),
            PrintError::DuplicateSubscription(job_id) => Some(job_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PrintError>;
