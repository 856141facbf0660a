use crate::errors::{PrintError, Result};
use crate::status::{JobState, JobSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// What the render surface should do with a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Print,
    Pdf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl Margins {
    fn is_valid(&self) -> bool {
        [self.top, self.bottom, self.left, self.right]
            .iter()
            .all(|m| m.is_finite() && *m >= 0.0)
    }
}

/// Rendering options forwarded untouched to the render surface.
///
/// Keys the queue does not know about are kept in `extra` so newer
/// surfaces can receive settings without a queue change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    pub mode: RenderMode,
    pub silent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margins: Option<Margins>,
    pub landscape: bool,
    pub print_background: bool,
    pub copies: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            mode: RenderMode::Print,
            silent: false,
            device_name: None,
            page_size: None,
            margins: None,
            landscape: false,
            print_background: true,
            copies: 1,
            output_path: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl RenderOptions {
    pub fn pdf() -> Self {
        Self {
            mode: RenderMode::Pdf,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.copies == 0 {
            return Err(PrintError::Validation(
                "copies must be at least 1".to_string(),
            ));
        }
        if let Some(margins) = &self.margins {
            if !margins.is_valid() {
                return Err(PrintError::Validation(
                    "margins must be finite and non-negative".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Submission message as received from a UI window or the HTTP API.
///
/// `document` stays an untyped JSON value until validation so that a
/// non-string payload is rejected instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionMessage {
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub document: serde_json::Value,
    #[serde(default)]
    pub options: RenderOptions,
}

impl SubmissionMessage {
    pub fn new(job_id: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            document: serde_json::Value::String(document.into()),
            options: RenderOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }
}

fn check_payload(job_id: &str, document: &str) -> Result<()> {
    if job_id.trim().is_empty() {
        return Err(PrintError::Validation("jobId must not be empty".to_string()));
    }
    if document.is_empty() {
        return Err(PrintError::Validation(format!(
            "document for job {} must not be empty",
            job_id
        )));
    }
    Ok(())
}

/// Payload forwarded to the render surface for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMessage {
    pub job_id: String,
    pub document: String,
    pub options: RenderOptions,
    pub attempt: u32,
    pub max_retries: u32,
}

impl DeliveryMessage {
    /// Structural check run right before the payload reaches the surface.
    pub fn validate(&self) -> Result<()> {
        check_payload(&self.job_id, &self.document)?;
        self.options.validate()?;
        if self.attempt == 0 || self.attempt > self.max_retries {
            return Err(PrintError::Validation(format!(
                "attempt {} out of range 1..={}",
                self.attempt, self.max_retries
            )));
        }
        Ok(())
    }
}

/// Successful result handed back to the submitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintOutcome {
    pub job_id: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub completed_at: DateTime<Utc>,
}

/// One queued unit of document-delivery work.
///
/// Owned by the print queue from submission until it is dequeued; the
/// completion sender moves with the job when it is re-enqueued for a retry
/// so the original caller sees the final outcome.
#[derive(Debug)]
pub struct Job {
    id: String,
    document: String,
    options: RenderOptions,
    retries: u32,
    enqueued_at: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
    completion: Option<oneshot::Sender<Result<PrintOutcome>>>,
}

impl Job {
    /// Validate a submission and build the job together with the caller's handle.
    pub fn from_submission(message: SubmissionMessage) -> Result<(Job, JobHandle)> {
        let document = match message.document {
            serde_json::Value::String(text) => text,
            other => {
                return Err(PrintError::Validation(format!(
                    "document must be a string, got {}",
                    json_kind(&other)
                )))
            }
        };
        check_payload(&message.job_id, &document)?;
        message.options.validate()?;

        let (tx, rx) = oneshot::channel();
        let now = Utc::now();
        let job = Job {
            id: message.job_id.clone(),
            document,
            options: message.options,
            retries: 0,
            enqueued_at: now,
            submitted_at: now,
            completion: Some(tx),
        };
        let handle = JobHandle {
            job_id: message.job_id,
            rx,
        };
        Ok((job, handle))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// 1-based attempt number of the next delivery.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.submitted_at).num_milliseconds().max(0) as u64
    }

    pub fn delivery(&self, max_retries: u32) -> DeliveryMessage {
        DeliveryMessage {
            job_id: self.id.clone(),
            document: self.document.clone(),
            options: self.options.clone(),
            attempt: self.attempt(),
            max_retries,
        }
    }

    pub fn summary(&self, state: JobState) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            enqueued_at: self.enqueued_at,
            retries: self.retries,
            state,
        }
    }

    /// Count one timed-out attempt and restart the enqueue clock.
    pub(crate) fn into_retry(mut self) -> Job {
        self.retries += 1;
        self.enqueued_at = Utc::now();
        self
    }

    pub(crate) fn resolve(mut self, outcome: PrintOutcome) {
        if let Some(tx) = self.completion.take() {
            if tx.send(Ok(outcome)).is_err() {
                debug!("Submitter of job {} is no longer waiting", self.id);
            }
        }
    }

    pub(crate) fn reject(mut self, error: PrintError) {
        if let Some(tx) = self.completion.take() {
            if tx.send(Err(error)).is_err() {
                debug!("Submitter of job {} is no longer waiting", self.id);
            }
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Caller side of a submitted job. Resolves once the queue settles the job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    rx: oneshot::Receiver<Result<PrintOutcome>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Future for JobHandle {
    type Output = Result<PrintOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(PrintError::Queue(format!(
                "job {} was dropped without a result",
                this.job_id
            ))),
        })
    }
}
