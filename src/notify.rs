//! Adapter between queue lifecycle events and the desktop: per-job
//! notifications plus status broadcast to every open UI window.

use crate::status::{QueueEvent, QueueStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Queued,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub job_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

/// Desktop notification primitive.
pub trait DesktopNotifier: Send + Sync {
    fn show(&self, notification: &Notification);

    /// Dismiss the notification currently shown for `job_id`.
    fn dismiss(&self, job_id: &str);
}

/// A UI window (or any listener) interested in queue status.
pub trait StatusSink: Send + Sync {
    fn status_changed(&self, status: &QueueStatus);
}

/// Notifier that only writes notifications to the log.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl DesktopNotifier for TracingNotifier {
    fn show(&self, notification: &Notification) {
        info!(
            job_id = %notification.job_id,
            kind = ?notification.kind,
            "{}: {}",
            notification.title,
            notification.body
        );
    }

    fn dismiss(&self, job_id: &str) {
        debug!("Dismissed notification for job {}", job_id);
    }
}

/// Turns [`QueueEvent`]s into desktop notifications and status broadcasts.
pub struct NotificationReporter {
    notifier: Arc<dyn DesktopNotifier>,
    sinks: Vec<Arc<dyn StatusSink>>,
    /// Jobs with a notification currently on screen
    active: Mutex<HashMap<String, NotificationKind>>,
}

impl NotificationReporter {
    pub fn new(notifier: Arc<dyn DesktopNotifier>) -> Self {
        Self {
            notifier,
            sinks: Vec::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of jobs whose "queued" notification has not been settled yet.
    pub fn pending_notifications(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|kind| **kind == NotificationKind::Queued)
            .count()
    }

    pub fn handle_event(&self, event: &QueueEvent) {
        let notification = match event {
            QueueEvent::StatusChanged { status } => {
                for sink in &self.sinks {
                    sink.status_changed(status);
                }
                return;
            }
            QueueEvent::JobDelivered { .. } => return,
            QueueEvent::JobQueued { job_id, position } => {
                let body = if *position > 1 {
                    format!("Waiting behind {} other job(s)", position - 1)
                } else {
                    "Sending to printer".to_string()
                };
                Notification {
                    job_id: job_id.clone(),
                    kind: NotificationKind::Queued,
                    title: "Print job queued".to_string(),
                    body,
                    file_path: None,
                }
            }
            QueueEvent::JobRetrying {
                job_id,
                retries,
                max_retries,
                reason,
            } => Notification {
                job_id: job_id.clone(),
                kind: NotificationKind::Queued,
                title: "Retrying print job".to_string(),
                body: format!("{} (attempt {} of {})", reason, retries + 1, max_retries),
                file_path: None,
            },
            QueueEvent::JobSucceeded {
                job_id, file_path, ..
            } => {
                let (title, body) = match file_path {
                    Some(path) => ("PDF exported".to_string(), format!("Saved to {}", path.display())),
                    None => ("Print complete".to_string(), "The document was sent to the printer".to_string()),
                };
                Notification {
                    job_id: job_id.clone(),
                    kind: NotificationKind::Succeeded,
                    title,
                    body,
                    file_path: file_path.clone(),
                }
            }
            QueueEvent::JobFailed { job_id, error } => Notification {
                job_id: job_id.clone(),
                kind: NotificationKind::Failed,
                title: "Print failed".to_string(),
                body: error.clone(),
                file_path: None,
            },
        };

        let settled = event.job_state().is_some_and(|state| state.is_terminal());
        self.replace(notification, settled);
    }

    /// Show `notification` in place of the job's current one. Settled jobs
    /// are no longer tracked.
    fn replace(&self, notification: Notification, settled: bool) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&notification.job_id) {
            self.notifier.dismiss(&notification.job_id);
        }
        self.notifier.show(&notification);

        if settled {
            active.remove(&notification.job_id);
        } else {
            active.insert(notification.job_id, notification.kind);
        }
    }

    /// Consume events until the queue's channel closes.
    pub fn spawn(self, mut events: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Notification reporter lagged, {} queue event(s) skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Notification reporter stopped");
        })
    }
}
