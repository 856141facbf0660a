//! Completion bus: one-shot, job-keyed delivery of asynchronous completion
//! signals from the render surface to the waiting queue processor.

use crate::errors::{PrintError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome reported by the render surface (or its host) for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSignal {
    pub job_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Resulting file for a successful document export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl CompletionSignal {
    pub fn success(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            success: true,
            error: None,
            file_path: None,
        }
    }

    pub fn failure(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            error: Some(error.into()),
            file_path: None,
        }
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

struct Waiter {
    token: u64,
    tx: oneshot::Sender<CompletionSignal>,
}

#[derive(Default)]
struct BusInner {
    waiters: Mutex<HashMap<String, Waiter>>,
    next_token: AtomicU64,
}

impl BusInner {
    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process pub/sub channel for completion signals.
///
/// At most one subscriber exists per job id. A published signal is handed
/// synchronously to that subscriber and consumed; signals nobody waits for
/// (late or duplicate ones) are dropped.
#[derive(Clone, Default)]
pub struct CompletionBus {
    inner: Arc<BusInner>,
}

impl CompletionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single waiter for `job_id`.
    ///
    /// Dropping the returned subscription unsubscribes it.
    pub fn subscribe_once(&self, job_id: &str) -> Result<Subscription> {
        let mut waiters = self.inner.waiters();
        if waiters.contains_key(job_id) {
            warn!("Rejected second completion subscription for job {}", job_id);
            return Err(PrintError::DuplicateSubscription(job_id.to_string()));
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiters.insert(job_id.to_string(), Waiter { token, tx });
        debug!("Waiting for completion of job {}", job_id);

        Ok(Subscription {
            job_id: job_id.to_string(),
            token,
            rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Dispatch `signal` to its subscriber. Returns whether anyone received it.
    pub fn publish(&self, signal: CompletionSignal) -> bool {
        let waiter = self.inner.waiters().remove(&signal.job_id);

        match waiter {
            Some(waiter) => match waiter.tx.send(signal) {
                Ok(()) => true,
                Err(signal) => {
                    debug!("Subscriber for job {} went away, signal dropped", signal.job_id);
                    false
                }
            },
            None => {
                debug!(
                    "No subscriber for completion of job {} (success: {}), signal dropped",
                    signal.job_id, signal.success
                );
                false
            }
        }
    }

    pub fn has_subscriber(&self, job_id: &str) -> bool {
        self.inner.waiters().contains_key(job_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.waiters().len()
    }
}

/// Pending wait for one job's completion signal.
pub struct Subscription {
    job_id: String,
    token: u64,
    rx: oneshot::Receiver<CompletionSignal>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Future for Subscription {
    type Output = Result<CompletionSignal>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.map_err(|_| {
                PrintError::Queue(format!(
                    "completion bus dropped the subscription for job {}",
                    this.job_id
                ))
            })
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut waiters = inner.waiters();
        if waiters.get(&self.job_id).map(|w| w.token) == Some(self.token) {
            waiters.remove(&self.job_id);
        }
    }
}
