use crate::completion::{CompletionBus, CompletionSignal};
use crate::config::QueueConfig;
use crate::errors::{PrintError, Result};
use crate::job::{DeliveryMessage, Job, JobHandle, PrintOutcome, SubmissionMessage};
use crate::status::{JobState, QueueEvent, QueueStatus};
use crate::surface::SurfaceManager;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reason attached to jobs failed by [`PrintQueue::cleanup`].
pub const QUEUE_CLEARED: &str = "Print queue was cleared";

const EVENT_CAPACITY: usize = 256;

/// Serialized FIFO print queue.
///
/// Drives exactly one job at a time through the render surface, waits for
/// its completion signal with a per-attempt timeout, re-enqueues timed out
/// jobs at the tail and settles the submitter's [`JobHandle`].
#[derive(Clone)]
pub struct PrintQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    surfaces: SurfaceManager,
    bus: CompletionBus,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    is_processing: bool,
    /// State of the head-of-line job
    head_state: JobState,
    /// Bumped by `cleanup()`; a processor from an older epoch must not touch the queue.
    epoch: u64,
    processor: Option<JoinHandle<()>>,
}

impl QueueState {
    fn snapshot(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.jobs.len(),
            is_processing: self.is_processing,
            current_job: self.jobs.front().map(|job| job.summary(self.head_state)),
        }
    }
}

/// What happened to one delivery attempt.
enum AttemptOutcome {
    Completed(CompletionSignal),
    TimedOut(PrintError),
    Failed(PrintError),
}

impl PrintQueue {
    pub fn new(config: QueueConfig, surfaces: SurfaceManager, bus: CompletionBus) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                surfaces,
                bus,
                state: Mutex::new(QueueState::default()),
                events,
            }),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Bus on which render surfaces report job outcomes.
    pub fn completion_bus(&self) -> &CompletionBus {
        &self.inner.bus
    }

    /// Subscribe to lifecycle and status events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and enqueue a job.
    ///
    /// Returns once the job is queued (and processing has been started if the
    /// queue was idle); await the returned handle for the final outcome.
    pub async fn submit(&self, message: SubmissionMessage) -> Result<JobHandle> {
        let (job, handle) = Job::from_submission(message).map_err(|e| {
            warn!("Rejected print submission: {}", e);
            e
        })?;

        let mut state = self.inner.state.lock().await;
        if state.jobs.iter().any(|queued| queued.id() == job.id()) {
            warn!("Rejected duplicate submission for job {}", job.id());
            return Err(PrintError::Validation(format!(
                "job {} is already queued",
                job.id()
            )));
        }

        let job_id = job.id().to_string();
        state.jobs.push_back(job);
        let position = state.jobs.len();
        info!("Print job {} queued (position {})", job_id, position);

        self.inner.emit(QueueEvent::JobQueued { job_id, position });
        self.inner.emit_status(&state);
        self.inner.start_processing(&mut state);

        Ok(handle)
    }

    /// Current queue snapshot.
    pub async fn status(&self) -> QueueStatus {
        self.inner.state.lock().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fail every outstanding job and reset the queue.
    ///
    /// Each job gets a synthetic failure completion signal and a `JobFailed`
    /// event so per-job UI state can settle, then its handle is rejected.
    /// Returns the number of jobs that were cleared.
    pub async fn cleanup(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        state.epoch += 1;
        state.is_processing = false;
        if let Some(processor) = state.processor.take() {
            processor.abort();
        }
        state.head_state = JobState::Waiting;
        let jobs: Vec<Job> = state.jobs.drain(..).collect();
        let cleared = jobs.len();

        for job in jobs {
            let job_id = job.id().to_string();
            self.inner
                .bus
                .publish(CompletionSignal::failure(&job_id, QUEUE_CLEARED));
            self.inner.emit(QueueEvent::JobFailed {
                job_id: job_id.clone(),
                error: QUEUE_CLEARED.to_string(),
            });
            job.reject(PrintError::QueueCleared { job_id });
        }

        if cleared > 0 {
            info!("Print queue cleared, {} job(s) failed", cleared);
        } else {
            debug!("Print queue cleanup on empty queue");
        }
        self.inner.emit_status(&state);
        cleared
    }

    /// Clear the queue and release the render surface.
    pub async fn shutdown(&self) {
        self.cleanup().await;
        self.inner.surfaces.reset().await;
    }
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn emit_status(&self, state: &QueueState) {
        self.emit(QueueEvent::StatusChanged {
            status: state.snapshot(),
        });
    }

    /// Spawn the processor unless one is already running or there is nothing to do.
    fn start_processing(self: &Arc<Self>, state: &mut QueueState) {
        if state.is_processing || state.jobs.is_empty() {
            return;
        }
        state.is_processing = true;
        self.emit_status(state);

        let inner = self.clone();
        let epoch = state.epoch;
        state.processor = Some(tokio::spawn(async move { inner.run(epoch).await }));
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        debug!("Print queue processor started (epoch {})", epoch);

        while let Some(delivery) = self.begin_attempt(epoch).await {
            let outcome = self.attempt(epoch, delivery.clone()).await;

            if !self.finish_attempt(epoch, &delivery, outcome).await {
                break;
            }

            // Let the render surface settle before the next delivery
            tokio::time::sleep(self.config.inter_job_delay()).await;
        }

        debug!("Print queue processor stopped (epoch {})", epoch);
    }

    /// Mark the head-of-line job as sending and build its delivery message.
    /// Returns `None` (and stops processing) when the queue is empty or was
    /// cleared since this processor started.
    async fn begin_attempt(&self, epoch: u64) -> Option<DeliveryMessage> {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return None;
        }

        debug_assert!(!state.head_state.is_in_flight());
        let Some(job) = state.jobs.front() else {
            state.is_processing = false;
            self.emit_status(&state);
            return None;
        };

        let delivery = job.delivery(self.config.max_retries);
        state.head_state = JobState::Sending;
        info!(
            "Sending print job {} (attempt {}/{})",
            delivery.job_id, delivery.attempt, delivery.max_retries
        );
        self.emit_status(&state);
        Some(delivery)
    }

    async fn attempt(&self, epoch: u64, delivery: DeliveryMessage) -> AttemptOutcome {
        let job_id = delivery.job_id.clone();
        let attempt = delivery.attempt;

        // Subscribe before delivering so a fast surface cannot complete unseen
        let subscription = match self.bus.subscribe_once(&job_id) {
            Ok(subscription) => subscription,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        if let Err(e) = delivery.validate() {
            return AttemptOutcome::Failed(e);
        }

        let surface = match self.surfaces.await_ready().await {
            Ok(surface) => surface,
            Err(e) => {
                error!("Could not deliver print job {}: {}", job_id, e);
                return AttemptOutcome::Failed(e);
            }
        };

        {
            // Deliver under the state lock so a concurrent cleanup either
            // precedes the delivery or sees the job in flight
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                debug!("Queue was cleared before job {} reached the surface", job_id);
                return AttemptOutcome::Failed(PrintError::QueueCleared { job_id });
            }

            if let Err(e) = self.surfaces.deliver(surface.as_ref(), delivery) {
                error!("Could not deliver print job {}: {}", job_id, e);
                return AttemptOutcome::Failed(e);
            }

            state.head_state = JobState::AwaitingCompletion;
            self.emit(QueueEvent::JobDelivered {
                job_id: job_id.clone(),
                attempt,
                max_retries: self.config.max_retries,
            });
            self.emit_status(&state);
        }

        match tokio::time::timeout(self.config.job_timeout(), subscription).await {
            Ok(Ok(signal)) => AttemptOutcome::Completed(signal),
            Ok(Err(e)) => AttemptOutcome::Failed(e),
            Err(_) => {
                let timeout = PrintError::TimeoutExceeded {
                    job_id,
                    timeout: self.config.job_timeout(),
                };
                warn!("{}", timeout);
                AttemptOutcome::TimedOut(timeout)
            }
        }
    }

    /// Apply the transition for a finished attempt. Returns whether another
    /// pass should follow.
    async fn finish_attempt(
        &self,
        epoch: u64,
        delivery: &DeliveryMessage,
        outcome: AttemptOutcome,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            debug!(
                "Queue was cleared while job {} was in flight, dropping its outcome",
                delivery.job_id
            );
            return false;
        }

        let head_matches = state
            .jobs
            .front()
            .map(|job| job.id() == delivery.job_id)
            .unwrap_or(false);
        if !head_matches {
            error!(
                "Head of print queue is no longer job {}, skipping its outcome",
                delivery.job_id
            );
        } else if let Some(job) = state.jobs.pop_front() {
            self.settle(&mut state, job, outcome);
        }
        state.head_state = JobState::Waiting;

        let more = !state.jobs.is_empty();
        if !more {
            state.is_processing = false;
        }
        self.emit_status(&state);
        more
    }

    fn settle(&self, state: &mut QueueState, job: Job, outcome: AttemptOutcome) {
        let job_id = job.id().to_string();
        let attempts = job.attempt();

        match outcome {
            AttemptOutcome::Completed(signal) if signal.success => {
                let duration_ms = job.elapsed_ms();
                info!("Print job {} succeeded (attempt {})", job_id, attempts);
                self.emit(QueueEvent::JobSucceeded {
                    job_id: job_id.clone(),
                    attempts,
                    duration_ms,
                    file_path: signal.file_path.clone(),
                });
                job.resolve(PrintOutcome {
                    job_id,
                    attempts,
                    file_path: signal.file_path,
                    completed_at: Utc::now(),
                });
            }
            AttemptOutcome::Completed(signal) => {
                let error = PrintError::ReportedFailure {
                    job_id: job_id.clone(),
                    message: signal
                        .error
                        .unwrap_or_else(|| "Unknown print error".to_string()),
                };
                self.fail(job, error);
            }
            AttemptOutcome::TimedOut(timeout) => {
                let job = job.into_retry();
                if job.retries() < self.config.max_retries {
                    warn!(
                        "Print job {} timed out, retrying ({}/{})",
                        job_id,
                        job.retries(),
                        self.config.max_retries
                    );
                    self.emit(QueueEvent::JobRetrying {
                        job_id: job_id.clone(),
                        retries: job.retries(),
                        max_retries: self.config.max_retries,
                        reason: timeout.to_string(),
                    });
                    debug_assert!(state.jobs.iter().all(|queued| queued.id() != job_id));
                    state.jobs.push_back(job);
                } else {
                    let error = PrintError::RetriesExhausted {
                        job_id,
                        attempts: job.retries(),
                    };
                    self.fail(job, error);
                }
            }
            AttemptOutcome::Failed(error) => self.fail(job, error),
        }
    }

    fn fail(&self, job: Job, error: PrintError) {
        error!("Print job {} failed permanently: {}", job.id(), error);
        self.emit(QueueEvent::JobFailed {
            job_id: job.id().to_string(),
            error: error.to_string(),
        });
        job.reject(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{MockRenderSurface, MockSurfaceFactory, RenderSurface};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    fn config() -> QueueConfig {
        QueueConfig {
            max_retries: 3,
            job_timeout_ms: 60_000,
            inter_job_delay_ms: 1_000,
            surface_ready_timeout_ms: 5_000,
            surface_create_attempts: 1,
        }
    }

    /// Queue over a mock surface that forwards every delivery to a channel.
    fn queue_with_channel() -> (PrintQueue, mpsc::UnboundedReceiver<DeliveryMessage>, watch::Sender<bool>) {
        let (ready_tx, ready_rx) = watch::channel(true);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut surface = MockRenderSurface::new();
        surface.expect_id().returning(|| "mock".to_string());
        surface.expect_is_destroyed().returning(|| false);
        surface.expect_readiness().returning(move || ready_rx.clone());
        surface.expect_deliver().returning(move |message| {
            tx.send(message).map_err(|e| PrintError::Queue(e.to_string()))
        });
        let surface: Arc<dyn RenderSurface> = Arc::new(surface);

        let mut factory = MockSurfaceFactory::new();
        factory.expect_create().returning(move || Ok(surface.clone()));

        let surfaces = SurfaceManager::new(Arc::new(factory), &config());
        let queue = PrintQueue::new(config(), surfaces, CompletionBus::new()).unwrap();
        (queue, rx, ready_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resolves_and_empties_queue() {
        let (queue, mut deliveries, _ready) = queue_with_channel();

        let handle = queue.submit(SubmissionMessage::new("A", "caption")).await.unwrap();
        assert!(queue.status().await.is_processing);

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.job_id, "A");
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.max_retries, 3);

        assert!(queue.completion_bus().publish(CompletionSignal::success("A")));
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.attempts, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = queue.status().await;
        assert_eq!(status.queue_length, 0);
        assert!(!status.is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_failure_is_terminal() {
        let (queue, mut deliveries, _ready) = queue_with_channel();

        let handle = queue.submit(SubmissionMessage::new("A", "caption")).await.unwrap();
        deliveries.recv().await.unwrap();
        queue
            .completion_bus()
            .publish(CompletionSignal::failure("A", "printer out of paper"));

        let err = handle.await.unwrap_err();
        assert!(matches!(err, PrintError::ReportedFailure { ref message, .. } if message == "printer out of paper"));
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries() {
        let (queue, mut deliveries, _ready) = queue_with_channel();

        let handle = queue.submit(SubmissionMessage::new("B", "caption")).await.unwrap();
        let err = handle.await.unwrap_err();
        assert_eq!(err.to_string(), "Print job B failed after 3 attempts");

        let attempts: Vec<u32> = std::iter::from_fn(|| deliveries.try_recv().ok())
            .map(|d| d.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_job_id_rejected_while_queued() {
        let (queue, _deliveries, _ready) = queue_with_channel();

        let _a = queue.submit(SubmissionMessage::new("A", "one")).await.unwrap();
        let err = queue.submit(SubmissionMessage::new("A", "two")).await.unwrap_err();
        assert!(matches!(err, PrintError::Validation(_)));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_head_of_line() {
        let (queue, mut deliveries, _ready) = queue_with_channel();

        let _a = queue.submit(SubmissionMessage::new("A", "one")).await.unwrap();
        let _b = queue.submit(SubmissionMessage::new("B", "two")).await.unwrap();
        deliveries.recv().await.unwrap();

        let status = queue.status().await;
        assert_eq!(status.queue_length, 2);
        let current = status.current_job.unwrap();
        assert_eq!(current.job_id, "A");
        assert_eq!(current.state, JobState::AwaitingCompletion);
        assert_eq!(current.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_never_ready_fails_without_retry() {
        let (queue, mut deliveries, ready) = queue_with_channel();
        ready.send_replace(false);

        let handle = queue.submit(SubmissionMessage::new("A", "one")).await.unwrap();
        let err = handle.await.unwrap_err();
        assert!(matches!(err, PrintError::SurfaceUnavailable(_)));
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_while_surface_loading_drops_stale_delivery() {
        let (queue, mut deliveries, ready) = queue_with_channel();
        ready.send_replace(false);

        let old = queue.submit(SubmissionMessage::new("A", "old")).await.unwrap();
        // Let the processor start waiting on readiness
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.cleanup().await, 1);
        assert!(matches!(old.await, Err(PrintError::QueueCleared { .. })));

        let new = queue.submit(SubmissionMessage::new("A", "new")).await.unwrap();
        ready.send_replace(true);

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.document, "new");
        assert!(queue.completion_bus().publish(CompletionSignal::success("A")));
        assert_eq!(new.await.unwrap().attempts, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_queue_reports_single_idle_status() {
        let (queue, mut deliveries, _ready) = queue_with_channel();
        let mut events = queue.subscribe();

        let handle = queue.submit(SubmissionMessage::new("A", "caption")).await.unwrap();
        deliveries.recv().await.unwrap();
        queue.completion_bus().publish(CompletionSignal::success("A"));
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let statuses: Vec<QueueStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                QueueEvent::StatusChanged { status } => Some(status),
                _ => None,
            })
            .collect();
        assert!(statuses
            .iter()
            .all(|status| status.queue_length > 0 || !status.is_processing));
        let last = statuses.last().unwrap();
        assert_eq!(last.queue_length, 0);
        assert!(!last.is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_event_carries_timeout_reason() {
        let (queue, mut deliveries, _ready) = queue_with_channel();
        let mut events = queue.subscribe();

        let handle = queue.submit(SubmissionMessage::new("D", "caption")).await.unwrap();
        deliveries.recv().await.unwrap();
        // First attempt times out
        let second = deliveries.recv().await.unwrap();
        assert_eq!(second.attempt, 2);
        queue.completion_bus().publish(CompletionSignal::success("D"));
        assert_eq!(handle.await.unwrap().attempts, 2);

        let reasons: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                QueueEvent::JobRetrying { reason, retries, .. } => {
                    assert_eq!(retries, 1);
                    Some(reason)
                }
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["Print job D timed out after 60s".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let factory = MockSurfaceFactory::new();
        let bad = QueueConfig {
            max_retries: 0,
            ..config()
        };
        let surfaces = SurfaceManager::new(Arc::new(factory), &bad);
        assert!(PrintQueue::new(bad, surfaces, CompletionBus::new()).is_err());
    }
}
