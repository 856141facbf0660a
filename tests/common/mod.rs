// Common test utilities and fixtures

use livetext_printer::{
    CompletionBus, CompletionSignal, DeliveryMessage, PrintError, PrintQueue, QueueConfig,
    RenderSurface, Result, SubmissionMessage, SurfaceFactory, SurfaceManager,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// What a mock surface does after accepting a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Reply {
    /// Report nothing; the test publishes signals itself or lets the job time out
    Manual,
    Succeed,
    Fail,
}

/// A delivery recorded by a mock surface
#[derive(Debug, Clone)]
pub struct Delivery {
    pub surface_id: String,
    pub message: DeliveryMessage,
}

/// Mock render surface for testing
#[allow(dead_code)]
pub struct MockSurface {
    pub id: String,
    bus: CompletionBus,
    ready: watch::Sender<bool>,
    destroyed: AtomicBool,
    should_fail: Arc<AtomicBool>,
    reply: Arc<Mutex<Reply>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

#[allow(dead_code)]
impl MockSurface {
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.ready.send_replace(false);
    }
}

impl RenderSurface for MockSurface {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    fn deliver(&self, message: DeliveryMessage) -> Result<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(PrintError::SurfaceUnavailable(
                "Simulated surface failure".to_string(),
            ));
        }

        let job_id = message.job_id.clone();
        let _ = self.deliveries.send(Delivery {
            surface_id: self.id.clone(),
            message,
        });

        let reply = *self.reply.lock().unwrap();
        match reply {
            Reply::Manual => {}
            Reply::Succeed => {
                self.bus.publish(CompletionSignal::success(&job_id));
            }
            Reply::Fail => {
                self.bus
                    .publish(CompletionSignal::failure(&job_id, "Simulated print failure"));
            }
        }
        Ok(())
    }
}

/// Mock surface factory that records every surface it creates
#[allow(dead_code)]
pub struct MockSurfaceFactory {
    bus: CompletionBus,
    created: AtomicUsize,
    current: Mutex<Option<Arc<MockSurface>>>,
    should_fail: Arc<AtomicBool>,
    reply: Arc<Mutex<Reply>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

#[allow(dead_code)]
impl MockSurfaceFactory {
    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn creation_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Simulate the user closing the surface's window.
    pub fn destroy_current(&self) {
        if let Some(surface) = self.current.lock().unwrap().as_ref() {
            surface.destroy();
        }
    }
}

impl SurfaceFactory for MockSurfaceFactory {
    fn create(&self) -> Result<Arc<dyn RenderSurface>> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let surface = Arc::new(MockSurface {
            id: format!("mock-{}", n),
            bus: self.bus.clone(),
            ready: watch::channel(true).0,
            destroyed: AtomicBool::new(false),
            should_fail: self.should_fail.clone(),
            reply: self.reply.clone(),
            deliveries: self.deliveries.clone(),
        });
        *self.current.lock().unwrap() = Some(surface.clone());
        Ok(surface)
    }
}

/// Test queue configuration builder
pub struct TestConfigBuilder {
    config: QueueConfig,
}

#[allow(dead_code)]
impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: QueueConfig {
                max_retries: 3,
                job_timeout_ms: 60_000,
                inter_job_delay_ms: 1_000,
                surface_ready_timeout_ms: 5_000,
                surface_create_attempts: 1,
            },
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_job_timeout_ms(mut self, ms: u64) -> Self {
        self.config.job_timeout_ms = ms;
        self
    }

    pub fn with_inter_job_delay_ms(mut self, ms: u64) -> Self {
        self.config.inter_job_delay_ms = ms;
        self
    }

    pub fn build(self) -> QueueConfig {
        self.config
    }
}

/// Queue wired to a mock surface factory
#[allow(dead_code)]
pub struct TestQueue {
    pub queue: PrintQueue,
    pub factory: Arc<MockSurfaceFactory>,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[allow(dead_code)]
impl TestQueue {
    pub fn new(config: QueueConfig, reply: Reply) -> Self {
        let bus = CompletionBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(MockSurfaceFactory {
            bus: bus.clone(),
            created: AtomicUsize::new(0),
            current: Mutex::new(None),
            should_fail: Arc::new(AtomicBool::new(false)),
            reply: Arc::new(Mutex::new(reply)),
            deliveries: tx,
        });

        let surfaces = SurfaceManager::new(factory.clone(), &config);
        let queue = PrintQueue::new(config, surfaces, bus).expect("valid test config");
        Self {
            queue,
            factory,
            deliveries: rx,
        }
    }

    /// Next delivery; with paused time this lets pending timeouts fire.
    pub async fn next_delivery(&mut self) -> Delivery {
        self.deliveries.recv().await.expect("delivery channel closed")
    }

    /// Deliveries recorded so far, without waiting.
    pub fn drain_deliveries(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.deliveries.try_recv().ok()).collect()
    }
}

/// Create a test submission with a unique job id
#[allow(dead_code)]
pub fn create_test_submission() -> SubmissionMessage {
    let job_id = format!("job_{}", uuid::Uuid::new_v4());
    SubmissionMessage::new(
        job_id,
        "<html><body><p>Speaker 1: Good morning, everyone.</p></body></html>",
    )
}
