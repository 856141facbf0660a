use crate::config::QueueConfig;
use crate::errors::{PrintError, Result};
use crate::job::DeliveryMessage;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// A rendering target that turns delivered documents into printed pages or
/// exported files.
///
/// Delivery is fire-and-forget: the outcome arrives later as a
/// [`CompletionSignal`](crate::completion::CompletionSignal) on the
/// completion bus.
#[cfg_attr(test, mockall::automock)]
pub trait RenderSurface: Send + Sync {
    fn id(&self) -> String;

    /// True once the surface (or its host window) has been closed.
    fn is_destroyed(&self) -> bool;

    /// Loading state; flips to `true` when the surface can accept deliveries.
    fn readiness(&self) -> watch::Receiver<bool>;

    fn deliver(&self, message: DeliveryMessage) -> Result<()>;
}

/// Creates render surfaces on demand.
#[cfg_attr(test, mockall::automock)]
pub trait SurfaceFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn RenderSurface>>;
}

/// Owns the single lazily created render surface and replaces it when it
/// has been destroyed between jobs.
pub struct SurfaceManager {
    factory: Arc<dyn SurfaceFactory>,
    current: Mutex<Option<Arc<dyn RenderSurface>>>,
    ready_timeout: Duration,
    create_attempts: u32,
}

impl SurfaceManager {
    pub fn new(factory: Arc<dyn SurfaceFactory>, config: &QueueConfig) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
            ready_timeout: config.surface_ready_timeout(),
            create_attempts: config.surface_create_attempts.max(1),
        }
    }

    /// Return the live surface, creating a replacement if there is none or
    /// the previous one was destroyed.
    pub async fn get_or_create(&self) -> Result<Arc<dyn RenderSurface>> {
        let mut current = self.current.lock().await;

        if let Some(surface) = current.as_ref() {
            if !surface.is_destroyed() {
                return Ok(surface.clone());
            }
            info!("Render surface {} was destroyed, creating a replacement", surface.id());
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.create_attempts.saturating_sub(1) as usize);

        let factory = self.factory.clone();
        let surface = (|| async { factory.create() })
            .retry(backoff)
            .when(|e| !matches!(e, PrintError::Config(_)))
            .notify(|e, delay| warn!("Render surface creation failed ({}), retrying in {:?}", e, delay))
            .await
            .map_err(|e| match e {
                PrintError::SurfaceUnavailable(_) => e,
                other => PrintError::SurfaceUnavailable(format!("could not create render surface: {}", other)),
            })?;

        info!("Render surface {} created", surface.id());
        *current = Some(surface.clone());
        Ok(surface)
    }

    /// Obtain a surface and wait, bounded by the configured timeout, until it
    /// has finished loading.
    pub async fn await_ready(&self) -> Result<Arc<dyn RenderSurface>> {
        let surface = self.get_or_create().await?;
        let mut readiness = surface.readiness();

        let waited = tokio::time::timeout(
            self.ready_timeout,
            async { readiness.wait_for(|ready| *ready).await.map(|_| ()) },
        )
        .await;

        match waited {
            Ok(Ok(())) => {
                debug!("Render surface {} is ready", surface.id());
                Ok(surface)
            }
            Ok(Err(_)) => Err(PrintError::SurfaceUnavailable(format!(
                "render surface {} closed while loading",
                surface.id()
            ))),
            Err(_) => Err(PrintError::SurfaceUnavailable(format!(
                "render surface {} not ready after {:?}",
                surface.id(),
                self.ready_timeout
            ))),
        }
    }

    /// Forward a delivery to a surface obtained from [`await_ready`](Self::await_ready).
    /// Does not wait for the result; failures other than validation are
    /// reported as [`PrintError::SurfaceUnavailable`].
    pub fn deliver(&self, surface: &dyn RenderSurface, message: DeliveryMessage) -> Result<()> {
        debug!(
            "Delivering job {} to surface {} (attempt {}/{})",
            message.job_id,
            surface.id(),
            message.attempt,
            message.max_retries
        );
        surface.deliver(message).map_err(|e| match e {
            PrintError::SurfaceUnavailable(_) | PrintError::Validation(_) => e,
            other => PrintError::SurfaceUnavailable(other.to_string()),
        })
    }

    /// Drop the current surface so the next delivery creates a fresh one.
    pub async fn reset(&self) {
        if let Some(surface) = self.current.lock().await.take() {
            info!("Releasing render surface {}", surface.id());
        }
    }

    pub async fn has_surface(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|s| !s.is_destroyed())
            .unwrap_or(false)
    }
}
