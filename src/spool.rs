use crate::completion::{CompletionBus, CompletionSignal};
use crate::errors::{PrintError, Result};
use crate::job::{DeliveryMessage, RenderMode};
use crate::surface::{RenderSurface, SurfaceFactory};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Render surface backed by a spool directory.
///
/// Print deliveries become job tickets (`<jobId>.job`, JSON) picked up by
/// the system print spooler; exports write the rendered document to the
/// requested `outputPath` or `<dir>/exports/<jobId>.html`. Each delivery
/// publishes its completion signal once the write has finished.
pub struct SpoolSurface {
    id: String,
    dir: PathBuf,
    bus: CompletionBus,
    ready: Arc<watch::Sender<bool>>,
    destroyed: Arc<AtomicBool>,
}

impl SpoolSurface {
    /// Start loading a surface over `dir`. It reports ready once the
    /// directory exists.
    pub fn open(dir: PathBuf, bus: CompletionBus) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            PrintError::SurfaceUnavailable(format!("spool surface needs a runtime: {}", e))
        })?;

        let id = format!("spool-{}", uuid::Uuid::new_v4().simple());
        let (tx, _) = watch::channel(false);
        let ready = Arc::new(tx);
        let destroyed = Arc::new(AtomicBool::new(false));

        let loading = ready.clone();
        let closed = destroyed.clone();
        let load_dir = dir.clone();
        let load_id = id.clone();
        runtime.spawn(async move {
            match tokio::fs::create_dir_all(&load_dir).await {
                Ok(()) if closed.load(Ordering::SeqCst) => {
                    debug!("Spool surface {} closed before it finished loading", load_id);
                }
                Ok(()) => {
                    loading.send_replace(true);
                    debug!("Spool surface {} loaded at {:?}", load_id, load_dir);
                }
                Err(e) => error!("Spool surface {} failed to load {:?}: {}", load_id, load_dir, e),
            }
        });

        Ok(Self {
            id,
            dir,
            bus,
            ready,
            destroyed,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tear the surface down. Later deliveries are refused.
    pub fn close(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.ready.send_replace(false);
            info!("Spool surface {} closed", self.id);
        }
    }

    fn target_path(dir: &Path, message: &DeliveryMessage) -> PathBuf {
        let name = file_stem(&message.job_id);
        match message.options.mode {
            RenderMode::Print => dir.join(format!("{}.job", name)),
            RenderMode::Pdf => message
                .options
                .output_path
                .clone()
                .unwrap_or_else(|| dir.join("exports").join(format!("{}.html", name))),
        }
    }

    async fn write(dir: PathBuf, message: &DeliveryMessage) -> Result<PathBuf> {
        let target = Self::target_path(&dir, message);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = match message.options.mode {
            RenderMode::Print => serde_json::to_vec_pretty(message)?,
            RenderMode::Pdf => message.document.clone().into_bytes(),
        };
        tokio::fs::write(&target, contents).await?;
        Ok(target)
    }
}

impl RenderSurface for SpoolSurface {
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
        if self.is_destroyed() {
            return Err(PrintError::SurfaceUnavailable(format!(
                "spool surface {} is closed",
                self.id
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            PrintError::SurfaceUnavailable(format!("spool surface needs a runtime: {}", e))
        })?;
        let dir = self.dir.clone();
        let bus = self.bus.clone();
        runtime.spawn(async move {
            let signal = match Self::write(dir, &message).await {
                Ok(path) => {
                    info!("Job {} spooled to {:?}", message.job_id, path);
                    match message.options.mode {
                        RenderMode::Pdf => CompletionSignal::success(&message.job_id).with_file_path(path),
                        RenderMode::Print => CompletionSignal::success(&message.job_id),
                    }
                }
                Err(e) => {
                    error!("Spooling job {} failed: {}", message.job_id, e);
                    CompletionSignal::failure(&message.job_id, e.to_string())
                }
            };
            bus.publish(signal);
        });
        Ok(())
    }
}

fn file_stem(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Creates [`SpoolSurface`]s over a fixed directory.
pub struct SpoolSurfaceFactory {
    dir: PathBuf,
    bus: CompletionBus,
}

impl SpoolSurfaceFactory {
    pub fn new(dir: PathBuf, bus: CompletionBus) -> Self {
        Self { dir, bus }
    }
}

impl SurfaceFactory for SpoolSurfaceFactory {
    fn create(&self) -> Result<Arc<dyn RenderSurface>> {
        Ok(Arc::new(SpoolSurface::open(self.dir.clone(), self.bus.clone())?))
    }
}
