//! Print job queue and delivery pipeline for the LiveText desktop app.
//!
//! Documents are submitted to a [`PrintQueue`], delivered one at a time to a
//! render surface and settled when the surface reports back on the
//! [`CompletionBus`].

pub mod api;
pub mod completion;
pub mod config;
pub mod errors;
pub mod job;
pub mod notify;
pub mod queue;
pub mod sentry_init;
pub mod spool;
pub mod status;
pub mod surface;
pub mod telemetry;

pub use completion::{CompletionBus, CompletionSignal};
pub use config::{AppConfig, QueueConfig};
pub use errors::{PrintError, Result};
pub use job::{DeliveryMessage, JobHandle, PrintOutcome, RenderMode, RenderOptions, SubmissionMessage};
pub use queue::PrintQueue;
pub use status::{JobState, QueueEvent, QueueStatus};
pub use surface::{RenderSurface, SurfaceFactory, SurfaceManager};
