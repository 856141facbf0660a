use anyhow::Context;
use livetext_printer::api::{self, ApiState};
use livetext_printer::notify::{NotificationReporter, TracingNotifier};
use livetext_printer::spool::SpoolSurfaceFactory;
use livetext_printer::telemetry::TelemetryCollector;
use livetext_printer::{sentry_init, AppConfig, CompletionBus, PrintQueue, QueueEvent, SurfaceManager};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(&AppConfig::config_path()).context("Failed to load configuration")?;

    // Console plus daily rolling file; the guard flushes the file writer on exit
    let log_dir = config.log_path();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "livetext-printer.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .with(sentry_tracing::layer())
        .init();

    info!("========================================");
    info!("LiveText Print Service Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    // Crash reporting (must be kept alive)
    let _sentry_guard = sentry_init::init();

    let bus = CompletionBus::new();
    let spool_dir = config.spool_path();
    info!("Spooling print jobs to {:?}", spool_dir);
    let factory = Arc::new(SpoolSurfaceFactory::new(spool_dir, bus.clone()));
    let surfaces = SurfaceManager::new(factory, &config.queue);
    let queue = PrintQueue::new(config.queue.clone(), surfaces, bus)?;

    let telemetry = Arc::new(TelemetryCollector::new());
    telemetry.spawn_recorder(queue.subscribe());
    telemetry.start_reporting(300);

    NotificationReporter::new(Arc::new(TracingNotifier)).spawn(queue.subscribe());
    spawn_failure_reporter(&queue);

    let api_state = ApiState {
        queue: queue.clone(),
        telemetry: telemetry.clone(),
        start_time: Instant::now(),
    };
    let api_addr = config.api_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(&api_addr, api_state).await {
            error!("Failed to start HTTP API server: {}", e);
        }
    });

    info!("Background services initialized");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested, clearing print queue");
    queue.shutdown().await;
    info!("LiveText Print Service stopped");
    Ok(())
}

/// Forward permanently failed jobs to crash reporting.
fn spawn_failure_reporter(queue: &PrintQueue) {
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::JobFailed { job_id, error }) => {
                    sentry_init::capture_print_job_failure(&job_id, &error);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Failure reporter lagged, {} queue event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
