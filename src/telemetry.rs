use crate::status::QueueEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HISTORY_LIMIT: usize = 1000;
const DURATION_SAMPLES: usize = 1000;

/// Telemetry metrics for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    /// Total print jobs completed
    pub total_jobs_completed: u64,
    /// Total print jobs failed (including cleared ones)
    pub total_jobs_failed: u64,
    /// Total timed-out attempts that were re-enqueued
    pub total_retries: u64,
    /// Average submit-to-completion time (milliseconds)
    pub avg_print_duration_ms: u64,
    /// Success rate (0.0 - 1.0)
    pub success_rate: f64,
    /// Current queue depth
    pub queue_depth: usize,
    /// Whether a job is being processed
    pub processing: bool,
    /// Last update timestamp
    pub last_update_ts: u64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self {
            total_jobs_completed: 0,
            total_jobs_failed: 0,
            total_retries: 0,
            avg_print_duration_ms: 0,
            success_rate: 1.0,
            queue_depth: 0,
            processing: false,
            last_update_ts: now_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Telemetry collector for aggregating queue metrics
pub struct TelemetryCollector {
    metrics: Arc<RwLock<TelemetryMetrics>>,
    /// Event history (last 1000 events)
    event_history: Arc<RwLock<Vec<(u64, QueueEvent)>>>,
    print_durations: Arc<RwLock<Vec<u64>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        info!("Initializing telemetry collector");
        Self {
            metrics: Arc::new(RwLock::new(TelemetryMetrics::default())),
            event_history: Arc::new(RwLock::new(Vec::new())),
            print_durations: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Record a queue event
    pub async fn record_event(&self, event: QueueEvent) {
        let timestamp = now_secs();
        let mut metrics = self.metrics.write().await;

        match &event {
            QueueEvent::JobSucceeded { duration_ms, .. } => {
                metrics.total_jobs_completed += 1;

                let mut durations = self.print_durations.write().await;
                durations.push(*duration_ms);
                if durations.len() > DURATION_SAMPLES {
                    durations.remove(0);
                }
                let sum: u64 = durations.iter().sum();
                metrics.avg_print_duration_ms = sum / durations.len() as u64;

                Self::update_success_rate(&mut metrics);
                debug!(
                    "Print job completed - Total: {}, Avg duration: {}ms, Success rate: {:.2}%",
                    metrics.total_jobs_completed,
                    metrics.avg_print_duration_ms,
                    metrics.success_rate * 100.0
                );
            }
            QueueEvent::JobFailed { .. } => {
                metrics.total_jobs_failed += 1;
                Self::update_success_rate(&mut metrics);
                debug!(
                    "Print job failed - Total failed: {}, Success rate: {:.2}%",
                    metrics.total_jobs_failed,
                    metrics.success_rate * 100.0
                );
            }
            QueueEvent::JobRetrying { .. } => {
                metrics.total_retries += 1;
            }
            QueueEvent::StatusChanged { status } => {
                metrics.queue_depth = status.queue_length;
                metrics.processing = status.is_processing;
            }
            QueueEvent::JobQueued { .. } | QueueEvent::JobDelivered { .. } => {}
        }

        metrics.last_update_ts = timestamp;
        drop(metrics);

        // Status snapshots are too chatty for the history
        if matches!(event, QueueEvent::StatusChanged { .. }) {
            return;
        }
        let mut history = self.event_history.write().await;
        history.push((timestamp, event));
        if history.len() > HISTORY_LIMIT {
            history.remove(0);
        }
    }

    fn update_success_rate(metrics: &mut TelemetryMetrics) {
        let total = metrics.total_jobs_completed + metrics.total_jobs_failed;
        if total > 0 {
            metrics.success_rate = metrics.total_jobs_completed as f64 / total as f64;
        }
    }

    pub async fn get_metrics(&self) -> TelemetryMetrics {
        self.metrics.read().await.clone()
    }

    /// Get event history (last N events)
    pub async fn get_event_history(&self, limit: usize) -> Vec<(u64, QueueEvent)> {
        let history = self.event_history.read().await;
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub async fn get_metrics_json(&self) -> serde_json::Value {
        let metrics = self.get_metrics().await;
        serde_json::to_value(&metrics).unwrap_or_default()
    }

    /// Export metrics for external monitoring (Prometheus format)
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics().await;

        format!(
            "# HELP print_jobs_completed_total Total number of completed print jobs\n\
             # TYPE print_jobs_completed_total counter\n\
             print_jobs_completed_total {}\n\
             \n\
             # HELP print_jobs_failed_total Total number of failed print jobs\n\
             # TYPE print_jobs_failed_total counter\n\
             print_jobs_failed_total {}\n\
             \n\
             # HELP print_job_retries_total Total number of timed-out attempts that were retried\n\
             # TYPE print_job_retries_total counter\n\
             print_job_retries_total {}\n\
             \n\
             # HELP print_avg_duration_ms Average submit-to-completion time in milliseconds\n\
             # TYPE print_avg_duration_ms gauge\n\
             print_avg_duration_ms {}\n\
             \n\
             # HELP print_success_rate Print job success rate (0.0 - 1.0)\n\
             # TYPE print_success_rate gauge\n\
             print_success_rate {:.4}\n\
             \n\
             # HELP print_queue_depth Current queue length\n\
             # TYPE print_queue_depth gauge\n\
             print_queue_depth {}\n\
             \n\
             # HELP print_queue_processing Whether a job is being processed\n\
             # TYPE print_queue_processing gauge\n\
             print_queue_processing {}\n",
            metrics.total_jobs_completed,
            metrics.total_jobs_failed,
            metrics.total_retries,
            metrics.avg_print_duration_ms,
            metrics.success_rate,
            metrics.queue_depth,
            u8::from(metrics.processing),
        )
    }

    /// Feed the collector from a queue event subscription.
    pub fn spawn_recorder(self: &Arc<Self>, mut events: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => collector.record_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Telemetry lagged, {} queue event(s) not recorded", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Log a metrics summary every `interval_secs`.
    pub fn start_reporting(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                let metrics = collector.get_metrics().await;
                info!(
                    "Telemetry Report - Jobs: {} completed, {} failed, {} retries | Success: {:.1}% | Avg duration: {}ms | Queue: {}",
                    metrics.total_jobs_completed,
                    metrics.total_jobs_failed,
                    metrics.total_retries,
                    metrics.success_rate * 100.0,
                    metrics.avg_print_duration_ms,
                    metrics.queue_depth,
                );
            }
        })
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}
