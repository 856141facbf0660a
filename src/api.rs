use crate::completion::CompletionSignal;
use crate::errors::PrintError;
use crate::job::SubmissionMessage;
use crate::queue::PrintQueue;
use crate::status::{QueueEvent, QueueStatus};
use crate::telemetry::TelemetryCollector;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// HTTP API server state
#[derive(Clone)]
pub struct ApiState {
    pub queue: PrintQueue,
    pub telemetry: Arc<TelemetryCollector>,
    /// Service start time for uptime calculation
    pub start_time: std::time::Instant,
}

/// Submission accepted response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
    pub accepted: bool,
    pub queue_length: usize,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub delivered: bool,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub cleared: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue_length: usize,
    pub is_processing: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for PrintError {
    fn into_response(self) -> Response {
        let details = self.to_string();
        let (status, message) = match self {
            PrintError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            PrintError::SurfaceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            PrintError::Config(msg) => (StatusCode::BAD_REQUEST, msg),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            details: Some(details),
        });

        (status, body).into_response()
    }
}

/// POST /api/print - Submit a print/export job
async fn handle_print(
    State(state): State<ApiState>,
    Json(message): Json<SubmissionMessage>,
) -> Result<(StatusCode, Json<SubmitResponse>), PrintError> {
    debug!("Print request received for job {:?}", message.job_id);

    let handle = state.queue.submit(message).await?;
    let job_id = handle.job_id().to_string();
    let queue_length = state.queue.len().await;

    // The submitter is remote; the outcome is reported through events
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            debug!("Job submitted via HTTP API finished with error: {}", e);
        }
    });

    info!("Print job {} queued via HTTP API", job_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            accepted: true,
            queue_length,
        }),
    ))
}

/// POST /api/print/complete - Completion signal from an external renderer
async fn handle_complete(
    State(state): State<ApiState>,
    Json(signal): Json<CompletionSignal>,
) -> Result<Json<CompletionResponse>, PrintError> {
    if signal.job_id.trim().is_empty() {
        return Err(PrintError::Validation("jobId must not be empty".to_string()));
    }
    let job_id = signal.job_id.clone();
    let delivered = state.queue.completion_bus().publish(signal);
    if !delivered {
        warn!("Completion signal for job {} matched no waiting job", job_id);
    }
    Ok(Json(CompletionResponse { delivered }))
}

/// GET /api/queue/status
async fn handle_queue_status(State(state): State<ApiState>) -> Json<QueueStatus> {
    Json(state.queue.status().await)
}

/// POST /api/queue/cleanup - Fail all outstanding jobs
async fn handle_cleanup(State(state): State<ApiState>) -> Json<CleanupResponse> {
    info!("Queue cleanup requested via HTTP API");
    let cleared = state.queue.cleanup().await;
    Json(CleanupResponse { cleared })
}

/// GET /api/queue/events - Server-sent queue events
async fn handle_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.queue.subscribe();

    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((Ok(to_sse(&event)), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSE client lagged, {} queue event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_sse(event: &QueueEvent) -> Event {
    let name = match event {
        QueueEvent::StatusChanged { .. } => "status",
        _ => "job",
    };
    match Event::default().event(name).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            error!("Failed to encode queue event: {}", e);
            Event::default().event("error").data(e.to_string())
        }
    }
}

/// GET /api/health
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let status = state.queue.status().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_length: status.queue_length,
        is_processing: status.is_processing,
    })
}

/// GET /api/metrics - Telemetry metrics (Prometheus format)
async fn handle_metrics(State(state): State<ApiState>) -> String {
    state.telemetry.export_prometheus().await
}

/// GET /api/metrics/json
async fn handle_metrics_json(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(state.telemetry.get_metrics_json().await)
}

/// Create HTTP API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/print", post(handle_print))
        .route("/api/print/complete", post(handle_complete))
        .route("/api/queue/status", get(handle_queue_status))
        .route("/api/queue/cleanup", post(handle_cleanup))
        .route("/api/queue/events", get(handle_events))
        .route("/api/health", get(handle_health))
        .route("/api/metrics", get(handle_metrics))
        .route("/api/metrics/json", get(handle_metrics_json))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::predicate(|origin, _| {
                            let o = origin.as_bytes();
                            // Local UI windows only
                            o.starts_with(b"http://localhost")
                                || o.starts_with(b"https://localhost")
                                || o.starts_with(b"http://127.0.0.1")
                        }))
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::OPTIONS,
                        ])
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

/// Start HTTP API server
pub async fn start_api_server(addr: &str, state: ApiState) -> anyhow::Result<()> {
    let router = create_router(state);

    info!("Starting HTTP API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router).await.map_err(|e| {
        error!("HTTP API server error: {}", e);
        e.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionBus;
    use crate::config::QueueConfig;
    use crate::errors::Result;
    use crate::job::DeliveryMessage;
    use crate::surface::{RenderSurface, SurfaceFactory, SurfaceManager};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tokio::sync::watch;
    use tower::ServiceExt;

    /// Surface that accepts deliveries and never reports back.
    struct SilentSurface(watch::Sender<bool>);

    impl RenderSurface for SilentSurface {
        fn id(&self) -> String {
            "silent".to_string()
        }
        fn is_destroyed(&self) -> bool {
            false
        }
        fn readiness(&self) -> watch::Receiver<bool> {
            self.0.subscribe()
        }
        fn deliver(&self, _message: DeliveryMessage) -> Result<()> {
            Ok(())
        }
    }

    struct SilentFactory;

    impl SurfaceFactory for SilentFactory {
        fn create(&self) -> Result<Arc<dyn RenderSurface>> {
            Ok(Arc::new(SilentSurface(watch::channel(true).0)))
        }
    }

    fn create_test_state() -> ApiState {
        let config = QueueConfig::default();
        let surfaces = SurfaceManager::new(Arc::new(SilentFactory), &config);
        ApiState {
            queue: PrintQueue::new(config, surfaces, CompletionBus::new()).unwrap(),
            telemetry: Arc::new(TelemetryCollector::new()),
            start_time: std::time::Instant::now(),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["queue_length"], 0);
    }

    #[tokio::test]
    async fn test_print_endpoint_accepts_valid_job() {
        let state = create_test_state();
        let app = create_router(state.clone());

        let response = app
            .oneshot(post_json(
                "/api/print",
                json!({ "jobId": "A", "document": "<p>caption</p>", "options": { "silent": true } }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["jobId"], "A");
        assert_eq!(body["accepted"], true);
        assert_eq!(state.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_print_endpoint_rejects_non_string_document() {
        let state = create_test_state();
        let app = create_router(state.clone());

        let response = app
            .oneshot(post_json("/api/print", json!({ "jobId": "C", "document": 42 })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_completion_not_delivered() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(post_json(
                "/api/print/complete",
                json!({ "jobId": "ghost", "success": true }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["delivered"], false);
    }

    #[tokio::test]
    async fn test_cleanup_endpoint_clears_queue() {
        let state = create_test_state();
        let _a = state.queue.submit(SubmissionMessage::new("A", "one")).await.unwrap();
        let _b = state.queue.submit(SubmissionMessage::new("B", "two")).await.unwrap();

        let response = create_router(state.clone())
            .oneshot(post_json("/api/queue/cleanup", json!({})))
            .await
            .unwrap();

        assert_eq!(body_json(response).await["cleared"], 2);
        let status = state.queue.status().await;
        assert_eq!(status.queue_length, 0);
        assert!(!status.is_processing);
    }
}
