//! Management HTTP API.
//!
//! - `POST /api/resync` - start a resync pass (202, or 409 while one runs)
//! - `GET /api/status` - last resync status and live event queue depth
//! - `GET /health` - liveness

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use catalog_sync::resync::{AlreadyRunning, ResyncCoordinator};
use catalog_sync::status::ResyncStatus;
use catalog_sync::webhook::LiveEventQueue;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state for the management handlers.
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<ResyncCoordinator>,
    pub queue: LiveEventQueue,
    /// Parent token for manually triggered passes
    pub cancel: CancellationToken,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub integration: String,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct QueueInfo {
    pub depth: usize,
    pub capacity: usize,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub integration: String,
    pub datasource: String,
    pub running: bool,
    pub resync: ResyncStatus,
    pub queue: QueueInfo,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn trigger_resync(
    State(state): State<Arc<ApiState>>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    state
        .coordinator
        // detached; shutdown waits for the resync state to go idle
        .spawn(state.cancel.child_token())
        .map_err(AppError::from)?;

    info!(integration = %state.coordinator.integration(), "Manual resync started");
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            integration: state.coordinator.integration().to_string(),
            status: "started",
        }),
    ))
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let resync = state.coordinator.state();
    Json(StatusResponse {
        integration: state.coordinator.integration().to_string(),
        datasource: state.coordinator.datasource().to_string(),
        running: resync.is_running(),
        resync: resync.last_status(),
        queue: QueueInfo {
            depth: state.queue.depth(),
            capacity: state.queue.capacity(),
        },
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

enum AppError {
    Conflict(String),
}

impl From<AlreadyRunning> for AppError {
    fn from(e: AlreadyRunning) -> Self {
        AppError::Conflict(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let AppError::Conflict(msg) = self;
        (StatusCode::CONFLICT, Json(ErrorResponse { error: msg })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/resync", post(trigger_resync))
        .route("/api/status", get(get_status))
        .route("/health", get(health))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{coordinator, GatedProducer};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use catalog_sync::catalog::InMemoryCatalog;
    use catalog_sync::expr::EvalContext;
    use catalog_sync::mapping::{EntityMapper, MappingStore};
    use catalog_sync::resync::StaticProducer;
    use catalog_sync::retry::RetryPolicy;
    use catalog_sync::status::ResyncPhase;
    use catalog_sync::webhook::{EventDispatcher, ProcessorRegistry};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state(coordinator: Arc<ResyncCoordinator>, catalog: Arc<InMemoryCatalog>) -> ApiState {
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::new(ProcessorRegistry::new()),
            catalog,
            Arc::new(MappingStore::new("gh", None)),
            EntityMapper::new("github/test", EvalContext::default()),
            RetryPolicy::none(),
        ));
        let cancel = CancellationToken::new();
        let (queue, _workers) = LiveEventQueue::start(dispatcher, 1, 8, cancel.clone());
        ApiState {
            coordinator,
            queue,
            cancel,
        }
    }

    async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let router = create_router(state(
            coordinator(&catalog, StaticProducer::new()),
            catalog.clone(),
        ));

        let (status, body) = send(router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_before_any_resync() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let router = create_router(state(
            coordinator(&catalog, StaticProducer::new()),
            catalog.clone(),
        ));

        let (status, body) = send(router, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["integration"], "gh");
        assert_eq!(body["running"], false);
        assert_eq!(body["resync"]["phase"], "idle");
        assert_eq!(body["queue"], json!({"depth": 0, "capacity": 8}));
    }

    #[tokio::test]
    async fn test_trigger_then_conflict_while_running() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let producer = GatedProducer::new(vec![json!({"name": "api"})]);
        let release = producer.release.clone();
        let coordinator = coordinator(&catalog, producer);
        let router = create_router(state(Arc::clone(&coordinator), catalog.clone()));

        let (status, body) = send(router.clone(), "POST", "/api/resync").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "started");

        let (status, body) = send(router.clone(), "POST", "/api/resync").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already running"));

        let (_, body) = send(router.clone(), "GET", "/api/status").await;
        assert_eq!(body["running"], true);

        release.add_permits(1);
        for _ in 0..200 {
            if !coordinator.state().is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.state().last_status().phase, ResyncPhase::Completed);
        assert!(catalog.entity("service", "api").is_some());

        let (status, _) = send(router, "POST", "/api/resync").await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
