use super::queue::{EnqueueError, LiveEventQueue};
use crate::event::LiveEvent;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use tracing::{debug, info};

/// Shared ingress state
#[derive(Clone)]
pub struct IngressState {
    pub queue: LiveEventQueue,
}

/// Accepted response
#[derive(Serialize)]
struct QueuedResponse {
    #[serde(rename = "eventId")]
    event_id: String,
    status: &'static str,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the webhook ingress router.
///
/// `POST /integration/webhook/:route` validates the body, queues the event
/// and answers immediately. Bodies above `body_limit` get 413.
pub fn create_router(state: IngressState, body_limit: usize) -> Router {
    Router::new()
        .route("/integration/webhook/:route", post(receive_webhook))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// POST /integration/webhook/:route - Queue a live event
async fn receive_webhook(
    State(state): State<IngressState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<QueuedResponse>, IngressError> {
    let headers = headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    });
    let event = LiveEvent::from_request(&route, headers, body.to_vec())
        .map_err(|e| IngressError::Invalid(e.to_string()))?;
    let event_id = event.id.to_string();

    state.queue.enqueue(event).map_err(IngressError::Queue)?;
    debug!(event_id = %event_id, route = %route, depth = state.queue.depth(), "Queued live event");

    Ok(Json(QueuedResponse {
        event_id,
        status: "queued",
    }))
}

/// Ingress errors
#[derive(Debug)]
enum IngressError {
    Invalid(String),
    Queue(EnqueueError),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            IngressError::Invalid(msg) => {
                info!(error = %msg, "Rejected webhook");
                (StatusCode::BAD_REQUEST, msg)
            }
            IngressError::Queue(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        };
        let body = Json(ErrorResponse {
            error: error_message,
        });
        (status, body).into_response()
    }
}
