use crate::push_event::PushEvent;
use crate::secret_string::SecretString;
use crate::service::WatcherService;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    service: Arc<WatcherService>,
    auth_token: Option<SecretString>,
}

pub async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    if state.service.is_synced() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Accepts a registry push event and answers once it has been dispatched.
pub async fn receive_push_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PushEvent>, JsonRejection>,
) -> Response {
    if let Some(token) = &state.auth_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !token.matches(presented) {
            warn!("Rejecting webhook call with missing or invalid Authorization header");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid Authorization header" })),
            )
                .into_response();
        }
    }

    let Json(event) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!("Rejecting malformed push event: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };

    if !event.is_push() {
        info!("Ignoring {} event from {}", event.kind, event.operator);
        return (StatusCode::OK, Json(json!({ "status": "event ignored" }))).into_response();
    }

    match state.service.submit(event).await {
        Ok((event_id, report)) => (
            StatusCode::OK,
            Json(json!({
                "status": "event processed",
                "eventId": event_id,
                "report": report,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to dispatch push event: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn create_app(service: Arc<WatcherService>, auth_token: Option<SecretString>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/webhook", post(receive_push_event))
        .with_state(AppState {
            service,
            auth_token,
        })
}
