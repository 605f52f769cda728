use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::registry::{RegistryEntry, RegistryStats};
use crate::store::AccessRequestSnapshot;
use crate::{AppState, ws};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/ws", get(ws::ws_handler))
        .route("/v1/access-requests/{access_request_id}", get(get_access_request))
        .route("/v1/connections", get(list_connections))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ConnectionsResponse {
    stats: RegistryStats,
    entries: Vec<RegistryEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn get_access_request(
    Path(access_request_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<AccessRequestSnapshot>, ApiError> {
    let snapshot = state
        .store
        .access_request_snapshot(&access_request_id)
        .map_err(|error| ApiError::internal(format!("{error:#}")))?
        .ok_or_else(|| {
            ApiError::not_found(format!("access request '{access_request_id}' not found"))
        })?;

    Ok(Json(snapshot))
}

async fn list_connections(State(state): State<AppState>) -> Json<ConnectionsResponse> {
    Json(ConnectionsResponse {
        stats: state.registry.stats().await,
        entries: state.registry.entries().await,
    })
}
