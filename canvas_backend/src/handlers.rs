use crate::{
    AppState,
    hub::{HubClosed, HubStats},
    shared_types::Pixel,
    store::{StoreError, get_all_within},
};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hub(#[from] HubClosed),
}

// Converts our AppError into a user-friendly HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Store(StoreError::Timeout(limit)) => {
                tracing::error!("Store timed out after {:?}", limit);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Canvas store timed out".to_string(),
                )
            }
            AppError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Hub(e) => {
                tracing::error!("Hub error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Server is shutting down".to_string(),
                )
            }
        };
        (status, error_message).into_response()
    }
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    status: &'static str,
    store: &'static str,
    started_at: DateTime<Utc>,
}

/// Handler returning the whole canvas as a JSON array of pixels.
pub async fn get_pixels(State(state): State<AppState>) -> Result<Json<Vec<Pixel>>, AppError> {
    let pixels = get_all_within(state.store.as_ref(), state.snapshot_timeout).await?;
    debug!("Served canvas snapshot with {} pixels", pixels.len());
    Ok(Json(pixels))
}

/// Handler returning current hub membership counts.
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<HubStats>, AppError> {
    Ok(Json(state.hub.stats().await?))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.store.name(),
        started_at: state.started_at,
    })
}
