//! Shared pixel canvas server.
//!
//! Painters push pixel updates over `/ws/paint`; every accepted pixel is
//! persisted through a [`store::PixelStore`] and fanned out by the [`hub`] to
//! the viewers connected on `/ws/view`.

use axum::{Router, routing::get};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

pub mod actor;
pub mod config;
pub mod handlers;
pub mod hub;
pub mod shared_types;
pub mod store;
mod websocket;

#[derive(Clone)]
pub struct AppState {
    pub hub: hub::HubHandle,
    pub store: store::SharedStore,
    pub actor_config: actor::ActorConfig,
    pub snapshot_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        hub: hub::HubHandle,
        store: store::SharedStore,
        actor_config: actor::ActorConfig,
        snapshot_timeout: Duration,
    ) -> Self {
        AppState {
            hub,
            store,
            actor_config,
            snapshot_timeout,
            started_at: Utc::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/paint", get(websocket::paint_handler))
        .route("/ws/view", get(websocket::view_handler))
        .route("/api/pixels", get(handlers::get_pixels))
        .route("/api/stats", get(handlers::get_stats))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors)
}
