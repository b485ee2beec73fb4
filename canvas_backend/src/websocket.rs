use crate::{AppState, actor};
use axum::{
    extract::{State, ws::WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::StreamExt;
use tracing::info;

/// Upgrade entry point for painters. The server only reads from these sockets.
pub async fn paint_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let config = state.actor_config.clone();
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            info!("New painter WebSocket connection");
            // The write half stays alive so the close handshake can complete.
            let (_sink, stream) = socket.split();
            actor::run_painter(stream, state.hub, state.store, config).await;
        })
}

/// Upgrade entry point for viewers. The server only writes to these sockets.
pub async fn view_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let config = state.actor_config.clone();
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            info!("New viewer WebSocket connection");
            let (sink, _stream) = socket.split();
            actor::run_viewer(sink, state.hub, config).await;
        })
}
