use canvas_backend::{
    AppState, build_router,
    config::{Config, StoreBackend},
    hub::Hub,
    store::{MemoryPixelStore, RedisPixelStore, SharedStore},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canvas_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // rediss:// URLs go through rustls, which needs a process-wide provider.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed.");
    }

    // --- Pixel store setup ---
    let store: SharedStore = match config.store_backend {
        StoreBackend::Redis => {
            Arc::new(RedisPixelStore::connect(&config.redis_url, &config.canvas_key).await?)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory pixel store, the canvas will not survive a restart.");
            Arc::new(MemoryPixelStore::new())
        }
    };

    // --- Hub setup ---
    let (hub, hub_task) = Hub::spawn(store.clone(), config.hub.clone());

    let app_state = AppState::new(
        hub.clone(),
        store,
        config.actor.clone(),
        config.hub.snapshot_timeout,
    );
    let app = build_router(app_state);

    // --- Server Launch ---
    let listener = TcpListener::bind(&config.server_address).await?;
    info!("Server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested, closing all connections.");
            hub.shutdown().await;
        })
        .await?;

    hub_task.await?;
    Ok(())
}
