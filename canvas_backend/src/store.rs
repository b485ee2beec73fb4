//! Pixel store adapters.
//!
//! The hub and the painter actors only see [`PixelStore`]. The whole canvas
//! lives in a single Redis hash keyed by `"x:y"`, which gives atomic
//! per-pixel upserts with last-write-wins semantics.

use crate::shared_types::{Color, Pixel, PixelKey};
use async_trait::async_trait;
use deadpool_redis::{Config, Runtime};
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("could not create redis pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable")]
    Unavailable,
}

/// Durable canvas state. Implementations must tolerate concurrent callers.
#[async_trait]
pub trait PixelStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Every stored pixel, at most one per key.
    async fn get_all(&self) -> Result<Vec<Pixel>, StoreError>;

    /// Insert or overwrite the color at the pixel's key.
    async fn upsert(&self, pixel: &Pixel) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn PixelStore>;

pub async fn get_all_within(
    store: &dyn PixelStore,
    limit: Duration,
) -> Result<Vec<Pixel>, StoreError> {
    tokio::time::timeout(limit, store.get_all())
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

pub async fn upsert_within(
    store: &dyn PixelStore,
    pixel: &Pixel,
    limit: Duration,
) -> Result<(), StoreError> {
    tokio::time::timeout(limit, store.upsert(pixel))
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

pub struct RedisPixelStore {
    pool: deadpool_redis::Pool,
    canvas_key: String,
}

impl RedisPixelStore {
    /// Build the pool and make sure Redis answers before serving traffic.
    pub async fn connect(redis_url: &str, canvas_key: &str) -> Result<Self, StoreError> {
        let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<()>(&mut *conn).await?;
        info!(canvas_key, "Connected to Redis and created connection pool.");

        Ok(RedisPixelStore {
            pool,
            canvas_key: canvas_key.to_string(),
        })
    }
}

#[async_trait]
impl PixelStore for RedisPixelStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_all(&self) -> Result<Vec<Pixel>, StoreError> {
        let mut conn = self.pool.get().await?;
        let entries: HashMap<String, String> = conn.hgetall(&self.canvas_key).await?;
        Ok(decode_canvas(entries))
    }

    async fn upsert(&self, pixel: &Pixel) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .hset(&self.canvas_key, pixel.key().to_field(), pixel.color.as_str())
            .await?;
        Ok(())
    }
}

/// Turn the raw canvas hash into pixels ordered by row, then column.
/// Entries that no longer parse are skipped.
fn decode_canvas(entries: HashMap<String, String>) -> Vec<Pixel> {
    let mut pixels: Vec<Pixel> = entries
        .into_iter()
        .filter_map(|(field, color)| {
            let key = PixelKey::parse_field(&field);
            let color = Color::parse(&color).ok();
            match (key, color) {
                (Some(key), Some(color)) => Some(Pixel::new(key.x, key.y, color)),
                _ => {
                    warn!(field, "Skipping corrupt canvas entry");
                    None
                }
            }
        })
        .collect();
    pixels.sort_by_key(|p| (p.y, p.x));
    pixels
}

/// In-process store for tests and local runs without Redis.
#[derive(Default)]
pub struct MemoryPixelStore {
    pixels: RwLock<HashMap<PixelKey, Color>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryPixelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pixels(pixels: impl IntoIterator<Item = Pixel>) -> Self {
        let map = pixels.into_iter().map(|p| (p.key(), p.color)).collect();
        MemoryPixelStore {
            pixels: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Make every following call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every following call, for exercising timeouts.
    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn simulate(&self) -> Result<(), StoreError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl PixelStore for MemoryPixelStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_all(&self) -> Result<Vec<Pixel>, StoreError> {
        self.simulate().await?;
        let map = self.pixels.read().await;
        let mut pixels: Vec<Pixel> = map
            .iter()
            .map(|(key, color)| Pixel::new(key.x, key.y, color.clone()))
            .collect();
        pixels.sort_by_key(|p| (p.y, p.x));
        Ok(pixels)
    }

    async fn upsert(&self, pixel: &Pixel) -> Result<(), StoreError> {
        self.simulate().await?;
        self.pixels
            .write()
            .await
            .insert(pixel.key(), pixel.color.clone());
        Ok(())
    }
}
