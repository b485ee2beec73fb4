//! The connection hub.
//!
//! A single task owns the painter and viewer sets. Every membership change and
//! every broadcast goes through its command channel, so the sets are never
//! shared and need no lock. Actors refer to themselves by [`ConnId`]; the hub
//! keeps the only handle to each viewer queue and painter close signal.

use crate::shared_types::OutboundMessage;
use crate::store::{SharedStore, get_all_within};
use axum::extract::ws::Utf8Bytes;
use nanoid::nanoid;
use serde::Serialize;
use std::{collections::HashMap, fmt, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Generated id for one connection. Never reused.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConnId(String);

impl ConnId {
    pub fn generate() -> Self {
        ConnId(nanoid!(10))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Painter,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Painter => f.write_str("painter"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Sending half of a viewer's outbound queue. Dropping it closes the queue.
pub type ViewerQueue = mpsc::Sender<Utf8Bytes>;

/// Dropped by the hub to tell a painter to stop reading.
pub type PainterCloser = oneshot::Sender<()>;

#[derive(Debug, thiserror::Error)]
#[error("hub is no longer running")]
pub struct HubClosed;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HubStats {
    pub painters: usize,
    pub viewers: usize,
    pub broadcasts: u64,
    pub evictions: u64,
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Bound on the store fetch behind a viewer's `initial` message.
    pub snapshot_timeout: Duration,
    /// Capacity of the command channel feeding the coordination task.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            snapshot_timeout: Duration::from_secs(10),
            command_capacity: 1024,
        }
    }
}

enum HubCommand {
    RegisterPainter { id: ConnId, closer: PainterCloser },
    RegisterViewer { id: ConnId, queue: ViewerQueue },
    UnregisterPainter(ConnId),
    UnregisterViewer(ConnId),
    Broadcast(OutboundMessage),
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// Cheap handle for submitting requests to the hub.
///
/// Every call returns once the request is queued, not once it is processed.
/// Requests from one handle are processed in submission order.
#[derive(Clone, Debug)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubCommand::RegisterPainter { id, .. } => write!(f, "RegisterPainter({id})"),
            HubCommand::RegisterViewer { id, .. } => write!(f, "RegisterViewer({id})"),
            HubCommand::UnregisterPainter(id) => write!(f, "UnregisterPainter({id})"),
            HubCommand::UnregisterViewer(id) => write!(f, "UnregisterViewer({id})"),
            HubCommand::Broadcast(_) => f.write_str("Broadcast"),
            HubCommand::Stats(_) => f.write_str("Stats"),
            HubCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl HubHandle {
    async fn submit(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }

    pub async fn register_painter(&self, id: ConnId, closer: PainterCloser) -> Result<(), HubClosed> {
        self.submit(HubCommand::RegisterPainter { id, closer }).await
    }

    /// Register a viewer. The hub sends the `initial` snapshot into `queue`
    /// before the viewer becomes eligible for broadcasts.
    pub async fn register_viewer(&self, id: ConnId, queue: ViewerQueue) -> Result<(), HubClosed> {
        self.submit(HubCommand::RegisterViewer { id, queue }).await
    }

    pub async fn unregister_painter(&self, id: ConnId) {
        if self.submit(HubCommand::UnregisterPainter(id)).await.is_err() {
            debug!("Hub already stopped, painter unregister skipped");
        }
    }

    pub async fn unregister_viewer(&self, id: ConnId) {
        if self.submit(HubCommand::UnregisterViewer(id)).await.is_err() {
            debug!("Hub already stopped, viewer unregister skipped");
        }
    }

    pub async fn broadcast(&self, message: OutboundMessage) -> Result<(), HubClosed> {
        self.submit(HubCommand::Broadcast(message)).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubClosed> {
        let (reply, response) = oneshot::channel();
        self.submit(HubCommand::Stats(reply)).await?;
        response.await.map_err(|_| HubClosed)
    }

    /// Close every actor's queue and stop the coordination task.
    pub async fn shutdown(&self) {
        if self.submit(HubCommand::Shutdown).await.is_err() {
            debug!("Hub already stopped");
        }
    }
}

pub struct Hub {
    store: SharedStore,
    config: HubConfig,
    commands: mpsc::Receiver<HubCommand>,
    painters: HashMap<ConnId, PainterCloser>,
    viewers: HashMap<ConnId, ViewerQueue>,
    broadcasts: u64,
    evictions: u64,
}

impl Hub {
    /// Start the coordination task.
    pub fn spawn(store: SharedStore, config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity);
        let hub = Hub {
            store,
            config,
            commands: rx,
            painters: HashMap::new(),
            viewers: HashMap::new(),
            broadcasts: 0,
            evictions: 0,
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        info!(store = self.store.name(), "Hub started");
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::RegisterPainter { id, closer } => {
                    self.painters.insert(id.clone(), closer);
                    info!(conn_id = %id, painters = self.painters.len(), "Painter registered");
                }
                HubCommand::RegisterViewer { id, queue } => self.register_viewer(id, queue).await,
                HubCommand::UnregisterPainter(id) => {
                    if self.painters.remove(&id).is_some() {
                        info!(conn_id = %id, painters = self.painters.len(), "Painter unregistered");
                    }
                }
                HubCommand::UnregisterViewer(id) => {
                    if self.viewers.remove(&id).is_some() {
                        info!(conn_id = %id, viewers = self.viewers.len(), "Viewer unregistered");
                    }
                }
                HubCommand::Broadcast(message) => self.broadcast(&message),
                HubCommand::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                HubCommand::Shutdown => break,
            }
        }

        let (painters, viewers) = (self.painters.len(), self.viewers.len());
        self.painters.clear();
        self.viewers.clear();
        info!(painters, viewers, "Hub stopped");
    }

    /// Load the snapshot and queue it before the viewer joins the broadcast
    /// set, so it precedes every update processed after registration.
    async fn register_viewer(&mut self, id: ConnId, queue: ViewerQueue) {
        let pixels = match get_all_within(self.store.as_ref(), self.config.snapshot_timeout).await {
            Ok(pixels) => pixels,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Could not load canvas snapshot, closing viewer");
                return;
            }
        };
        let count = pixels.len();

        let frame = match (OutboundMessage::Initial { pixels }).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(conn_id = %id, error = %e, "Could not encode canvas snapshot");
                return;
            }
        };
        if let Err(e) = queue.try_send(frame) {
            debug!(conn_id = %id, error = %e, "Viewer went away before its snapshot was queued");
            return;
        }

        self.viewers.insert(id.clone(), queue);
        info!(conn_id = %id, pixels = count, viewers = self.viewers.len(), "Viewer registered");
    }

    /// Push one frame to every viewer without waiting. A viewer whose queue is
    /// full or closed is dropped on the spot.
    fn broadcast(&mut self, message: &OutboundMessage) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Could not encode broadcast");
                return;
            }
        };
        self.broadcasts += 1;

        let mut evicted = 0;
        self.viewers.retain(|id, queue| match queue.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %id, "Viewer queue full, evicting");
                evicted += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = %id, "Viewer queue closed, dropping");
                evicted += 1;
                false
            }
        });
        self.evictions += evicted;
    }

    fn stats(&self) -> HubStats {
        HubStats {
            painters: self.painters.len(),
            viewers: self.viewers.len(),
            broadcasts: self.broadcasts,
            evictions: self.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_types::{Color, Pixel};
    use crate::store::MemoryPixelStore;
    use std::sync::Arc;

    fn pixel(x: i32, y: i32, color: &str) -> Pixel {
        Pixel::new(x, y, Color::parse(color).unwrap())
    }

    fn update(x: i32, y: i32, color: &str) -> OutboundMessage {
        OutboundMessage::Update {
            pixel: pixel(x, y, color),
        }
    }

    fn decode(frame: Utf8Bytes) -> OutboundMessage {
        serde_json::from_str(frame.as_str()).unwrap()
    }

    fn spawn_hub(store: Arc<MemoryPixelStore>) -> HubHandle {
        Hub::spawn(store, HubConfig::default()).0
    }

    async fn join_viewer(hub: &HubHandle, capacity: usize) -> (ConnId, mpsc::Receiver<Utf8Bytes>) {
        let id = ConnId::generate();
        let (tx, rx) = mpsc::channel(capacity);
        hub.register_viewer(id.clone(), tx).await.unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn viewer_gets_snapshot_before_updates() {
        let store = Arc::new(MemoryPixelStore::with_pixels([
            pixel(1, 1, "#FFFFFF"),
            pixel(0, 0, "#000000"),
        ]));
        let hub = spawn_hub(store);

        let (_id, mut rx) = join_viewer(&hub, 16).await;
        hub.broadcast(update(2, 2, "#123456")).await.unwrap();

        assert_eq!(
            decode(rx.recv().await.unwrap()),
            OutboundMessage::Initial {
                pixels: vec![pixel(0, 0, "#000000"), pixel(1, 1, "#FFFFFF")]
            }
        );
        assert_eq!(decode(rx.recv().await.unwrap()), update(2, 2, "#123456"));
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_order_at_every_viewer() {
        let hub = spawn_hub(Arc::new(MemoryPixelStore::new()));
        let (_a, mut rx_a) = join_viewer(&hub, 16).await;
        let (_b, mut rx_b) = join_viewer(&hub, 16).await;

        let updates = [
            update(0, 0, "#111111"),
            update(0, 0, "#222222"),
            update(3, 4, "#333333"),
        ];
        for u in &updates {
            hub.broadcast(u.clone()).await.unwrap();
        }

        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(decode(rx.recv().await.unwrap()), OutboundMessage::Initial { .. }));
            for expected in &updates {
                assert_eq!(&decode(rx.recv().await.unwrap()), expected);
            }
        }
        assert_eq!(hub.stats().await.unwrap().broadcasts, 3);
    }

    #[tokio::test]
    async fn full_viewer_is_evicted_without_affecting_others() {
        let hub = spawn_hub(Arc::new(MemoryPixelStore::new()));
        // Room for the snapshot plus one update.
        let (_slow, mut slow_rx) = join_viewer(&hub, 2).await;
        let (_fast, mut fast_rx) = join_viewer(&hub, 16).await;

        hub.broadcast(update(0, 0, "#000001")).await.unwrap();
        hub.broadcast(update(0, 0, "#000002")).await.unwrap();
        hub.broadcast(update(0, 0, "#000003")).await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.viewers, 1);
        assert_eq!(stats.evictions, 1);

        assert!(matches!(decode(slow_rx.recv().await.unwrap()), OutboundMessage::Initial { .. }));
        assert_eq!(decode(slow_rx.recv().await.unwrap()), update(0, 0, "#000001"));
        assert!(slow_rx.recv().await.is_none());

        assert!(matches!(decode(fast_rx.recv().await.unwrap()), OutboundMessage::Initial { .. }));
        for color in ["#000001", "#000002", "#000003"] {
            assert_eq!(decode(fast_rx.recv().await.unwrap()), update(0, 0, color));
        }
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = spawn_hub(Arc::new(MemoryPixelStore::new()));
        let (id, mut rx) = join_viewer(&hub, 4).await;

        hub.unregister_viewer(id.clone()).await;
        hub.unregister_viewer(id.clone()).await;
        hub.unregister_painter(id).await;

        assert_eq!(hub.stats().await.unwrap().viewers, 0);
        assert!(matches!(decode(rx.recv().await.unwrap()), OutboundMessage::Initial { .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregistering_a_painter_signals_it() {
        let hub = spawn_hub(Arc::new(MemoryPixelStore::new()));
        let id = ConnId::generate();
        let (closer, closed) = oneshot::channel();

        hub.register_painter(id.clone(), closer).await.unwrap();
        assert_eq!(hub.stats().await.unwrap().painters, 1);

        hub.unregister_painter(id).await;
        assert!(closed.await.is_err());
        assert_eq!(hub.stats().await.unwrap().painters, 0);
    }

    #[tokio::test]
    async fn viewer_is_closed_when_snapshot_fails() {
        let store = Arc::new(MemoryPixelStore::new());
        store.set_failing(true);
        let hub = spawn_hub(store);

        let (_id, mut rx) = join_viewer(&hub, 4).await;
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.stats().await.unwrap().viewers, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_every_queue() {
        let (hub, task) = Hub::spawn(Arc::new(MemoryPixelStore::new()), HubConfig::default());
        let (_v, mut rx) = join_viewer(&hub, 4).await;
        let (closer, closed) = oneshot::channel();
        hub.register_painter(ConnId::generate(), closer).await.unwrap();

        hub.shutdown().await;
        task.await.unwrap();

        assert!(closed.await.is_err());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(hub.stats().await.is_err());
    }
}
