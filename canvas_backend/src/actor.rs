//! Per-connection actors.
//!
//! A painter only reads from its transport, a viewer only writes to it. Both
//! take the transport as a plain `Stream`/`Sink` of WebSocket frames so the
//! loops can run over anything that speaks [`Message`].

use crate::hub::{ConnId, HubHandle, Role};
use crate::shared_types::{InboundMessage, OutboundMessage};
use crate::store::{SharedStore, upsert_within};
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, info, warn};

/// Time allowed to write a frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// How long a connection may stay silent before it is considered dead.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keepalive period. Must be shorter than the peer's liveness timeout.
const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Floor for the keepalive period. `interval_at` panics on a zero period.
const MIN_PING_PERIOD: Duration = Duration::from_secs(1);

/// Largest inbound frame accepted from a painter.
pub const MAX_MESSAGE_SIZE: usize = 512;

#[derive(Clone, Debug)]
pub struct ActorConfig {
    pub upsert_timeout: Duration,
    pub painter_read_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub viewer_queue_capacity: usize,
    pub max_message_size: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        ActorConfig {
            upsert_timeout: Duration::from_secs(5),
            painter_read_timeout: PONG_WAIT,
            ping_interval: PING_PERIOD,
            write_timeout: WRITE_WAIT,
            viewer_queue_capacity: 256,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Lifecycle of a single actor. `Terminated` is absorbing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActorState {
    Connected,
    Active,
    Closing,
    Failed,
    Terminated,
}

impl ActorState {
    fn can_move_to(self, next: ActorState) -> bool {
        use ActorState::*;
        matches!(
            (self, next),
            (Connected, Active)
                | (Connected | Active, Closing | Failed)
                | (Closing | Failed, Terminated)
        )
    }
}

struct Lifecycle {
    id: ConnId,
    role: Role,
    state: ActorState,
}

impl Lifecycle {
    fn new(role: Role) -> Self {
        Lifecycle {
            id: ConnId::generate(),
            role,
            state: ActorState::Connected,
        }
    }

    fn advance(&mut self, next: ActorState) {
        if !self.state.can_move_to(next) {
            debug!(conn_id = %self.id, role = %self.role, from = ?self.state, to = ?next, "Ignoring invalid actor transition");
            return;
        }
        debug!(conn_id = %self.id, role = %self.role, from = ?self.state, to = ?next, "Actor state change");
        self.state = next;
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport write failed: {0}")]
    Transport(String),
}

/// Run a painter connection until its transport closes, goes silent for
/// longer than the read deadline, or the hub drops it.
///
/// Returns how the actor ended: `Closing` for a clean close, `Failed` otherwise.
pub async fn run_painter<S, E>(
    mut inbound: S,
    hub: HubHandle,
    store: SharedStore,
    config: ActorConfig,
) -> ActorState
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut life = Lifecycle::new(Role::Painter);
    let (closer, mut closed) = oneshot::channel();
    if hub.register_painter(life.id.clone(), closer).await.is_err() {
        warn!(conn_id = %life.id, "Hub unavailable, dropping painter");
        life.advance(ActorState::Failed);
        life.advance(ActorState::Terminated);
        return ActorState::Failed;
    }
    life.advance(ActorState::Active);
    info!(conn_id = %life.id, "Painter connected");

    let outcome = loop {
        let next = tokio::select! {
            _ = &mut closed => {
                info!(conn_id = %life.id, "Painter closed by hub");
                break ActorState::Closing;
            }
            next = timeout(config.painter_read_timeout, inbound.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(conn_id = %life.id, deadline = ?config.painter_read_timeout, "Painter read deadline passed");
                break ActorState::Failed;
            }
            Ok(None) => {
                info!(conn_id = %life.id, "Painter stream ended");
                break ActorState::Closing;
            }
            Ok(Some(Err(e))) => {
                warn!(conn_id = %life.id, error = %e, "Painter receive error");
                break ActorState::Failed;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                apply_paint(&life.id, text.as_str(), &hub, &store, &config).await;
            }
            Ok(Some(Ok(Message::Binary(data)))) => {
                debug!(conn_id = %life.id, bytes = data.len(), "Ignoring binary frame from painter");
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                info!(conn_id = %life.id, reason = ?frame, "Painter initiated close");
                break ActorState::Closing;
            }
            // Ping and pong frames only prove liveness.
            Ok(Some(Ok(_))) => {}
        }
    };

    life.advance(outcome);
    hub.unregister_painter(life.id.clone()).await;
    life.advance(ActorState::Terminated);
    outcome
}

/// Decode one paint event, persist it, then hand it to the hub for fan-out.
/// Every failure here drops the event and leaves the painter running.
async fn apply_paint(
    id: &ConnId,
    text: &str,
    hub: &HubHandle,
    store: &SharedStore,
    config: &ActorConfig,
) {
    let pixel = match InboundMessage::decode(text, config.max_message_size) {
        Ok(InboundMessage::Update { pixel }) => pixel,
        Err(e) => {
            warn!(conn_id = %id, error = %e, "Dropping malformed paint message");
            return;
        }
    };

    if let Err(e) = upsert_within(store.as_ref(), &pixel, config.upsert_timeout).await {
        warn!(conn_id = %id, x = pixel.x, y = pixel.y, error = %e, "Error upserting pixel");
        return;
    }
    debug!(conn_id = %id, x = pixel.x, y = pixel.y, color = %pixel.color, "Pixel accepted");

    if hub.broadcast(OutboundMessage::Update { pixel }).await.is_err() {
        warn!(conn_id = %id, "Hub unavailable, accepted pixel not broadcast");
    }
}

/// Run a viewer connection: drain the hub-fed queue into the transport and
/// ping on an idle timer. Ends when a write fails or the hub closes the queue.
///
/// Returns how the actor ended: `Closing` for a clean close, `Failed` otherwise.
pub async fn run_viewer<K>(mut outbound: K, hub: HubHandle, config: ActorConfig) -> ActorState
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut life = Lifecycle::new(Role::Viewer);
    let (queue, mut rx) = mpsc::channel(config.viewer_queue_capacity.max(1));
    if hub.register_viewer(life.id.clone(), queue).await.is_err() {
        warn!(conn_id = %life.id, "Hub unavailable, dropping viewer");
        life.advance(ActorState::Failed);
        life.advance(ActorState::Terminated);
        return ActorState::Failed;
    }
    life.advance(ActorState::Active);
    info!(conn_id = %life.id, "Viewer connected");

    let ping_every = config.ping_interval.max(MIN_PING_PERIOD);
    let mut keepalive = interval_at(Instant::now() + ping_every, ping_every);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let batch_limit = config.viewer_queue_capacity;
                    if let Err(e) = write_batch(&mut outbound, frame, &mut rx, batch_limit, config.write_timeout).await {
                        warn!(conn_id = %life.id, error = %e, "Viewer write failed");
                        break ActorState::Failed;
                    }
                }
                None => {
                    info!(conn_id = %life.id, "Viewer queue closed by hub");
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: Utf8Bytes::from_static("stream closed by server"),
                    }));
                    if let Err(e) = write_one(&mut outbound, close, config.write_timeout).await {
                        debug!(conn_id = %life.id, error = %e, "Could not send close frame");
                    }
                    break ActorState::Closing;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = write_one(&mut outbound, Message::Ping(Default::default()), config.write_timeout).await {
                    warn!(conn_id = %life.id, error = %e, "Viewer keepalive failed");
                    break ActorState::Failed;
                }
            }
        }
    };

    life.advance(outcome);
    hub.unregister_viewer(life.id.clone()).await;
    life.advance(ActorState::Terminated);
    outcome
}

async fn write_one<K>(sink: &mut K, message: Message, limit: Duration) -> Result<(), WriteError>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    timeout(limit, sink.send(message))
        .await
        .map_err(|_| WriteError::Timeout(limit))?
        .map_err(|e| WriteError::Transport(e.to_string()))
}

/// Write `first` plus whatever else is already queued, flushing once.
async fn write_batch<K>(
    sink: &mut K,
    first: Utf8Bytes,
    rx: &mut mpsc::Receiver<Utf8Bytes>,
    max_batch: usize,
    limit: Duration,
) -> Result<(), WriteError>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let write = async {
        sink.feed(Message::Text(first)).await?;
        for _ in 1..max_batch {
            match rx.try_recv() {
                Ok(frame) => sink.feed(Message::Text(frame)).await?,
                Err(_) => break,
            }
        }
        sink.flush().await?;
        Ok::<_, K::Error>(())
    };
    timeout(limit, write)
        .await
        .map_err(|_| WriteError::Timeout(limit))?
        .map_err(|e| WriteError::Transport(e.to_string()))
}
