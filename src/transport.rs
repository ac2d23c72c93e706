//! Wire transport adapter (spec.md §6.1 "Minimum transport interface").
//!
//! The host platform owns the raw socket; this crate only needs to send a
//! JSON frame to one connection, close a connection, and broadcast a frame
//! to every attached connection in a room. The default implementation
//! follows the teacher's SSE route (`src/routes/stream.rs`): one
//! `tokio::sync::broadcast::Sender` per room, fanned out to
//! `rocket::response::stream::EventStream!` per connection, with a
//! heartbeat interleaved via `tokio::select!`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rocket::response::stream::{Event, EventStream};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{EngineError, EngineResult};

/// A frame sent down one connection or broadcast to a room.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Wire event name (`"sync"`, `"full"`, `"message"`, ...).
    pub kind: &'static str,
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: &'static str, payload: Value) -> Self {
        Self { kind, payload }
    }

    fn to_event(&self) -> Event {
        Event::json(&self.payload).event(self.kind)
    }
}

/// Per-connection send/close surface, kept as narrow as the specification's
/// "minimum interface" note demands so any transport (SSE, WebSocket, unix
/// socket) can back it.
pub trait Connection: Send + Sync {
    fn send(&self, frame: Frame) -> EngineResult<()>;
    fn close(&self);
    fn is_attached(&self) -> bool;
}

/// One room's fan-out bus, mirroring the teacher's `EventBus { sender:
/// broadcast::Sender<ChatEvent> }` (`src/events.rs`).
pub struct RoomBus {
    sender: broadcast::Sender<Frame>,
}

impl RoomBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Broadcasts to every currently-attached connection. Matches the
    /// teacher's `EventBus::publish`: a lagging/absent receiver is not an
    /// error, since connections detach independently of the room's state.
    pub fn broadcast(&self, frame: Frame) {
        let _ = self.sender.send(frame);
    }
}

impl Default for RoomBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection attachment flag a [`Connection`] impl can share with its
/// stream task so `is_attached`/`close` observe the same state.
#[derive(Clone, Default)]
pub struct AttachmentFlag(Arc<Mutex<bool>>);

impl AttachmentFlag {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    pub fn mark_closed(&self) {
        *self.0.lock().unwrap() = false;
    }

    pub fn is_attached(&self) -> bool {
        *self.0.lock().unwrap()
    }
}

/// SSE-backed connection bound to one room's [`RoomBus`]. `send` only
/// matters for the initial full-state frame handed to the caller before the
/// stream is opened; steady-state traffic flows through the bus.
pub struct SseConnection {
    bus: Arc<RoomBus>,
    attached: AttachmentFlag,
    /// Per-recipient packet filter (spec.md §4.3.5 "packet interceptor"):
    /// evaluated against each outgoing frame before it reaches this
    /// connection's stream. Returns the (possibly modified) frame to
    /// deliver, or `None` to withhold it from this recipient only, without
    /// affecting what other connections on the same broadcast receive.
    filter: Option<Arc<dyn Fn(&Frame) -> Option<Frame> + Send + Sync>>,
}

impl SseConnection {
    pub fn new(bus: Arc<RoomBus>, attached: AttachmentFlag) -> Self {
        Self {
            bus,
            attached,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn Fn(&Frame) -> Option<Frame> + Send + Sync>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Builds the Rocket response stream for this connection: a replayed
    /// initial frame, then every room broadcast until the client
    /// disconnects or the room closes, interleaved with a heartbeat so
    /// idle connections aren't reaped by intermediate proxies (teacher's
    /// `stream.rs` 15s interval, generalized here to an injected period).
    pub fn into_event_stream(
        self,
        initial: Option<Frame>,
        heartbeat: Duration,
    ) -> EventStream![Event + '_] {
        let mut receiver = self.bus.subscribe();
        let filter = self.filter.clone();
        EventStream! {
            if let Some(frame) = initial {
                yield frame.to_event();
            }
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = receiver.recv() => {
                        match frame {
                            Ok(frame) => {
                                let delivered = match filter.as_ref() {
                                    Some(f) => f(&frame),
                                    None => Some(frame),
                                };
                                if let Some(frame) = delivered {
                                    yield frame.to_event();
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        yield Event::empty();
                    }
                }
                if !self.attached.is_attached() {
                    break;
                }
            }
        }
    }
}

impl Connection for SseConnection {
    fn send(&self, frame: Frame) -> EngineResult<()> {
        if !self.attached.is_attached() {
            return Err(EngineError::Transport("connection detached".into()));
        }
        self.bus.broadcast(frame);
        Ok(())
    }

    fn close(&self) {
        self.attached.mark_closed();
    }

    fn is_attached(&self) -> bool {
        self.attached.is_attached()
    }
}

/// Registry of live room buses, keyed by room id, so route handlers can
/// look up (or lazily create) the bus a newly-accepted connection should
/// subscribe to.
#[derive(Default)]
pub struct TransportRegistry {
    buses: Mutex<HashMap<String, Arc<RoomBus>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus_for(&self, room_id: &str) -> Arc<RoomBus> {
        self.buses
            .lock()
            .unwrap()
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(RoomBus::new()))
            .clone()
    }

    pub fn remove(&self, room_id: &str) {
        self.buses.lock().unwrap().remove(room_id);
    }
}
