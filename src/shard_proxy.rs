//! Shard proxy (spec.md §4.6): forwards client traffic on a shard process
//! to the upstream "main" room over a persistent connection, wrapping each
//! event in a `shard.*` envelope so the main room can tell shard-relayed
//! traffic apart from direct connections.
//!
//! Grounded on the teacher's `webhooks.rs` dispatcher shape (a background
//! task holding a `reqwest::Client`, posting signed JSON) generalized from
//! one-shot webhook POSTs to a long-lived upstream link, and on
//! `routes/stream.rs`'s `tokio::select!` merge loop for the reverse
//! direction (upstream-to-client).

use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::transport::{Frame, RoomBus};

/// Envelope kinds a shard sends upstream (spec.md §4.6 "shard.* events").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEnvelopeKind {
    ClientConnected,
    ClientMessage,
    ClientDisconnected,
}

impl ShardEnvelopeKind {
    fn wire_name(self) -> &'static str {
        match self {
            ShardEnvelopeKind::ClientConnected => "shard.clientConnected",
            ShardEnvelopeKind::ClientMessage => "shard.clientMessage",
            ShardEnvelopeKind::ClientDisconnected => "shard.clientDisconnected",
        }
    }
}

fn wrap(kind: ShardEnvelopeKind, client_id: &str, payload: Value) -> Value {
    serde_json::json!({
        "type": kind.wire_name(),
        "clientId": client_id,
        "payload": payload,
    })
}

/// Forwards one shard process's client traffic to its main room. `upstream`
/// is the transport used to reach the main room; a real deployment backs it
/// with a persistent websocket/TCP link, but the proxy only needs
/// send/broadcast, so it is expressed against the same narrow
/// [`crate::transport::Connection`]-shaped surface used elsewhere.
pub struct ShardProxy {
    shard_id: String,
    upstream: Arc<RoomBus>,
    client: reqwest::Client,
    upstream_base_url: String,
}

impl ShardProxy {
    pub fn new(shard_id: impl Into<String>, upstream: Arc<RoomBus>, upstream_base_url: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            upstream,
            client: reqwest::Client::new(),
            upstream_base_url: upstream_base_url.into(),
        }
    }

    /// A client connected to this shard; relay the envelope to the main
    /// room's bus so any logic subscribed there (onJoin, presence) sees it
    /// uniformly with direct connections.
    pub fn forward_connected(&self, client_id: &str, handshake: Value) {
        self.upstream.broadcast(Frame::new(
            "shard",
            wrap(ShardEnvelopeKind::ClientConnected, client_id, handshake),
        ));
    }

    pub fn forward_message(&self, client_id: &str, message: Value) {
        self.upstream.broadcast(Frame::new(
            "shard",
            wrap(ShardEnvelopeKind::ClientMessage, client_id, message),
        ));
    }

    pub fn forward_disconnected(&self, client_id: &str) {
        self.upstream.broadcast(Frame::new(
            "shard",
            wrap(ShardEnvelopeKind::ClientDisconnected, client_id, Value::Null),
        ));
    }

    /// Routes an inbound frame from the main room back down to the shard's
    /// clients: a frame carrying `targetClientId` goes to that one client,
    /// anything else is broadcast to every client this shard holds
    /// (spec.md §4.6 "Downstream routing").
    pub fn route_downstream(&self, frame: &Frame, deliver_to: impl Fn(&str, &Frame)) {
        match frame.payload.get("targetClientId").and_then(Value::as_str) {
            Some(client_id) => deliver_to(client_id, frame),
            None => deliver_to("*", frame),
        }
    }

    /// Forwards an HTTP request from a shard-attached client up to the main
    /// room, tagging it with this shard's id and the client's real IP so
    /// the main room's handlers can apply IP-based guards as if the
    /// request arrived directly (spec.md §4.6 "Request passthrough").
    pub async fn forward_request(
        &self,
        method: reqwest::Method,
        path: &str,
        client_ip: &str,
        body: Value,
    ) -> EngineResult<Value> {
        let url = format!("{}{}", self.upstream_base_url, path);
        let response = self
            .client
            .request(method, &url)
            .header("X-Shard-Id", &self.shard_id)
            .header("X-Forwarded-For", client_ip)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "upstream returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_downstream_targets_single_client_when_addressed() {
        let bus = Arc::new(RoomBus::new());
        let proxy = ShardProxy::new("shardA", bus, "http://main.internal");
        let frame = Frame::new(
            "message",
            serde_json::json!({ "targetClientId": "c1", "text": "hi" }),
        );
        let mut delivered = Vec::new();
        proxy.route_downstream(&frame, |client_id, _| delivered.push(client_id.to_string()));
        assert_eq!(delivered, vec!["c1"]);
    }

    #[test]
    fn route_downstream_broadcasts_when_unaddressed() {
        let bus = Arc::new(RoomBus::new());
        let proxy = ShardProxy::new("shardA", bus, "http://main.internal");
        let frame = Frame::new("message", serde_json::json!({ "text": "hi" }));
        let mut delivered = Vec::new();
        proxy.route_downstream(&frame, |client_id, _| delivered.push(client_id.to_string()));
        assert_eq!(delivered, vec!["*"]);
    }

    #[test]
    fn forward_connected_wraps_and_broadcasts_envelope() {
        let bus = Arc::new(RoomBus::new());
        let mut rx = bus.subscribe();
        let proxy = ShardProxy::new("shardA", bus, "http://main.internal");
        proxy.forward_connected("c1", serde_json::json!({"ip": "1.2.3.4"}));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.payload["type"], "shard.clientConnected");
        assert_eq!(frame.payload["clientId"], "c1");
    }
}
