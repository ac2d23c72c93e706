//! Per-room HTTP/SSE surface (spec.md §4.4): connect (SSE upgrade), action
//! dispatch, and the request passthrough, mounted under `/rooms`.
//!
//! Grounded directly on the teacher's `routes/stream.rs` SSE handler for
//! the connect route and `routes/rooms.rs`'s `Result<T, (Status,
//! Json<Value>)>` handler shape (generalized here to `EngineError` via the
//! central `Responder` impl).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rocket::response::stream::EventStream;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde_json::Value;

use crate::error::EngineError;
use crate::room::ConnectContext;
use crate::room_manager::RoomManager;
use crate::routes::ClientIp;
use crate::session::TransferRegistry;
use crate::transport::{AttachmentFlag, Frame, SseConnection};

const HEARTBEAT: Duration = Duration::from_secs(15);

#[get("/<room_type>/<room_id>/connect?<private_id>&<transfer_token>")]
pub async fn connect<'r>(
    room_type: &str,
    room_id: &str,
    private_id: Option<String>,
    transfer_token: Option<String>,
    client_ip: ClientIp,
    rooms: &'r State<RoomManager>,
    transfers: &'r State<Arc<TransferRegistry>>,
) -> Result<EventStream![rocket::response::stream::Event + 'r], EngineError> {
    let room = rooms.get_or_create(room_type, room_id)?;
    let ctx = ConnectContext {
        headers: HashMap::new(),
        query: HashMap::from([("clientIp".to_string(), client_ip.0.to_string())]),
        private_id,
        transfer_token,
    };
    let accepted = room.accept(ctx, transfers).await?;

    // Subscribe to the room's own bus, not a standalone one: the sync
    // engine's broadcast callback is wired onto `room.bus()` at
    // `RoomRuntime::new`, so any other bus would never see a sync frame.
    let bus = room.bus().clone();
    let attached = AttachmentFlag::new();
    let mut connection = SseConnection::new(bus, attached);
    if let Some(filter) = room.outbound_filter_for(accepted.session.clone()) {
        connection = connection.with_filter(filter);
    }

    // The initial snapshot carries the session's own identity alongside the
    // room tree (spec.md §4.3.1 step 7: "send an initial sync message
    // containing the full snapshot augmented with {pId, privateId}") — it's
    // the only place a client ever learns its own privateId.
    let mut snapshot = accepted.initial_snapshot;
    if let Value::Object(map) = &mut snapshot {
        map.insert("pId".to_string(), Value::String(accepted.session.public_id.clone()));
        map.insert(
            "privateId".to_string(),
            Value::String(accepted.session.private_id.clone()),
        );
    }
    let initial = Frame::new("full", snapshot);
    Ok(connection.into_event_stream(Some(initial), HEARTBEAT))
}

#[post("/<_room_type>/<room_id>/action/<action>/<private_id>", data = "<body>")]
pub async fn dispatch_action(
    _room_type: &str,
    room_id: &str,
    action: &str,
    private_id: &str,
    rooms: &State<RoomManager>,
    body: Json<Value>,
) -> Result<Json<Value>, EngineError> {
    let room = rooms
        .get(room_id)
        .ok_or_else(|| EngineError::NotFound("room not live on this process".into()))?;
    room.dispatch_action(private_id, action, body.into_inner()).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[post("/<_room_type>/<room_id>/request/<path..>", data = "<body>")]
pub async fn dispatch_request(
    _room_type: &str,
    room_id: &str,
    path: std::path::PathBuf,
    rooms: &State<RoomManager>,
    body: Json<Value>,
) -> Result<Json<Value>, EngineError> {
    let room = rooms
        .get(room_id)
        .ok_or_else(|| EngineError::NotFound("room not live on this process".into()))?;
    let path = format!("/{}", path.display());
    let result = room.dispatch_request("POST", &path, body.into_inner()).await?;
    Ok(Json(result))
}

#[post("/<_room_type>/<room_id>/disconnect/<private_id>")]
pub fn disconnect(
    _room_type: &str,
    room_id: &str,
    private_id: &str,
    rooms: &State<RoomManager>,
) -> Result<Json<Value>, EngineError> {
    let room = rooms
        .get(room_id)
        .ok_or_else(|| EngineError::NotFound("room not live on this process".into()))?;
    room.disconnect(private_id);
    Ok(Json(serde_json::json!({ "ok": true })))
}
