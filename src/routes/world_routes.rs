//! World HTTP surface (spec.md §6.2): room/shard catalog management and
//! session/room transfer, mounted at `/parties/world/<world_id>` and guarded
//! by [`crate::world::jwt::WorldAdmin`] or the combined
//! [`crate::world::jwt::WorldCaller`] depending on the endpoint (spec.md
//! §4.5 "HTTP/Action surface").

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::WorldAuthConfig;
use crate::error::{EngineError, EngineResult};
use crate::rate_limit::RateLimiter;
use crate::session::TransferRegistry;
use crate::world::jwt::{WorldAdmin, WorldCaller};
use crate::world::{RoomDefinition, WorldRegistry};

fn enforce_rate_limit(limiter: &RateLimiter, key: &str) -> EngineResult<()> {
    let info = limiter.check(key);
    match info.retry_after {
        Some(retry_after) => Err(EngineError::RateLimited(retry_after)),
        None => Ok(()),
    }
}

/// Every handler is mounted under `/parties/world/<world_id>`; a request for
/// any id other than this process's configured one is a 404, not a 403 —
/// it isn't an authorization failure, the world simply isn't here.
fn check_world(world_id: &str, auth: &WorldAuthConfig) -> EngineResult<()> {
    if world_id != auth.world_id {
        return Err(EngineError::NotFound(format!("unknown world {world_id}")));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRoomRequest {
    pub room_type: String,
    pub path_pattern: String,
    pub min_shards: usize,
    pub max_shards: Option<usize>,
    pub shard_url_template: Option<String>,
}

#[post("/<world_id>/register-room", data = "<body>")]
pub fn register_room(
    world_id: &str,
    admin: WorldAdmin,
    auth: &State<WorldAuthConfig>,
    limiter: &State<RateLimiter>,
    world: &State<Arc<WorldRegistry>>,
    body: Json<RegisterRoomRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    if !admin.authorizes(world_id) {
        return Err(EngineError::Authorization(
            "token not authorized for this world".into(),
        ));
    }
    enforce_rate_limit(limiter, &admin.claims.sub)?;
    world.register_room(RoomDefinition {
        room_type: body.room_type.clone(),
        path_pattern: body.path_pattern.clone(),
        min_shards: body.min_shards,
        max_shards: body.max_shards,
        shard_url_template: body.shard_url_template.clone(),
    });
    Ok(Json(json!({ "registered": body.room_type })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterShardRequest {
    pub room_type: String,
    pub shard_id: String,
    pub address: String,
}

/// No admin/shard gate per spec.md §6.2's error table (only 404/400 listed
/// for this route) — a shard announcing itself can't yet hold the secret
/// the world would check it against in every deployment shape; the world
/// still refuses unknown room types.
#[post("/<world_id>/register-shard", data = "<body>")]
pub fn register_shard(
    world_id: &str,
    auth: &State<WorldAuthConfig>,
    world: &State<Arc<WorldRegistry>>,
    body: Json<RegisterShardRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    world.register_shard(&body.room_type, &body.shard_id, &body.address)?;
    Ok(Json(json!({ "registered": body.shard_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateShardRequest {
    pub room_type: String,
    pub shard_id: String,
    pub connections: usize,
    pub draining: Option<bool>,
}

#[post("/<world_id>/update-shard", data = "<body>")]
pub fn update_shard(
    world_id: &str,
    caller: WorldCaller,
    auth: &State<WorldAuthConfig>,
    world: &State<Arc<WorldRegistry>>,
    body: Json<UpdateShardRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    if !caller.authorizes(world_id) {
        return Err(EngineError::Authorization(
            "token not authorized for this world".into(),
        ));
    }
    world.update_shard(&body.room_type, &body.shard_id, body.connections, body.draining)?;
    Ok(Json(json!({ "updated": body.shard_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRoomRequest {
    pub room_type: String,
    pub target_shard_count: usize,
}

#[post("/<world_id>/scale-room", data = "<body>")]
pub fn scale_room(
    world_id: &str,
    caller: WorldCaller,
    auth: &State<WorldAuthConfig>,
    limiter: &State<RateLimiter>,
    world: &State<Arc<WorldRegistry>>,
    body: Json<ScaleRoomRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    if !caller.authorizes(world_id) {
        return Err(EngineError::Authorization(
            "token not authorized for this world".into(),
        ));
    }
    let rate_key = match &caller {
        WorldCaller::Admin(claims) => claims.sub.clone(),
        WorldCaller::Shard => "shard".to_string(),
    };
    enforce_rate_limit(limiter, &rate_key)?;
    let removed = world.scale_room(&body.room_type, body.target_shard_count)?;
    Ok(Json(json!({
        "removedShards": removed.iter().map(|s| s.shard_id.clone()).collect::<Vec<_>>()
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub room_id: String,
    #[serde(default)]
    pub auto_create: bool,
}

/// Placement request: picks a shard for a new connection to `roomId`
/// (spec.md §6.2 "/connect" — named `connect` here to avoid colliding with
/// the per-room SSE `connect` route mounted separately).
#[post("/<world_id>/connect", data = "<body>")]
pub fn connect(
    world_id: &str,
    auth: &State<WorldAuthConfig>,
    world: &State<Arc<WorldRegistry>>,
    body: Json<ConnectRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    let shard = world.get_optimal_shard(&body.room_id, body.auto_create)?;
    Ok(Json(json!({
        "success": true,
        "shardId": shard.shard_id,
        "url": shard.address,
    })))
}

#[get("/<world_id>/room-info?<room_id>")]
pub fn room_info(
    world_id: &str,
    room_id: Option<&str>,
    auth: &State<WorldAuthConfig>,
    world: &State<Arc<WorldRegistry>>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    match room_id {
        Some(room_id) => {
            let shards = world.snapshot(room_id)?;
            Ok(Json(json!({ "roomId": room_id, "shards": shards })))
        }
        None => Ok(Json(json!({ "rooms": world.all_rooms_snapshot() }))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferUserSessionRequest {
    pub from_room_id: String,
    pub to_room_id: Option<String>,
    pub session_id: String,
}

/// Issues a transfer token for a session already bound to a live room on
/// this process (spec.md §4.4 "transfer-user-session").
#[post("/<world_id>/transfer-user-session", data = "<body>")]
pub fn transfer_user_session(
    world_id: &str,
    caller: WorldCaller,
    auth: &State<WorldAuthConfig>,
    rooms: &State<crate::room_manager::RoomManager>,
    transfers: &State<Arc<TransferRegistry>>,
    body: Json<TransferUserSessionRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    if !caller.authorizes(world_id) {
        return Err(EngineError::Authorization(
            "token not authorized for this world".into(),
        ));
    }
    let room = rooms
        .get(&body.from_room_id)
        .ok_or_else(|| EngineError::NotFound("source room not live on this process".into()))?;
    let token = room.prepare_session_transfer(&body.session_id, body.to_room_id.clone(), transfers)?;
    Ok(Json(json!({ "transferToken": token })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRoomStateRequest {
    pub transfer_token: String,
}

/// Lets a target room preview the session a token carries before it
/// accepts the connection (spec.md §4.4 "transfer-room-state" —
/// validate-without-consume path, distinct from the connect-time
/// `complete_session_transfer` call in `RoomRuntime::accept`).
#[post("/<world_id>/transfer-room-state", data = "<body>")]
pub fn transfer_room_state(
    world_id: &str,
    caller: WorldCaller,
    auth: &State<WorldAuthConfig>,
    transfers: &State<Arc<TransferRegistry>>,
    body: Json<TransferRoomStateRequest>,
) -> Result<Json<Value>, EngineError> {
    check_world(world_id, auth)?;
    if !caller.authorizes(world_id) {
        return Err(EngineError::Authorization(
            "token not authorized for this world".into(),
        ));
    }
    let source_room = transfers
        .source_room_of(&body.transfer_token)
        .ok_or_else(|| EngineError::NotFound("unknown transfer token".into()))?;
    Ok(Json(json!({ "sourceRoomId": source_room })))
}
