//! Health/stats endpoint (spec.md §6.2 "system"), analogous to the
//! teacher's implicit liftoff logging but exposed as a route so an
//! orchestrator can poll it the same way it polls a shard's `/update-shard`.

use rocket::get;
use rocket::serde::json::Json;
use rocket::State;
use serde_json::{json, Value};

use crate::room_manager::RoomManager;

#[get("/health")]
pub fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[get("/stats")]
pub fn stats(rooms: &State<RoomManager>) -> Json<Value> {
    Json(json!({ "liveRooms": rooms.instance_count() }))
}

#[rocket::catch(429)]
pub fn too_many_requests() -> Json<Value> {
    Json(json!({ "error": "too many requests" }))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<Value> {
    Json(json!({ "error": "not found" }))
}
