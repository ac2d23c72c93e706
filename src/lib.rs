//! Multi-tenant realtime coordination fabric (spec.md §1): reactive rooms
//! with a sync/persist engine, a world registry that places connections
//! across shards, and a session transfer protocol between rooms.
//!
//! Shaped after the teacher crate's `rocket()`/`rocket_with_db(...)`/
//! `build_rocket(...)` layering (`src/lib.rs`): the outer functions pick
//! defaults from the environment, the inner one does the actual
//! `.manage()`/`.attach()`/`.mount()` wiring. Unlike the teacher, which owns
//! one fixed route table for one application, this crate is a library a
//! host embeds: `rocket_with_room_manager` is the extension point a host
//! uses to register its own room types before the server boots, since
//! Rocket's managed state is fixed at build time.

pub mod config;
pub mod entity;
pub mod error;
pub mod persistence;
pub mod rate_limit;
pub mod room;
pub mod room_manager;
pub mod routes;
pub mod session;
pub mod shard_proxy;
pub mod signal;
pub mod sync;
pub mod transport;
pub mod world;

use std::env;
use std::sync::Arc;

use rocket_cors::CorsOptions;

use config::{HeartbeatConfig, WorldAuthConfig};
use persistence::{PersistenceAdapter, SqliteAdapter};
use rate_limit::RateLimiter;
use room_manager::RoomManager;
use session::TransferRegistry;
use world::{spawn_heartbeat_sweep, PlacementStrategy, WorldRegistry};

/// Default placement strategy for worlds built via the `rocket*` helpers.
/// A host that needs a different strategy should construct a
/// [`WorldRegistry`] directly and use it to `.manage()` its own Rocket
/// build instead of going through these convenience functions.
const DEFAULT_PLACEMENT: PlacementStrategy = PlacementStrategy::RoundRobin;

/// Builds the server with no room types registered — only the world and
/// system routes are useful without a follow-up call to
/// [`rocket_with_room_manager`] or manual `.manage(RoomManager)`.
pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/rooms-fabric.db".to_string());
    rocket_with_db(&db_path)
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    rocket_with_room_manager(db_path, |_rooms| {})
}

/// Builds the server, letting `configure_rooms` register room types on the
/// freshly constructed [`RoomManager`] before it's handed to Rocket as
/// managed state (mirrors the teacher's `rocket_with_db_and_config`, which
/// takes a pre-built config rather than a config struct literal since a
/// `RoomTypeSpec`'s `setup` closure isn't representable as plain data).
pub fn rocket_with_room_manager(
    db_path: &str,
    configure_rooms: impl FnOnce(&mut RoomManager),
) -> rocket::Rocket<rocket::Build> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(
        SqliteAdapter::open(db_path).unwrap_or_else(|e| panic!("failed to open {db_path}: {e}")),
    );

    let mut rooms = RoomManager::new(persistence.clone());
    configure_rooms(&mut rooms);

    let auth_config = WorldAuthConfig::from_env();
    let rate_limiter = RateLimiter::new(&auth_config);
    let world_registry = Arc::new(WorldRegistry::new(DEFAULT_PLACEMENT, HeartbeatConfig::default()));
    let transfers = Arc::new(TransferRegistry::with_persistence(persistence.clone()));
    let heartbeat_interval = HeartbeatConfig::default().sweep_interval;

    // Cloned into the liftoff closure below rather than fished back out of
    // `rocket.state()`: that reference only lives as long as the fairing's
    // `&Rocket<Orbit>` argument, too short for the `'static` bound a
    // `tokio::spawn`ed sweep loop needs. Mirrors the teacher's
    // `rocket_with_db_and_config` (`src/lib.rs`), which captures an owned
    // `db_path.to_string()` ahead of its own liftoff closure for the same
    // reason.
    let sweep_world_registry = world_registry.clone();
    let sweep_transfers = transfers.clone();

    let cors = CorsOptions::default().to_cors().expect("failed to build CORS");

    rocket::build()
        .manage(rooms)
        .manage(world_registry)
        .manage(auth_config)
        .manage(rate_limiter)
        .manage(transfers)
        .attach(cors)
        .register("/", rocket::catchers![routes::system::too_many_requests, routes::system::not_found])
        .mount("/", rocket::routes![routes::system::health, routes::system::stats])
        .mount(
            "/rooms",
            rocket::routes![
                routes::room_routes::connect,
                routes::room_routes::dispatch_action,
                routes::room_routes::dispatch_request,
                routes::room_routes::disconnect,
            ],
        )
        .mount(
            "/parties/world",
            rocket::routes![
                routes::world_routes::register_room,
                routes::world_routes::register_shard,
                routes::world_routes::update_shard,
                routes::world_routes::scale_room,
                routes::world_routes::connect,
                routes::world_routes::room_info,
                routes::world_routes::transfer_user_session,
                routes::world_routes::transfer_room_state,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Background Sweeps",
            move |_rocket| {
                Box::pin(async move {
                    spawn_heartbeat_sweep(sweep_world_registry, heartbeat_interval);
                    log::info!("world heartbeat sweep started (every {heartbeat_interval:?})");
                    spawn_transfer_sweep(sweep_transfers);
                    log::info!("transfer token sweep started");
                })
            },
        ))
}

/// Periodic sweep for expired `transfer:{token}` grants (SPEC_FULL.md
/// §4.S.3), alongside the heartbeat sweep above in the same liftoff
/// fairing since both are best-effort background reapers over state that
/// lives in Rocket's managed `State`.
fn spawn_transfer_sweep(transfers: Arc<TransferRegistry>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            let removed = transfers.sweep_expired(config::TRANSFER_TOKEN_TTL);
            if removed > 0 {
                log::info!("transfer sweep removed {removed} expired token(s)");
            }
        }
    });
}
