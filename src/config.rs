//! Typed configuration, read once from the environment at startup.
//!
//! Mirrors the teacher crate's `RateLimitConfig::from_env` idiom: plain
//! structs with a `from_env` constructor and sensible defaults, no config
//! file format.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::room::ConnectContext;

/// A room-level connect guard (spec.md §6.4 `guards`): evaluated in
/// declaration order against the handshake context, any failure closes the
/// connection (spec.md §4.3.1 step 1). `Arc`-boxed rather than `Box`-boxed
/// so `RoomConfig` stays `Clone` — one spec is shared across every instance
/// of a room type (`RoomManager::get_or_create` clones it per instance).
pub type ConnectGuard = Arc<dyn Fn(&ConnectContext) -> EngineResult<()> + Send + Sync>;

/// Per-room configuration (spec.md §6.4).
#[derive(Clone)]
pub struct RoomConfig {
    /// URL pattern of the room, may contain `{params}`.
    pub path: String,
    /// Optional soft cap on simultaneous connections.
    pub max_users: Option<usize>,
    /// ms between persist flushes.
    pub throttle_storage: u64,
    /// ms between sync broadcasts.
    pub throttle_sync: u64,
    /// Disconnect grace period in ms (0 = immediate cleanup).
    pub session_expiry_time: u64,
    /// Defer room instantiation until first join.
    pub hibernate: bool,
    /// Ordered room-level connect guards (spec.md §6.4 `guards`).
    pub guards: Vec<ConnectGuard>,
}

impl std::fmt::Debug for RoomConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomConfig")
            .field("path", &self.path)
            .field("max_users", &self.max_users)
            .field("throttle_storage", &self.throttle_storage)
            .field("throttle_sync", &self.throttle_sync)
            .field("session_expiry_time", &self.session_expiry_time)
            .field("hibernate", &self.hibernate)
            .field("guards", &format!("<{} guard(s)>", self.guards.len()))
            .finish()
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            max_users: None,
            throttle_storage: 2000,
            throttle_sync: 500,
            session_expiry_time: 0,
            hibernate: false,
            guards: Vec::new(),
        }
    }
}

impl RoomConfig {
    pub fn throttle_storage_duration(&self) -> Duration {
        Duration::from_millis(self.throttle_storage)
    }

    pub fn throttle_sync_duration(&self) -> Duration {
        Duration::from_millis(self.throttle_sync)
    }
}

/// World-level auth and sweep configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct WorldAuthConfig {
    /// This process's world id; the HTTP surface is mounted at
    /// `/parties/world/{worldId}` and rejects requests for any other id
    /// (spec.md §6.2).
    pub world_id: String,
    /// HS256 secret for world admin JWTs.
    pub jwt_secret: Option<String>,
    /// Bearer-equivalent shared secret for intra-cluster shard calls.
    pub shard_secret: Option<String>,
    /// Max world-admin mutations per caller per window.
    pub admin_rate_max: usize,
    pub admin_rate_window_secs: u64,
}

impl Default for WorldAuthConfig {
    fn default() -> Self {
        Self {
            world_id: "default".to_string(),
            jwt_secret: None,
            shard_secret: None,
            admin_rate_max: 30,
            admin_rate_window_secs: 60,
        }
    }
}

impl WorldAuthConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(world_id) = env::var("WORLD_ID") {
            config.world_id = world_id;
        }
        if let Ok(secret) = env::var("AUTH_JWT_SECRET") {
            config.jwt_secret = Some(secret);
        }
        if let Ok(secret) = env::var("SHARD_SECRET") {
            config.shard_secret = Some(secret);
        }
        if let Ok(val) = env::var("RATE_LIMIT_WORLD_ADMIN")
            && let Ok(n) = val.parse::<usize>()
        {
            config.admin_rate_max = n;
        }

        config
    }
}

/// Heartbeat/inactivity sweep timings for the world's shard catalog
/// (spec.md §4.5 "Heartbeats").
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub sweep_interval: Duration,
    pub inactivity_threshold: Duration,
    pub draining_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            inactivity_threshold: Duration::from_secs(5 * 60),
            draining_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// Transfer token lifetime (spec.md §4.4 / §5 "Cancellation / timeouts").
pub const TRANSFER_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
