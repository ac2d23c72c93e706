//! World registry and load balancer (spec.md §4.5).
//!
//! Tracks every room definition and the shards currently serving it, picks
//! a shard for a new connection via a pluggable placement strategy, and
//! periodically reaps shards that stop heartbeating. Shaped after the
//! teacher's `RateLimiter { limits: Mutex<HashMap<...>> }` (bookkeeping
//! behind one lock) and `spawn_retention_task` (`src/retention.rs`, a
//! `tokio::spawn` loop with an initial delay then `sleep(interval)` between
//! sweeps).

pub mod jwt;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::HeartbeatConfig;
use crate::error::{EngineError, EngineResult};

/// Declared configuration for one room type (spec.md §4.5 "RoomConfig").
#[derive(Debug, Clone)]
pub struct RoomDefinition {
    pub room_type: String,
    pub path_pattern: String,
    pub min_shards: usize,
    pub max_shards: Option<usize>,
    /// Address template for shards auto-provisioned by `get_optimal_shard`
    /// (spec.md §4.5 "provision one via the URL template"). `{index}` is
    /// substituted with the new shard's ordinal. `None` falls back to a
    /// loopback placeholder — this crate doesn't supervise shard processes,
    /// it only catalogs them (see DESIGN.md).
    pub shard_url_template: Option<String>,
}

impl Default for RoomDefinition {
    fn default() -> Self {
        Self {
            room_type: String::new(),
            path_pattern: String::new(),
            min_shards: 1,
            max_shards: None,
            shard_url_template: None,
        }
    }
}

/// Liveness/placement state of one shard process (spec.md §4.5
/// "ShardInfo").
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub shard_id: String,
    pub room_type: String,
    pub address: String,
    pub connection_count: usize,
    pub draining: bool,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    RoundRobin,
    LeastConnections,
    Random,
}

/// One room type's catalog entry plus its shards.
struct RoomEntry {
    definition: RoomDefinition,
    shards: Vec<ShardInfo>,
    round_robin_cursor: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSnapshot {
    pub shard_id: String,
    pub address: String,
    pub connection_count: usize,
    pub draining: bool,
}

/// The world's catalog of room types and their live shards, plus the
/// heartbeat sweep that ages them out.
pub struct WorldRegistry {
    rooms: Mutex<HashMap<String, RoomEntry>>,
    placement: PlacementStrategy,
    heartbeat: HeartbeatConfig,
}

impl WorldRegistry {
    pub fn new(placement: PlacementStrategy, heartbeat: HeartbeatConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            placement,
            heartbeat,
        }
    }

    /// Idempotent: re-registering the same `room_type` updates the
    /// definition in place rather than erroring (spec.md §4.5
    /// "register_room is idempotent").
    pub fn register_room(&self, definition: RoomDefinition) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms
            .entry(definition.room_type.clone())
            .and_modify(|entry| entry.definition = definition.clone())
            .or_insert_with(|| RoomEntry {
                definition,
                shards: Vec::new(),
                round_robin_cursor: AtomicUsize::new(0),
            });
    }

    /// Registers a shard process for a room type. Idempotent on
    /// `shard_id`: a repeat call refreshes the heartbeat and address
    /// instead of duplicating the entry.
    pub fn register_shard(&self, room_type: &str, shard_id: &str, address: &str) -> EngineResult<()> {
        let mut rooms = self.rooms.lock().unwrap();
        let entry = rooms
            .get_mut(room_type)
            .ok_or_else(|| EngineError::NotFound(format!("unknown room type {room_type}")))?;
        if let Some(shard) = entry.shards.iter_mut().find(|s| s.shard_id == shard_id) {
            shard.address = address.to_string();
            shard.last_heartbeat = Instant::now();
            shard.draining = false;
        } else {
            entry.shards.push(ShardInfo {
                shard_id: shard_id.to_string(),
                room_type: room_type.to_string(),
                address: address.to_string(),
                connection_count: 0,
                draining: false,
                last_heartbeat: Instant::now(),
            });
        }
        Ok(())
    }

    /// Heartbeat/metrics update from a shard (spec.md §4.5
    /// "update-shard"): connection count and an optional draining flag.
    pub fn update_shard(
        &self,
        room_type: &str,
        shard_id: &str,
        connection_count: usize,
        draining: Option<bool>,
    ) -> EngineResult<()> {
        let mut rooms = self.rooms.lock().unwrap();
        let entry = rooms
            .get_mut(room_type)
            .ok_or_else(|| EngineError::NotFound(format!("unknown room type {room_type}")))?;
        let shard = entry
            .shards
            .iter_mut()
            .find(|s| s.shard_id == shard_id)
            .ok_or_else(|| EngineError::NotFound(format!("unknown shard {shard_id}")))?;
        shard.connection_count = connection_count;
        shard.last_heartbeat = Instant::now();
        if let Some(draining) = draining {
            shard.draining = draining;
        }
        Ok(())
    }

    /// Picks a shard to route a new connection to, per the configured
    /// placement strategy. Draining shards are never selected (spec.md
    /// §4.5 "placement never targets a draining shard").
    pub fn place(&self, room_type: &str) -> EngineResult<ShardInfo> {
        let rooms = self.rooms.lock().unwrap();
        let entry = rooms
            .get(room_type)
            .ok_or_else(|| EngineError::NotFound(format!("unknown room type {room_type}")))?;
        Self::pick(&self.placement, entry, room_type)
    }

    fn pick(placement: &PlacementStrategy, entry: &RoomEntry, room_type: &str) -> EngineResult<ShardInfo> {
        let candidates: Vec<&ShardInfo> = entry.shards.iter().filter(|s| !s.draining).collect();
        if candidates.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no available shard for room type {room_type}"
            )));
        }
        let chosen = match placement {
            PlacementStrategy::RoundRobin => {
                let cursor = entry.round_robin_cursor.fetch_add(1, Ordering::SeqCst);
                candidates[cursor % candidates.len()]
            }
            PlacementStrategy::LeastConnections => candidates
                .iter()
                .min_by_key(|s| s.connection_count)
                .copied()
                .expect("candidates is non-empty"),
            PlacementStrategy::Random => {
                let idx = pseudo_random_index(candidates.len());
                candidates[idx]
            }
        };
        Ok(chosen.clone())
    }

    /// Full placement algorithm for `/connect` (spec.md §4.5
    /// "getOptimalShard"): ensures the room and, when `auto_create` is set,
    /// provisions both the room definition and a first shard on demand
    /// instead of erroring.
    pub fn get_optimal_shard(&self, room_type: &str, auto_create: bool) -> EngineResult<ShardInfo> {
        let mut rooms = self.rooms.lock().unwrap();
        if !rooms.contains_key(room_type) {
            if !auto_create {
                return Err(EngineError::NotFound(format!("unknown room type {room_type}")));
            }
            rooms.insert(
                room_type.to_string(),
                RoomEntry {
                    definition: RoomDefinition {
                        room_type: room_type.to_string(),
                        path_pattern: format!("/{room_type}"),
                        ..Default::default()
                    },
                    shards: Vec::new(),
                    round_robin_cursor: AtomicUsize::new(0),
                },
            );
        }
        let entry = rooms.get_mut(room_type).expect("just ensured present");

        if entry.shards.iter().all(|s| s.draining) {
            if !auto_create {
                return Err(EngineError::NotFound(format!(
                    "no available shard for room type {room_type}"
                )));
            }
            let index = entry.shards.len();
            let address = entry
                .definition
                .shard_url_template
                .as_ref()
                .map(|template| template.replace("{index}", &index.to_string()))
                .unwrap_or_else(|| format!("http://127.0.0.1:0/shards/{room_type}/auto-{index}"));
            entry.shards.push(ShardInfo {
                shard_id: format!("{room_type}-auto-{index}"),
                room_type: room_type.to_string(),
                address,
                connection_count: 0,
                draining: false,
                last_heartbeat: Instant::now(),
            });
        }

        Self::pick(&self.placement, entry, room_type)
    }

    /// Adjusts the shard count target for a room type. Scale-down prefers
    /// evicting draining shards first, then the least-loaded ones (spec.md
    /// §4.5 "scale_room prefers draining shards for removal"). Rejects a
    /// target over the room type's configured max rather than silently
    /// clamping to it (spec.md §4.5 step 1, §6.2's "400 (over max)").
    pub fn scale_room(&self, room_type: &str, target: usize) -> EngineResult<Vec<ShardInfo>> {
        let mut rooms = self.rooms.lock().unwrap();
        let entry = rooms
            .get_mut(room_type)
            .ok_or_else(|| EngineError::NotFound(format!("unknown room type {room_type}")))?;

        let max = entry.definition.max_shards.unwrap_or(usize::MAX);
        if target > max {
            return Err(EngineError::Validation(format!(
                "target shard count {target} exceeds max {max} for room type {room_type}"
            )));
        }

        let min = entry.definition.min_shards;
        let clamped = target.max(min);

        if clamped >= entry.shards.len() {
            return Ok(entry.shards.clone());
        }

        let remove_count = entry.shards.len() - clamped;
        entry
            .shards
            .sort_by(|a, b| {
                b.draining
                    .cmp(&a.draining)
                    .then(a.connection_count.cmp(&b.connection_count))
            });
        let removed: Vec<ShardInfo> = entry.shards.drain(0..remove_count).collect();
        Ok(removed)
    }

    /// Sweeps every room type's shards: shards silent past
    /// `inactivity_threshold` are marked draining; shards already draining
    /// past `draining_grace` beyond that are removed outright (spec.md
    /// §4.5 "Heartbeats").
    pub fn sweep_inactive(&self) -> Vec<ShardInfo> {
        let mut removed = Vec::new();
        let mut rooms = self.rooms.lock().unwrap();
        for entry in rooms.values_mut() {
            let threshold = self.heartbeat.inactivity_threshold;
            let grace = self.heartbeat.draining_grace;
            for shard in entry.shards.iter_mut() {
                if !shard.draining && shard.last_heartbeat.elapsed() > threshold {
                    shard.draining = true;
                }
            }
            let threshold_plus_grace = threshold + grace;
            let (keep, drop): (Vec<ShardInfo>, Vec<ShardInfo>) = entry
                .shards
                .drain(..)
                .partition(|s| !(s.draining && s.last_heartbeat.elapsed() > threshold_plus_grace));
            entry.shards = keep;
            removed.extend(drop);
        }
        removed
    }

    pub fn snapshot(&self, room_type: &str) -> EngineResult<Vec<ShardSnapshot>> {
        let rooms = self.rooms.lock().unwrap();
        let entry = rooms
            .get(room_type)
            .ok_or_else(|| EngineError::NotFound(format!("unknown room type {room_type}")))?;
        Ok(shard_snapshots(entry))
    }

    /// The `GET /room-info` (no `roomId`) variant: every registered room
    /// type and its current shard list (spec.md §6.2).
    pub fn all_rooms_snapshot(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .values()
            .map(|entry| RoomInfo {
                room_type: entry.definition.room_type.clone(),
                path_pattern: entry.definition.path_pattern.clone(),
                shards: shard_snapshots(entry),
            })
            .collect()
    }
}

fn shard_snapshots(entry: &RoomEntry) -> Vec<ShardSnapshot> {
    entry
        .shards
        .iter()
        .map(|s| ShardSnapshot {
            shard_id: s.shard_id.clone(),
            address: s.address.clone(),
            connection_count: s.connection_count,
            draining: s.draining,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_type: String,
    pub path_pattern: String,
    pub shards: Vec<ShardSnapshot>,
}

/// Index generator for the `Random` placement strategy.
fn pseudo_random_index(len: usize) -> usize {
    use rand::Rng;
    rand::thread_rng().gen_range(0..len)
}

/// Runs `WorldRegistry::sweep_inactive` on a fixed interval, mirroring the
/// teacher's `spawn_retention_task` (`src/retention.rs`): an initial delay,
/// then an infinite `loop { sweep; sleep(interval) }`. Takes an owned `Arc`
/// so the caller can clone it into a `'static`-bounded `tokio::spawn`ed task
/// without borrowing from the short-lived `&Rocket<Orbit>` a liftoff fairing
/// receives.
pub fn spawn_heartbeat_sweep(
    registry: Arc<WorldRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = registry.sweep_inactive();
            if !removed.is_empty() {
                log::info!("heartbeat sweep removed {} inactive shard(s)", removed.len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_shards(strategy: PlacementStrategy, n: usize) -> WorldRegistry {
        let registry = WorldRegistry::new(strategy, HeartbeatConfig::default());
        registry.register_room(RoomDefinition {
            room_type: "lobby".into(),
            path_pattern: "/lobby/{id}".into(),
            min_shards: 1,
            max_shards: Some(10),
            ..Default::default()
        });
        for i in 0..n {
            registry
                .register_shard("lobby", &format!("shard{i}"), &format!("10.0.0.{i}:9000"))
                .unwrap();
        }
        registry
    }

    #[test]
    fn round_robin_distributes_across_shards() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 3);
        let picks: Vec<String> = (0..6).map(|_| registry.place("lobby").unwrap().shard_id).collect();
        assert_eq!(
            picks,
            vec!["shard0", "shard1", "shard2", "shard0", "shard1", "shard2"]
        );
    }

    #[test]
    fn least_connections_prefers_emptiest_shard() {
        let registry = registry_with_shards(PlacementStrategy::LeastConnections, 2);
        registry.update_shard("lobby", "shard0", 10, None).unwrap();
        registry.update_shard("lobby", "shard1", 2, None).unwrap();
        assert_eq!(registry.place("lobby").unwrap().shard_id, "shard1");
    }

    #[test]
    fn placement_skips_draining_shards() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 2);
        registry.update_shard("lobby", "shard0", 0, Some(true)).unwrap();
        for _ in 0..4 {
            assert_eq!(registry.place("lobby").unwrap().shard_id, "shard1");
        }
    }

    #[test]
    fn scale_down_removes_draining_shards_first() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 3);
        registry.update_shard("lobby", "shard1", 5, Some(true)).unwrap();
        let removed = registry.scale_room("lobby", 2).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].shard_id, "shard1");
    }

    #[test]
    fn scale_target_is_clamped_to_min_shards() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 3);
        let remaining = registry.scale_room("lobby", 0).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn scale_target_over_max_is_rejected_not_clamped() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 3);
        let err = registry.scale_room("lobby", 11).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn register_room_is_idempotent_on_repeat_calls() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 1);
        registry.register_room(RoomDefinition {
            room_type: "lobby".into(),
            path_pattern: "/lobby/{id}".into(),
            min_shards: 1,
            max_shards: Some(20),
            ..Default::default()
        });
        assert_eq!(registry.snapshot("lobby").unwrap().len(), 1);
    }

    #[test]
    fn get_optimal_shard_without_auto_create_errors_on_unknown_room() {
        let registry = WorldRegistry::new(PlacementStrategy::RoundRobin, HeartbeatConfig::default());
        let err = registry.get_optimal_shard("ghost", false).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn get_optimal_shard_with_auto_create_provisions_room_and_shard() {
        let registry = WorldRegistry::new(PlacementStrategy::RoundRobin, HeartbeatConfig::default());
        let shard = registry.get_optimal_shard("fresh-room", true).unwrap();
        assert!(shard.shard_id.starts_with("fresh-room-auto-"));
        assert_eq!(registry.snapshot("fresh-room").unwrap().len(), 1);
    }

    #[test]
    fn get_optimal_shard_reuses_existing_shards_without_reprovisioning() {
        let registry = registry_with_shards(PlacementStrategy::RoundRobin, 2);
        let shard = registry.get_optimal_shard("lobby", true).unwrap();
        assert!(!shard.shard_id.contains("auto"));
        assert_eq!(registry.snapshot("lobby").unwrap().len(), 2);
    }
}
