//! Registry of live room instances on this process (spec.md §4.4
//! "Room instantiation"/"hibernate"), keyed by room type plus instance id.
//!
//! Mirrors the teacher's `Db` being a single piece of `.manage()`d state
//! (`src/lib.rs`) that every route reaches through Rocket's state
//! injection — here the managed state is a catalog of room *types* plus a
//! lazily-populated map of live instances rather than a database handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::RoomConfig;
use crate::entity::{EntityRegistry, SchemaDescriptor};
use crate::error::{EngineError, EngineResult};
use crate::persistence::PersistenceAdapter;
use crate::room::RoomRuntime;

/// Everything needed to construct a fresh instance of one room type:
/// its entity schema, its nested-entity factories, its config, and a setup
/// hook that wires action handlers/guards/lifecycle hooks onto a freshly
/// built [`RoomRuntime`] (the generalization of the teacher's per-route
/// handler bodies into data the manager can invoke generically).
#[derive(Clone)]
pub struct RoomTypeSpec {
    pub room_type: String,
    pub schema: Arc<SchemaDescriptor>,
    pub entity_registry: EntityRegistry,
    pub config: RoomConfig,
    pub setup: Arc<dyn Fn(&Arc<RoomRuntime>) + Send + Sync>,
}

pub struct RoomManager {
    specs: HashMap<String, RoomTypeSpec>,
    persistence: Arc<dyn PersistenceAdapter>,
    instances: Mutex<HashMap<String, Arc<RoomRuntime>>>,
}

impl RoomManager {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            specs: HashMap::new(),
            persistence,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_type(&mut self, spec: RoomTypeSpec) {
        self.specs.insert(spec.room_type.clone(), spec);
    }

    /// Returns the existing instance for `room_id`, or builds one from the
    /// registered type spec on first access (spec.md §6.4 `hibernate`:
    /// a room is not built until something needs it).
    pub fn get_or_create(&self, room_type: &str, room_id: &str) -> EngineResult<Arc<RoomRuntime>> {
        if let Some(existing) = self.instances.lock().unwrap().get(room_id) {
            return Ok(existing.clone());
        }
        let spec = self
            .specs
            .get(room_type)
            .ok_or_else(|| EngineError::NotFound(format!("unknown room type {room_type}")))?;
        let room = RoomRuntime::new(
            room_id.to_string(),
            spec.config.clone(),
            spec.schema.clone(),
            spec.entity_registry.clone(),
            self.persistence.clone(),
        );
        (spec.setup)(&room);
        self.instances
            .lock()
            .unwrap()
            .insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<RoomRuntime>> {
        self.instances.lock().unwrap().get(room_id).cloned()
    }

    /// Drops an instance once it has no connections left, called after a
    /// room's last disconnect grace period elapses (spec.md §9 "rooms with
    /// zero connections are eventually collected, not kept forever").
    pub fn evict_if_empty(&self, room_id: &str) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(room) = instances.get(room_id) {
            if room.active_connections() == 0 {
                instances.remove(room_id);
            }
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}
