//! Sync/Diff engine (spec.md §4.2).
//!
//! Walks an entity tree and installs, per signal field, a subscriber that
//! turns change events into writes at two root-level buffers: the sync
//! cache (broadcast to clients) and the persist cache (written through the
//! [`crate::persistence::PersistenceAdapter`]). Both are throttled,
//! trailing-edge buffers keyed by dotted path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::entity::{Entity, EntityRegistry, FieldKind, FieldRole};
use crate::persistence::PersistenceAdapter;
use crate::signal::{SignalChange, SignalItem};

/// A cache entry: either a concrete value, or the delete sentinel.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Value(Value),
    Delete,
}

impl CacheValue {
    /// The wire representation used when folding into a sync fragment
    /// (spec.md §6.1: delete is serialized as the string `"$delete"`).
    pub fn to_wire(&self) -> Value {
        match self {
            CacheValue::Value(v) => v.clone(),
            CacheValue::Delete => Value::from("$delete"),
        }
    }
}

pub const DELETE_SENTINEL: &str = "$delete";

type SyncBroadcastFn = Arc<dyn Fn(Value) + Send + Sync>;

/// The engine's two buffers plus the cumulative snapshot, shared at the
/// root of a room's entity tree.
pub struct SyncEngine {
    sync_cache: Mutex<HashMap<String, CacheValue>>,
    persist_cache: Mutex<HashMap<String, CacheValue>>,
    snapshot: Mutex<HashMap<String, CacheValue>>,
    auto_sync: AtomicBool,
    sync_armed: AtomicBool,
    persist_armed: AtomicBool,
    throttle_sync: Duration,
    throttle_persist: Duration,
    on_sync: Mutex<Option<SyncBroadcastFn>>,
    persistence: Arc<dyn PersistenceAdapter>,
}

impl SyncEngine {
    pub fn new(
        throttle_sync: Duration,
        throttle_persist: Duration,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sync_cache: Mutex::new(HashMap::new()),
            persist_cache: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(HashMap::new()),
            auto_sync: AtomicBool::new(true),
            sync_armed: AtomicBool::new(false),
            persist_armed: AtomicBool::new(false),
            throttle_sync,
            throttle_persist,
            on_sync: Mutex::new(None),
            persistence,
        })
    }

    /// Registers the callback invoked with the folded sync fragment at each
    /// flush. Must be set before any mutation to avoid missing the first
    /// flush, mirroring the teacher's pattern of wiring the event bus
    /// before handing state to the server.
    pub fn set_on_sync(&self, f: SyncBroadcastFn) {
        *self.on_sync.lock().unwrap() = Some(f);
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.auto_sync.store(enabled, Ordering::SeqCst);
    }

    /// Installs subscribers on every field of `entity`, recursing into
    /// `users`-role collections that already hold entity instances. Call
    /// once per entity at construction/insertion time — installed
    /// subscribers are one-shot and never torn down (spec.md §9: "no
    /// user-visible cycle", "installed at creation").
    pub fn install(self: &Arc<Self>, entity: &Arc<Entity>, registry: &EntityRegistry) {
        for field in &entity.schema.fields {
            let Some(signal) = entity.field(field.name) else {
                continue;
            };
            let prop_path = join_path(&entity.path(), field.name);
            let engine = self.clone();
            let sync_to_client = signal.options.sync_to_client;
            let persist = signal.options.persist;
            let transform = signal.options.transform.clone();
            let registry = registry.clone();
            let is_users_map = matches!(field.role, FieldRole::Users { .. });
            let kind = field.kind;

            // Seed already-present entries (e.g. restored on construction)
            // into the caches/snapshot before wiring future changes.
            engine.seed(kind, is_users_map, &prop_path, signal, &registry, sync_to_client, persist, &transform);

            signal.subscribe(Arc::new(move |change| {
                engine.handle_change(
                    &prop_path,
                    kind,
                    is_users_map,
                    change,
                    &registry,
                    sync_to_client,
                    persist,
                    &transform,
                );
            }));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn seed(
        self: &Arc<Self>,
        kind: FieldKind,
        is_users_map: bool,
        prop_path: &str,
        signal: &Arc<crate::signal::Signal>,
        registry: &EntityRegistry,
        sync_to_client: bool,
        persist: bool,
        transform: &Option<Arc<dyn Fn(&Value) -> Value + Send + Sync>>,
    ) {
        match kind {
            FieldKind::Scalar => {
                let value = signal.get();
                if !value.is_null() {
                    self.write(prop_path, CacheValue::Value(apply_transform(transform, value)), sync_to_client, persist);
                }
            }
            FieldKind::Array => {
                for (index, item) in signal.array_get().into_iter().enumerate() {
                    self.seed_item(&format!("{prop_path}.{index}"), item, is_users_map, registry, sync_to_client, persist, transform);
                }
            }
            FieldKind::Map => {
                for (key, item) in signal.map_entries() {
                    self.seed_item(&format!("{prop_path}.{key}"), item, is_users_map, registry, sync_to_client, persist, transform);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn seed_item(
        self: &Arc<Self>,
        path: &str,
        item: SignalItem,
        is_users_map: bool,
        registry: &EntityRegistry,
        sync_to_client: bool,
        persist: bool,
        transform: &Option<Arc<dyn Fn(&Value) -> Value + Send + Sync>>,
    ) {
        match item {
            SignalItem::Entity(entity) if is_users_map => {
                entity.set_path(path.to_string());
                self.install(&entity, registry);
            }
            SignalItem::Json(value) => {
                self.write(path, CacheValue::Value(apply_transform(transform, value)), sync_to_client, persist);
            }
            SignalItem::Entity(_) => {
                // Non-users collections of entities are not part of this
                // spec's data model; nothing to seed.
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_change(
        self: &Arc<Self>,
        prop_path: &str,
        kind: FieldKind,
        is_users_map: bool,
        change: &SignalChange,
        registry: &EntityRegistry,
        sync_to_client: bool,
        persist: bool,
        transform: &Option<Arc<dyn Fn(&Value) -> Value + Send + Sync>>,
    ) {
        debug_assert!(matches!(
            (kind, change),
            (FieldKind::Scalar, SignalChange::Set { .. })
                | (FieldKind::Array, SignalChange::ArrayAdd { .. })
                | (FieldKind::Array, SignalChange::ArrayUpdate { .. })
                | (FieldKind::Array, SignalChange::ArrayRemove { .. })
                | (FieldKind::Array, SignalChange::ArrayReset { .. })
                | (FieldKind::Map, SignalChange::MapAdd { .. })
                | (FieldKind::Map, SignalChange::MapUpdate { .. })
                | (FieldKind::Map, SignalChange::MapRemove { .. })
                | (FieldKind::Map, SignalChange::MapReset { .. })
        ));

        match change {
            SignalChange::Set { value } => {
                self.write(prop_path, CacheValue::Value(apply_transform(transform, value.clone())), sync_to_client, persist);
            }
            SignalChange::ArrayAdd { index, items } | SignalChange::ArrayUpdate { index, items } => {
                for (offset, item) in items.iter().enumerate() {
                    let path = format!("{prop_path}.{}", index + offset);
                    self.seed_item(&path, item.clone(), is_users_map, registry, sync_to_client, persist, transform);
                }
            }
            SignalChange::ArrayRemove { index, items } => {
                for offset in 0..items.len() {
                    let path = format!("{prop_path}.{}", index + offset);
                    self.write(&path, CacheValue::Delete, sync_to_client, persist);
                }
            }
            SignalChange::ArrayReset { items } => {
                for (index, item) in items.iter().enumerate() {
                    let path = format!("{prop_path}.{index}");
                    self.seed_item(&path, item.clone(), is_users_map, registry, sync_to_client, persist, transform);
                }
            }
            SignalChange::MapAdd { key, value } | SignalChange::MapUpdate { key, value } => {
                let path = format!("{prop_path}.{key}");
                self.seed_item(&path, value.clone(), is_users_map, registry, sync_to_client, persist, transform);
            }
            SignalChange::MapRemove { key } => {
                let path = format!("{prop_path}.{key}");
                self.write(&path, CacheValue::Delete, sync_to_client, persist);
            }
            SignalChange::MapReset { entries } => {
                for (key, value) in entries {
                    let path = format!("{prop_path}.{key}");
                    self.seed_item(&path, value.clone(), is_users_map, registry, sync_to_client, persist, transform);
                }
            }
        }
    }

    /// Writes one leaf into the sync/persist caches (per the enabled
    /// options) and immediately folds it into the running snapshot, so a
    /// joining client always sees true current state regardless of the
    /// broadcast throttle's cadence (this crate's resolution of the
    /// ambiguity in spec.md §4.2 "Snapshot of the full state").
    fn write(self: &Arc<Self>, path: &str, value: CacheValue, sync_to_client: bool, persist: bool) {
        if sync_to_client {
            {
                let mut snapshot = self.snapshot.lock().unwrap();
                match &value {
                    CacheValue::Delete => {
                        snapshot.remove(path);
                    }
                    CacheValue::Value(_) => {
                        snapshot.insert(path.to_string(), value.clone());
                    }
                }
            }
            let non_empty = {
                let mut cache = self.sync_cache.lock().unwrap();
                cache.insert(path.to_string(), value.clone());
                !cache.is_empty()
            };
            // Arm on every write where auto-sync is on and there's something
            // pending, not just the empty-to-non-empty transition: entries
            // accumulated while auto-sync was off would otherwise never get
            // armed once it's switched back on, since the cache was already
            // non-empty when the next write lands.
            if self.auto_sync.load(Ordering::SeqCst) && non_empty {
                self.arm_sync();
            }
        }
        if persist {
            let was_empty = {
                let mut cache = self.persist_cache.lock().unwrap();
                let was_empty = cache.is_empty();
                cache.insert(path.to_string(), value);
                was_empty
            };
            if was_empty {
                self.arm_persist();
            }
        }
    }

    fn arm_sync(self: &Arc<Self>) {
        if self.throttle_sync.is_zero() {
            self.flush_sync();
            return;
        }
        if self.sync_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let dur = self.throttle_sync;
        tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            engine.sync_armed.store(false, Ordering::SeqCst);
            engine.flush_sync();
        });
    }

    fn arm_persist(self: &Arc<Self>) {
        if self.throttle_persist.is_zero() {
            self.flush_persist();
            return;
        }
        if self.persist_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let dur = self.throttle_persist;
        tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            engine.persist_armed.store(false, Ordering::SeqCst);
            engine.flush_persist();
        });
    }

    /// Flushes the sync cache: folds it into a nested object and invokes
    /// the broadcast callback, then clears the cache. No-op if empty or if
    /// no callback is registered.
    pub fn flush_sync(&self) {
        let drained: HashMap<String, CacheValue> = {
            let mut cache = self.sync_cache.lock().unwrap();
            std::mem::take(&mut *cache)
        };
        if drained.is_empty() {
            return;
        }
        if let Some(cb) = self.on_sync.lock().unwrap().as_ref() {
            cb(expand(&drained));
        }
    }

    /// Explicit manual-mode flush (spec.md §4.2 `applySync()`).
    pub fn apply_sync(&self) {
        self.flush_sync();
    }

    fn flush_persist(&self) {
        let drained: HashMap<String, CacheValue> = {
            let mut cache = self.persist_cache.lock().unwrap();
            std::mem::take(&mut *cache)
        };
        for (path, value) in drained {
            match value {
                CacheValue::Value(v) => {
                    let _ = self.persistence.put(&path, &v);
                }
                CacheValue::Delete => {
                    let _ = self.persistence.delete(&path);
                }
            }
        }
    }

    /// The cumulative fold of every sync entry ever applied, for a joining
    /// client's initial payload (spec.md §4.2 "Snapshot of the full
    /// state").
    pub fn full_snapshot(&self) -> Value {
        let snapshot = self.snapshot.lock().unwrap();
        expand(&snapshot)
    }
}

fn apply_transform(transform: &Option<Arc<dyn Fn(&Value) -> Value + Send + Sync>>, value: Value) -> Value {
    match transform {
        Some(f) => f(&value),
        None => value,
    }
}

fn join_path(parent: &str, local: &str) -> String {
    if parent.is_empty() {
        local.to_string()
    } else {
        format!("{parent}.{local}")
    }
}

/// Folds a `{"a.b.c": value}` cache into a nested JSON object, placing the
/// delete sentinel string at `c` when the entry is a delete.
pub fn expand(cache: &HashMap<String, CacheValue>) -> Value {
    let mut root = serde_json::Map::new();
    let mut paths: Vec<&String> = cache.keys().collect();
    paths.sort();
    for path in paths {
        let value = &cache[path];
        let parts: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        insert_path(&mut root, &parts, value);
    }
    Value::Object(root)
}

fn insert_path(root: &mut serde_json::Map<String, Value>, parts: &[&str], value: &CacheValue) {
    if parts.is_empty() {
        return;
    }
    if parts.len() == 1 {
        root.insert(parts[0].to_string(), value.to_wire());
        return;
    }
    let entry = root
        .entry(parts[0].to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(serde_json::Map::new());
    }
    let Value::Object(nested) = entry else {
        unreachable!()
    };
    insert_path(nested, &parts[1..], value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FieldDescriptor, FieldOptionsTemplate, FieldRole, SchemaDescriptor};
    use crate::persistence::InMemoryAdapter;
    use std::sync::atomic::AtomicUsize;

    fn room_schema() -> Arc<SchemaDescriptor> {
        Arc::new(SchemaDescriptor {
            class_name: "Room",
            fields: vec![
                FieldDescriptor {
                    name: "count",
                    kind: FieldKind::Scalar,
                    role: FieldRole::Plain,
                    options: FieldOptionsTemplate::default(),
                },
                FieldDescriptor {
                    name: "users",
                    kind: FieldKind::Map,
                    role: FieldRole::Users {
                        class_type: "Player",
                    },
                    options: FieldOptionsTemplate::default(),
                },
            ],
        })
    }

    fn player_schema() -> Arc<SchemaDescriptor> {
        Arc::new(SchemaDescriptor {
            class_name: "Player",
            fields: vec![
                FieldDescriptor {
                    name: "score",
                    kind: FieldKind::Scalar,
                    role: FieldRole::Plain,
                    options: FieldOptionsTemplate::default(),
                },
                FieldDescriptor {
                    name: "connected",
                    kind: FieldKind::Scalar,
                    role: FieldRole::Connected,
                    options: FieldOptionsTemplate::default(),
                },
            ],
        })
    }

    #[tokio::test]
    async fn scalar_mutation_flushes_into_expanded_sync_fragment() {
        let persistence = Arc::new(InMemoryAdapter::new());
        let engine = SyncEngine::new(Duration::ZERO, Duration::ZERO, persistence);
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        engine.set_on_sync(Arc::new(move |v| received2.lock().unwrap().push(v)));

        let root = Arc::new(Entity::new(room_schema()));
        root.set_path(String::new());
        let registry = EntityRegistry::new();
        engine.install(&root, &registry);

        root.field("count").unwrap().set(Value::from(1));

        let batches = received.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["count"], Value::from(1));
    }

    #[tokio::test]
    async fn entity_added_to_users_map_is_recursively_installed_and_reachable() {
        let persistence = Arc::new(InMemoryAdapter::new());
        let engine = SyncEngine::new(Duration::ZERO, Duration::ZERO, persistence);
        let flush_count = Arc::new(AtomicUsize::new(0));
        let flush_count2 = flush_count.clone();
        let last = Arc::new(Mutex::new(Value::Null));
        let last2 = last.clone();
        engine.set_on_sync(Arc::new(move |v| {
            flush_count2.fetch_add(1, Ordering::SeqCst);
            *last2.lock().unwrap() = v;
        }));

        let root = Arc::new(Entity::new(room_schema()));
        let registry = EntityRegistry::new();
        engine.install(&root, &registry);

        let player = Entity::new(player_schema());
        player.field("score").unwrap().set(Value::from(0));
        root.field("users")
            .unwrap()
            .map_set("pubA", SignalItem::Entity(Arc::new(player)));

        assert!(flush_count.load(Ordering::SeqCst) >= 1);
        let last = last.lock().unwrap();
        assert_eq!(last["users"]["pubA"]["score"], Value::from(0));
    }

    #[test]
    fn expand_places_delete_sentinel_for_removed_key() {
        let mut cache = HashMap::new();
        cache.insert("users.pubA".to_string(), CacheValue::Delete);
        cache.insert("count".to_string(), CacheValue::Value(Value::from(2)));
        let folded = expand(&cache);
        assert_eq!(folded["users"]["pubA"], Value::from(DELETE_SENTINEL));
        assert_eq!(folded["count"], Value::from(2));
    }

    #[test]
    fn manual_sync_mode_withholds_broadcast_until_apply_sync() {
        let persistence = Arc::new(InMemoryAdapter::new());
        let engine = SyncEngine::new(Duration::from_secs(9999), Duration::ZERO, persistence);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        engine.set_on_sync(Arc::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        engine.set_auto_sync(false);

        let root = Arc::new(Entity::new(room_schema()));
        let registry = EntityRegistry::new();
        engine.install(&root, &registry);
        root.field("count").unwrap().set(Value::from(1));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        engine.apply_sync();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reenabling_auto_sync_flushes_writes_pending_from_manual_mode() {
        let persistence = Arc::new(InMemoryAdapter::new());
        let engine = SyncEngine::new(Duration::ZERO, Duration::ZERO, persistence);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        engine.set_on_sync(Arc::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        engine.set_auto_sync(false);

        let root = Arc::new(Entity::new(room_schema()));
        let registry = EntityRegistry::new();
        engine.install(&root, &registry);
        root.field("count").unwrap().set(Value::from(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Cache is already non-empty from the manual-mode write above; this
        // must still arm and flush now that auto-sync is back on, not just
        // on an empty-to-non-empty transition.
        engine.set_auto_sync(true);
        root.field("count").unwrap().set(Value::from(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
