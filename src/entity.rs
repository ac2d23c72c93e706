//! Decorated entities, realized as explicit schema descriptors rather than
//! class decorators (spec.md §9 "Metaprogramming").
//!
//! Each entity class is described by a static [`SchemaDescriptor`]: an
//! ordered list of field descriptors naming the field's signal kind and its
//! role(s) (`id`, `users`, `connected`, `sync`/`persist`). The engine
//! consults this descriptor when constructing instances and when the sync
//! engine walks the tree to install subscribers (see `sync.rs`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::signal::{Signal, SignalItem, SignalOptions};

/// The shape of a signal field, independent of its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    Array,
    Map,
}

/// Declared roles a field can carry (spec.md §3 "Decorated Entity").
/// A field may carry more than one role (e.g. `sync` + `persist` are the
/// ambient defaults every field carries unless overridden in options).
#[derive(Debug, Clone)]
pub enum FieldRole {
    /// Ordinary data field, synced/persisted per its `SignalOptions`.
    Plain,
    /// This field is the entity's key when stored in a `users` map.
    Id,
    /// A map-of-entities keyed by public id; `class_type` names the
    /// registered factory used to instantiate new entries.
    Users { class_type: &'static str },
    /// Tracks liveness; flipped false on disconnect, true on (re)join.
    Connected,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    pub role: FieldRole,
    pub options: FieldOptionsTemplate,
}

/// Plain-data template for `SignalOptions` (the `transform` closure, if
/// any, is supplied by the entity constructor since it isn't `Clone`).
#[derive(Debug, Clone, Copy)]
pub struct FieldOptionsTemplate {
    pub sync_to_client: bool,
    pub persist: bool,
}

impl Default for FieldOptionsTemplate {
    fn default() -> Self {
        Self {
            sync_to_client: true,
            persist: true,
        }
    }
}

impl FieldOptionsTemplate {
    pub fn to_signal_options(self, class_type: Option<&'static str>) -> SignalOptions {
        SignalOptions {
            sync_to_client: self.sync_to_client,
            persist: self.persist,
            class_type,
            transform: None,
        }
    }
}

/// Ordered field list for one entity class.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    pub class_name: &'static str,
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    pub fn id_field(&self) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| matches!(f.role, FieldRole::Id))
    }

    pub fn users_field(&self) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| matches!(f.role, FieldRole::Users { .. }))
    }

    pub fn connected_field(&self) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| matches!(f.role, FieldRole::Connected))
    }
}

/// A live instance of a schema-described class. Every node in the room
/// state tree carries `$path` (dotted location from the root) and is
/// constructed with empty/default signals per its schema.
pub struct Entity {
    pub schema: Arc<SchemaDescriptor>,
    path: Mutex<String>,
    fields: HashMap<&'static str, Arc<Signal>>,
}

impl Entity {
    /// Builds a fresh instance with default-valued signals for every field
    /// in `schema`. Scalars default to `null`, arrays/maps to empty.
    pub fn new(schema: Arc<SchemaDescriptor>) -> Self {
        let mut fields = HashMap::new();
        for field in &schema.fields {
            let class_type = match &field.role {
                FieldRole::Users { class_type } => Some(*class_type),
                _ => None,
            };
            let options = field.options.to_signal_options(class_type);
            let signal = match field.kind {
                FieldKind::Scalar => Signal::scalar_with_options(Value::Null, options),
                FieldKind::Array => Signal::array_with_options(vec![], options),
                FieldKind::Map => Signal::map_with_options(vec![], options),
            };
            fields.insert(field.name, Arc::new(signal));
        }
        Self {
            schema,
            path: Mutex::new(String::new()),
            fields,
        }
    }

    pub fn path(&self) -> String {
        self.path.lock().unwrap().clone()
    }

    pub fn set_path(&self, path: String) {
        *self.path.lock().unwrap() = path;
    }

    pub fn field(&self, name: &str) -> Option<&Arc<Signal>> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schema.fields.iter().map(|f| f.name)
    }

    /// Populate this entity's scalar fields from a flat `{field: value}`
    /// bag, used to restore state on reconnect/transfer (spec.md §4.4
    /// "State restoration"). Unknown keys are ignored; non-scalar fields
    /// are skipped (arrays/maps are reconstructed from leaf paths by the
    /// persistence adapter, not from this bag).
    pub fn restore_scalars(&self, state: &Value) {
        let Some(obj) = state.as_object() else {
            return;
        };
        for (key, value) in obj {
            if let Some(signal) = self.fields.get(key.as_str()) {
                let is_scalar = self
                    .schema
                    .fields
                    .iter()
                    .find(|f| f.name == key.as_str())
                    .map(|f| f.kind == FieldKind::Scalar)
                    .unwrap_or(false);
                if is_scalar {
                    signal.set(value.clone());
                }
            }
        }
    }

    /// A scalar-only snapshot of this entity's directly-owned fields
    /// (arrays/maps are omitted, matching the persistence contract in
    /// spec.md §9: "the source persists only scalar leaves").
    pub fn scalar_snapshot(&self) -> Value {
        let mut map = serde_json::Map::new();
        for field in &self.schema.fields {
            if field.kind != FieldKind::Scalar || !field.options.persist {
                continue;
            }
            if let Some(signal) = self.fields.get(field.name) {
                map.insert(field.name.to_string(), signal.get());
            }
        }
        Value::Object(map)
    }
}

/// Factory used to instantiate a nested entity when a `users`-role map
/// gains a new key with the declared `class_type` (spec.md §3 "Entity
/// created").
pub type EntityFactory = Arc<dyn Fn() -> Entity + Send + Sync>;

/// Maps `class_type` names to constructors, resolved by the sync engine
/// when walking `users` collections (spec.md §9 arena-style storage note).
#[derive(Clone, Default)]
pub struct EntityRegistry {
    factories: HashMap<&'static str, EntityFactory>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class_type: &'static str, factory: EntityFactory) {
        self.factories.insert(class_type, factory);
    }

    pub fn instantiate(&self, class_type: &str) -> Option<Entity> {
        self.factories.get(class_type).map(|f| f())
    }
}

/// Wraps an entity in the `SignalItem::Entity` arm, for insertion into a
/// `users` map.
pub fn entity_item(entity: Entity) -> SignalItem {
    SignalItem::Entity(Arc::new(entity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_schema() -> Arc<SchemaDescriptor> {
        Arc::new(SchemaDescriptor {
            class_name: "Player",
            fields: vec![
                FieldDescriptor {
                    name: "name",
                    kind: FieldKind::Scalar,
                    role: FieldRole::Plain,
                    options: FieldOptionsTemplate::default(),
                },
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

    #[test]
    fn restore_scalars_only_touches_known_scalar_fields() {
        let entity = Entity::new(user_schema());
        entity.restore_scalars(&serde_json::json!({"name": "Alice", "bogus": 1}));
        assert_eq!(entity.field("name").unwrap().get(), Value::from("Alice"));
        assert!(entity.field("bogus").is_none());
    }

    #[test]
    fn scalar_snapshot_collects_persisted_scalars() {
        let entity = Entity::new(user_schema());
        entity.field("name").unwrap().set(Value::from("Bob"));
        entity.field("score").unwrap().set(Value::from(3));
        let snap = entity.scalar_snapshot();
        assert_eq!(snap["name"], Value::from("Bob"));
        assert_eq!(snap["score"], Value::from(3));
    }
}
