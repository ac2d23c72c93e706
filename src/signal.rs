//! Reactive signal core (spec.md §4.1).
//!
//! A `Signal` is a value cell of one of three kinds — scalar, array, or
//! map/object — that emits typed change events to subscribers. Collections
//! hold `SignalItem`s so that a map keyed by public id can carry nested
//! `Entity` instances (the `@users` role) alongside plain JSON leaves.

use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::entity::Entity;

/// An item stored in an array or map signal: either an opaque JSON value or
/// a nested entity (for `@users`-style collections).
#[derive(Clone)]
pub enum SignalItem {
    Json(Value),
    Entity(Arc<Entity>),
}

impl SignalItem {
    /// Render to JSON for wire/persist purposes. Entities render as their
    /// scalar-leaf snapshot is handled by the sync engine, not here; this is
    /// only used when a caller needs a plain-value view (e.g. diffing).
    pub fn as_json_hint(&self) -> Option<&Value> {
        match self {
            SignalItem::Json(v) => Some(v),
            SignalItem::Entity(_) => None,
        }
    }
}

/// One emitted change. Scalar signals emit `Set`; array signals emit
/// `Add|Update|Remove|Reset` with an index; map signals emit
/// `Add|Update|Remove` with a key, or `Reset` with the full value.
#[derive(Clone)]
pub enum SignalChange {
    Set {
        value: Value,
    },
    ArrayAdd {
        index: usize,
        items: Vec<SignalItem>,
    },
    ArrayUpdate {
        index: usize,
        items: Vec<SignalItem>,
    },
    ArrayRemove {
        index: usize,
        items: Vec<SignalItem>,
    },
    ArrayReset {
        items: Vec<SignalItem>,
    },
    MapAdd {
        key: String,
        value: SignalItem,
    },
    MapUpdate {
        key: String,
        value: SignalItem,
    },
    MapRemove {
        key: String,
    },
    MapReset {
        entries: Vec<(String, SignalItem)>,
    },
}

/// Per-signal options (spec.md §3 "Signal").
#[derive(Clone)]
pub struct SignalOptions {
    pub sync_to_client: bool,
    pub persist: bool,
    /// Declared entity class for map/array collections of nested entities.
    pub class_type: Option<&'static str>,
    /// Applied before a value is written into the sync/persist caches.
    /// Never applied to the delete sentinel.
    pub transform: Option<Arc<dyn Fn(&Value) -> Value + Send + Sync>>,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            sync_to_client: true,
            persist: true,
            class_type: None,
            transform: None,
        }
    }
}

impl std::fmt::Debug for SignalOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalOptions")
            .field("sync_to_client", &self.sync_to_client)
            .field("persist", &self.persist)
            .field("class_type", &self.class_type)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

type Observer = Arc<dyn Fn(&SignalChange) + Send + Sync>;

enum Storage {
    Scalar(Mutex<Value>),
    Array(Mutex<Vec<SignalItem>>),
    Map(Mutex<Vec<(String, SignalItem)>>),
}

/// A reactive value cell. See module docs.
pub struct Signal {
    storage: Storage,
    pub options: SignalOptions,
    observers: Mutex<Vec<Observer>>,
}

impl Signal {
    pub fn scalar(initial: Value) -> Self {
        Self {
            storage: Storage::Scalar(Mutex::new(initial)),
            options: SignalOptions::default(),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn scalar_with_options(initial: Value, options: SignalOptions) -> Self {
        Self {
            storage: Storage::Scalar(Mutex::new(initial)),
            options,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn array(initial: Vec<SignalItem>) -> Self {
        Self {
            storage: Storage::Array(Mutex::new(initial)),
            options: SignalOptions::default(),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn array_with_options(initial: Vec<SignalItem>, options: SignalOptions) -> Self {
        Self {
            storage: Storage::Array(Mutex::new(initial)),
            options,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn map(initial: Vec<(String, SignalItem)>) -> Self {
        Self {
            storage: Storage::Map(Mutex::new(initial)),
            options: SignalOptions::default(),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn map_with_options(initial: Vec<(String, SignalItem)>, options: SignalOptions) -> Self {
        Self {
            storage: Storage::Map(Mutex::new(initial)),
            options,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Observer) {
        self.observers.lock().unwrap().push(observer);
    }

    fn emit(&self, change: SignalChange) {
        let observers = self.observers.lock().unwrap();
        for obs in observers.iter() {
            obs(&change);
        }
    }

    // --- Scalar API ---

    /// Current scalar value. Panics if this is not a scalar signal.
    pub fn get(&self) -> Value {
        match &self.storage {
            Storage::Scalar(v) => v.lock().unwrap().clone(),
            _ => panic!("get() called on a non-scalar signal"),
        }
    }

    pub fn set(&self, value: Value) {
        match &self.storage {
            Storage::Scalar(v) => {
                *v.lock().unwrap() = value.clone();
                self.emit(SignalChange::Set { value });
            }
            _ => panic!("set(value) called on a non-scalar signal"),
        }
    }

    /// Read-then-set: `update(|v| v + 1)`-style convenience.
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let current = self.get();
        let next = f(&current);
        self.set(next);
    }

    // --- Array API (spec.md §4.1 "Array diff rules") ---

    pub fn array_get(&self) -> Vec<SignalItem> {
        match &self.storage {
            Storage::Array(v) => v.lock().unwrap().clone(),
            _ => panic!("array_get() called on a non-array signal"),
        }
    }

    pub fn array_len(&self) -> usize {
        match &self.storage {
            Storage::Array(v) => v.lock().unwrap().len(),
            _ => panic!("array_len() called on a non-array signal"),
        }
    }

    fn with_array<R>(&self, f: impl FnOnce(&mut Vec<SignalItem>) -> R) -> R {
        match &self.storage {
            Storage::Array(v) => f(&mut v.lock().unwrap()),
            _ => panic!("array op called on a non-array signal"),
        }
    }

    pub fn push(&self, item: SignalItem) {
        let index = self.with_array(|a| {
            a.push(item.clone());
            a.len() - 1
        });
        self.emit(SignalChange::ArrayAdd {
            index,
            items: vec![item],
        });
    }

    pub fn unshift(&self, item: SignalItem) {
        self.with_array(|a| a.insert(0, item.clone()));
        self.emit(SignalChange::ArrayAdd {
            index: 0,
            items: vec![item],
        });
    }

    pub fn pop(&self) -> Option<SignalItem> {
        let (index, item) = self.with_array(|a| {
            let idx = a.len().checked_sub(1)?;
            Some((idx, a.pop()?))
        })?;
        self.emit(SignalChange::ArrayRemove {
            index,
            items: vec![item.clone()],
        });
        Some(item)
    }

    pub fn shift(&self) -> Option<SignalItem> {
        let item = self.with_array(|a| if a.is_empty() { None } else { Some(a.remove(0)) })?;
        self.emit(SignalChange::ArrayRemove {
            index: 0,
            items: vec![item.clone()],
        });
        Some(item)
    }

    /// `splice` with only insertions (`delete_count == 0`) → `add`.
    pub fn splice_insert(&self, index: usize, items: Vec<SignalItem>) {
        self.with_array(|a| {
            for (offset, item) in items.iter().enumerate() {
                a.insert(index + offset, item.clone());
            }
        });
        self.emit(SignalChange::ArrayAdd { index, items });
    }

    /// `splice` with only removals (no replacement items) → `remove`.
    pub fn splice_remove(&self, index: usize, delete_count: usize) -> Vec<SignalItem> {
        let removed = self.with_array(|a| {
            let end = (index + delete_count).min(a.len());
            a.drain(index..end).collect::<Vec<_>>()
        });
        self.emit(SignalChange::ArrayRemove {
            index,
            items: removed.clone(),
        });
        removed
    }

    /// `splice` that both removes and inserts, or a direct index assignment
    /// (`delete_count == items.len() == 1`) → `update`.
    pub fn splice_replace(
        &self,
        index: usize,
        delete_count: usize,
        items: Vec<SignalItem>,
    ) -> Vec<SignalItem> {
        let removed = self.with_array(|a| {
            let end = (index + delete_count).min(a.len());
            let removed = a.splice(index..end, items.iter().cloned()).collect();
            removed
        });
        self.emit(SignalChange::ArrayUpdate { index, items });
        removed
    }

    pub fn set_index(&self, index: usize, item: SignalItem) {
        self.with_array(|a| {
            if index < a.len() {
                a[index] = item.clone();
            } else {
                a.push(item.clone());
            }
        });
        self.emit(SignalChange::ArrayUpdate {
            index,
            items: vec![item],
        });
    }

    /// Whole-array replacement → `reset`.
    pub fn array_reset(&self, items: Vec<SignalItem>) {
        self.with_array(|a| *a = items.clone());
        self.emit(SignalChange::ArrayReset { items });
    }

    // --- Map/Object API ---

    pub fn map_get(&self, key: &str) -> Option<SignalItem> {
        match &self.storage {
            Storage::Map(m) => m
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            _ => panic!("map_get() called on a non-map signal"),
        }
    }

    pub fn map_entries(&self) -> Vec<(String, SignalItem)> {
        match &self.storage {
            Storage::Map(m) => m.lock().unwrap().clone(),
            _ => panic!("map_entries() called on a non-map signal"),
        }
    }

    pub fn map_set(&self, key: impl Into<String>, value: SignalItem) {
        let key = key.into();
        let is_new = match &self.storage {
            Storage::Map(m) => {
                let mut m = m.lock().unwrap();
                match m.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, existing)) => {
                        *existing = value.clone();
                        false
                    }
                    None => {
                        m.push((key.clone(), value.clone()));
                        true
                    }
                }
            }
            _ => panic!("map_set() called on a non-map signal"),
        };
        if is_new {
            self.emit(SignalChange::MapAdd { key, value });
        } else {
            self.emit(SignalChange::MapUpdate { key, value });
        }
    }

    pub fn map_remove(&self, key: &str) -> Option<SignalItem> {
        let removed = match &self.storage {
            Storage::Map(m) => {
                let mut m = m.lock().unwrap();
                let pos = m.iter().position(|(k, _)| k == key)?;
                Some(m.remove(pos).1)
            }
            _ => panic!("map_remove() called on a non-map signal"),
        }?;
        self.emit(SignalChange::MapRemove {
            key: key.to_string(),
        });
        Some(removed)
    }

    pub fn map_reset(&self, entries: Vec<(String, SignalItem)>) {
        match &self.storage {
            Storage::Map(m) => *m.lock().unwrap() = entries.clone(),
            _ => panic!("map_reset() called on a non-map signal"),
        }
        self.emit(SignalChange::MapReset { entries });
    }
}

/// Runs `f` without registering any signal reads it performs as
/// dependencies of an enclosing computation (spec.md §4.1 `untracked`).
/// `Computed` in this crate takes explicit dependency lists rather than
/// auto-tracking reads, so this is a transparent pass-through provided for
/// API parity with the source model and for callers composing their own
/// tracking layer on top of `Signal`.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// A lazily-evaluated signal derived from others. Re-evaluates on first
/// read after any dependency has changed since the last evaluation.
pub struct Computed {
    deps: Vec<Arc<Signal>>,
    recompute: Box<dyn Fn(&[Arc<Signal>]) -> Value + Send + Sync>,
    dirty: Arc<Mutex<bool>>,
    cached: Mutex<Option<Value>>,
}

impl Computed {
    /// `deps` are subscribed to mark this computed dirty; `recompute`
    /// produces the fresh value on the next `get()` from the same deps.
    pub fn new(
        deps: Vec<Arc<Signal>>,
        recompute: impl Fn(&[Arc<Signal>]) -> Value + Send + Sync + 'static,
    ) -> Self {
        let dirty = Arc::new(Mutex::new(true));
        for dep in &deps {
            let dirty = dirty.clone();
            dep.subscribe(Arc::new(move |_| {
                *dirty.lock().unwrap() = true;
            }));
        }
        Self {
            deps,
            recompute: Box::new(recompute),
            dirty,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Value {
        let mut dirty = self.dirty.lock().unwrap();
        if *dirty || self.cached.lock().unwrap().is_none() {
            let value = (self.recompute)(&self.deps);
            *self.cached.lock().unwrap() = Some(value);
            *dirty = false;
        }
        self.cached.lock().unwrap().clone().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_set_emits_change() {
        let sig = Signal::scalar(Value::from(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        sig.subscribe(Arc::new(move |change| {
            if let SignalChange::Set { value } = change {
                seen2.lock().unwrap().push(value.clone());
            }
        }));
        sig.set(Value::from(1));
        sig.update(|v| Value::from(v.as_i64().unwrap() + 1));
        assert_eq!(*seen.lock().unwrap(), vec![Value::from(1), Value::from(2)]);
        assert_eq!(sig.get(), Value::from(2));
    }

    #[test]
    fn array_push_then_pop() {
        let sig = Signal::array(vec![]);
        sig.push(SignalItem::Json(Value::from(1)));
        sig.push(SignalItem::Json(Value::from(2)));
        assert_eq!(sig.array_len(), 2);
        let popped = sig.pop().unwrap();
        assert!(matches!(popped.as_json_hint(), Some(v) if *v == Value::from(2)));
        assert_eq!(sig.array_len(), 1);
    }

    #[test]
    fn array_splice_replace_emits_update() {
        let sig = Signal::array(vec![
            SignalItem::Json(Value::from(1)),
            SignalItem::Json(Value::from(2)),
            SignalItem::Json(Value::from(3)),
        ]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        sig.subscribe(Arc::new(move |change| {
            if let SignalChange::ArrayUpdate { index, .. } = change {
                events2.lock().unwrap().push(*index);
            }
        }));
        sig.splice_replace(1, 1, vec![SignalItem::Json(Value::from(99))]);
        assert_eq!(*events.lock().unwrap(), vec![1]);
        assert!(matches!(
            sig.array_get()[1].as_json_hint(),
            Some(v) if *v == Value::from(99)
        ));
    }

    #[test]
    fn map_add_then_update_then_remove() {
        let sig = Signal::map(vec![]);
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let kinds2 = kinds.clone();
        sig.subscribe(Arc::new(move |change| {
            let label = match change {
                SignalChange::MapAdd { .. } => "add",
                SignalChange::MapUpdate { .. } => "update",
                SignalChange::MapRemove { .. } => "remove",
                _ => "other",
            };
            kinds2.lock().unwrap().push(label);
        }));
        sig.map_set("pubA", SignalItem::Json(Value::from("alice")));
        sig.map_set("pubA", SignalItem::Json(Value::from("alice2")));
        sig.map_remove("pubA");
        assert_eq!(*kinds.lock().unwrap(), vec!["add", "update", "remove"]);
        assert!(sig.map_get("pubA").is_none());
    }

    #[test]
    fn computed_recomputes_on_dependency_change() {
        let count = Arc::new(Signal::scalar(Value::from(1)));
        let doubled = Computed::new(vec![count.clone()], |deps| {
            Value::from(deps[0].get().as_i64().unwrap() * 2)
        });
        assert_eq!(doubled.get(), Value::from(2));
        count.set(Value::from(5));
        assert_eq!(doubled.get(), Value::from(10));
    }
}
