//! Room runtime (spec.md §4.4): connection lifecycle, action dispatch,
//! request dispatch, and disconnection/cleanup.
//!
//! A room is a single cooperative actor: every dispatch path acquires
//! `dispatch_lock` before touching the entity tree, so mutations are
//! serialized without needing a dedicated OS thread per room (spec.md §5
//! "Concurrency & Resource Model"). This mirrors the teacher's
//! `Db { conn: Mutex<Connection> }` pattern of serializing through one lock
//! rather than an actor mailbox, generalized here to an async mutex so a
//! handler can `.await` without blocking the runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::entity::{Entity, EntityRegistry};
use crate::error::{EngineError, EngineResult};
use crate::persistence::PersistenceAdapter;
use crate::session::{SessionData, TransferRegistry};
use crate::signal::SignalItem;
use crate::sync::SyncEngine;
use crate::transport::{Frame, RoomBus};

type ActionHandler = Box<dyn Fn(&RoomContext, &SessionData, Value) -> EngineResult<()> + Send + Sync>;
/// A per-action guard (spec.md §4.3.2 step 4): run in declaration order
/// against `(session, action name, payload)` after the action is looked up
/// but before its schema/handler; any failure aborts dispatch.
pub type ActionGuard = Box<dyn Fn(&SessionData, &str, &Value) -> EngineResult<()> + Send + Sync>;
type LifecycleHook = Box<dyn Fn(&RoomContext, &SessionData) + Send + Sync>;
type RequestHandler =
    Box<dyn Fn(&RoomContext, &HashMap<String, String>, Value) -> EngineResult<Value> + Send + Sync>;
/// Per-recipient outbound filter (spec.md §4.3.5 "Packet interceptor"):
/// given the frame about to be sent to `session`, return the (possibly
/// modified) frame to deliver, or `None` to withhold it from that
/// recipient only.
pub type PacketInterceptor = Arc<dyn Fn(&SessionData, &Frame) -> Option<Frame> + Send + Sync>;

/// An action's declared payload shape (spec.md §4.3.2 step 5): the set of
/// top-level keys a valid payload must carry. An action with no schema
/// accepts any JSON value.
#[derive(Default)]
pub struct ActionSchema {
    pub required_fields: Vec<&'static str>,
}

impl ActionSchema {
    pub fn new(required_fields: Vec<&'static str>) -> Self {
        Self { required_fields }
    }

    /// `true` if `value` is an object carrying every required field.
    pub fn validate(&self, value: &Value) -> bool {
        let Value::Object(map) = value else {
            return false;
        };
        self.required_fields.iter().all(|field| map.contains_key(*field))
    }
}

/// What a registered action carries: its handler, its own ordered guard
/// list, and an optional schema checked just before the handler runs
/// (spec.md §9 "each action is added to a typed registry keyed by action
/// name, storing handler reference, optional validator, and ordered guard
/// list").
type ActionEntry = (ActionHandler, Vec<ActionGuard>, Option<ActionSchema>);

/// Inputs available to a connect guard and to `accept()`: headers/query
/// params from the handshake, plus an optional reconnect/transfer token
/// (spec.md §4.4 "Connection guards").
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub private_id: Option<String>,
    pub transfer_token: Option<String>,
}

/// What `accept()` hands back to the caller once a connection is admitted:
/// the session to remember and the initial full-state payload to send
/// before subscribing to the room's broadcast bus.
pub struct AcceptedConnection {
    pub session: SessionData,
    pub initial_snapshot: Value,
}

/// Read-only view of room internals passed into handlers/hooks so they can
/// read/mutate entity signals without holding the whole `RoomRuntime`.
pub struct RoomContext<'a> {
    pub room_id: &'a str,
    pub root: &'a Arc<Entity>,
    pub registry: &'a EntityRegistry,
    pub sync_engine: &'a Arc<SyncEngine>,
    pub bus: &'a Arc<RoomBus>,
}

pub struct RoomRuntime {
    room_id: String,
    config: RoomConfig,
    root: Arc<Entity>,
    registry: EntityRegistry,
    sync_engine: Arc<SyncEngine>,
    bus: Arc<RoomBus>,
    persistence: Arc<dyn PersistenceAdapter>,
    sessions: Mutex<HashMap<String, SessionData>>,
    dispatch_lock: tokio::sync::Mutex<()>,
    actions: Mutex<HashMap<String, ActionEntry>>,
    requests: Mutex<HashMap<(&'static str, String), RequestHandler>>,
    on_join: Mutex<Option<LifecycleHook>>,
    on_leave: Mutex<Option<LifecycleHook>>,
    packet_interceptor: Mutex<Option<PacketInterceptor>>,
    pending_disconnects: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RoomRuntime {
    pub fn new(
        room_id: impl Into<String>,
        config: RoomConfig,
        root_schema: Arc<crate::entity::SchemaDescriptor>,
        registry: EntityRegistry,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Arc<Self> {
        let root = Arc::new(Entity::new(root_schema));
        root.set_path(String::new());
        let sync_engine = SyncEngine::new(
            config.throttle_sync_duration(),
            config.throttle_storage_duration(),
            persistence.clone(),
        );
        let bus = Arc::new(RoomBus::new());
        let room = Arc::new(Self {
            room_id: room_id.into(),
            config,
            root,
            registry,
            sync_engine,
            bus,
            persistence,
            sessions: Mutex::new(HashMap::new()),
            dispatch_lock: tokio::sync::Mutex::new(()),
            actions: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            on_join: Mutex::new(None),
            on_leave: Mutex::new(None),
            packet_interceptor: Mutex::new(None),
            pending_disconnects: Mutex::new(HashMap::new()),
        });
        room.sync_engine.install(&room.root, &room.registry);
        let bus = room.bus.clone();
        room.sync_engine.set_on_sync(Arc::new(move |fragment| {
            bus.broadcast(Frame::new("sync", fragment));
        }));
        room
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<RoomBus> {
        &self.bus
    }

    pub fn active_connections(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn context(&self) -> RoomContext<'_> {
        RoomContext {
            room_id: &self.room_id,
            root: &self.root,
            registry: &self.registry,
            sync_engine: &self.sync_engine,
            bus: &self.bus,
        }
    }

    /// Registers an action's handler alongside its own ordered guard list
    /// and optional payload schema (spec.md §4.3.2 steps 4-5). Room-level
    /// connect guards live on `RoomConfig.guards` instead — they run once,
    /// at accept time, not per action.
    pub fn on_action(
        &self,
        name: impl Into<String>,
        guards: Vec<ActionGuard>,
        schema: Option<ActionSchema>,
        handler: ActionHandler,
    ) {
        self.actions.lock().unwrap().insert(name.into(), (handler, guards, schema));
    }

    pub fn on_request(&self, method: &'static str, path_template: impl Into<String>, handler: RequestHandler) {
        self.requests
            .lock()
            .unwrap()
            .insert((method, path_template.into()), handler);
    }

    pub fn set_on_join(&self, hook: LifecycleHook) {
        *self.on_join.lock().unwrap() = Some(hook);
    }

    pub fn set_on_leave(&self, hook: LifecycleHook) {
        *self.on_leave.lock().unwrap() = Some(hook);
    }

    /// Installs the per-recipient outbound filter applied to every frame
    /// this room broadcasts before it reaches a given connection's stream
    /// (spec.md §4.3.5).
    pub fn set_packet_interceptor(&self, interceptor: PacketInterceptor) {
        *self.packet_interceptor.lock().unwrap() = Some(interceptor);
    }

    /// Builds the filter `SseConnection::with_filter` wants, closing over
    /// `session` so the interceptor sees which recipient each frame is
    /// about to reach. Returns `None` if no interceptor is set, so callers
    /// can skip `with_filter` entirely on the common path.
    pub fn outbound_filter_for(
        &self,
        session: SessionData,
    ) -> Option<Arc<dyn Fn(&Frame) -> Option<Frame> + Send + Sync>> {
        let interceptor = self.packet_interceptor.lock().unwrap().clone()?;
        Some(Arc::new(move |frame: &Frame| interceptor(&session, frame)))
    }

    /// Admits a new connection: runs the connect guard, resolves or creates
    /// the session (honoring a reconnect `private_id` or transfer token),
    /// instantiates the user entity on first join, fires `onJoin`, and
    /// returns the full-state snapshot the caller sends before attaching
    /// the connection to the room bus (spec.md §4.4 "Connection lifecycle").
    pub async fn accept(
        self: &Arc<Self>,
        ctx: ConnectContext,
        transfers: &TransferRegistry,
    ) -> EngineResult<AcceptedConnection> {
        for guard in &self.config.guards {
            guard(&ctx)?;
        }

        let _permit = self.dispatch_lock.lock().await;

        let session = if let Some(token) = &ctx.transfer_token {
            let incoming = transfers.complete(token, &self.room_id)?;
            self.adopt_session(incoming)
        } else if let Some(private_id) = &ctx.private_id {
            let existing = self.sessions.lock().unwrap().get(private_id).cloned();
            let session = match existing {
                Some(session) => session,
                // Reconnecting against a fresh process (this room instance
                // just started, or a process restart) with no in-memory
                // record: fall back to the persisted `session:{privateId}`
                // mirror before giving up (spec.md §6.3, §8 "Session
                // identity").
                None => self
                    .load_session_from_kv(private_id)
                    .ok_or_else(|| EngineError::NotFound("no session for private id".into()))?,
            };
            self.adopt_session(session)
        } else {
            let public_id = uuid::Uuid::new_v4().to_string();
            self.adopt_session(SessionData::new(public_id))
        };

        if let Some(handle) = self.pending_disconnects.lock().unwrap().remove(&session.private_id) {
            handle.abort();
        }

        self.ensure_user_entity(&session);

        if let Some(hook) = self.on_join.lock().unwrap().as_ref() {
            hook(&self.context(), &session);
        }

        Ok(AcceptedConnection {
            session,
            initial_snapshot: self.sync_engine.full_snapshot(),
        })
    }

    fn adopt_session(&self, session: SessionData) -> SessionData {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.private_id.clone(), session.clone());
        self.persist_session(&session);
        session
    }

    /// Writes the `session:{privateId}` mirror (spec.md §6.3), keeping the
    /// invariant in spec.md §4.1 ("A session exists ⇔ a `session:{privateId}`
    /// record exists in persistence") honored for every adopted session.
    fn persist_session(&self, session: &SessionData) {
        let record = serde_json::json!({
            "publicId": session.public_id,
            "state": session.state,
        });
        let _ = self
            .persistence
            .put(&session_key(&session.private_id), &record);
    }

    fn delete_session(&self, private_id: &str) {
        let _ = self.persistence.delete(&session_key(private_id));
    }

    /// Falls back to the persisted mirror when `privateId` isn't held in
    /// this process's in-memory map (spec.md §4.3.1 step 4: "look up
    /// `session:{privateId}`").
    fn load_session_from_kv(&self, private_id: &str) -> Option<SessionData> {
        let record = self.persistence.get(&session_key(private_id)).ok().flatten()?;
        let public_id = record.get("publicId")?.as_str()?.to_string();
        let state = record.get("state").cloned().unwrap_or(Value::Object(serde_json::Map::new()));
        Some(SessionData {
            private_id: private_id.to_string(),
            public_id,
            state,
        })
    }

    fn ensure_user_entity(&self, session: &SessionData) {
        let Some(users_field) = self.root.schema.users_field() else {
            return;
        };
        let Some(users_signal) = self.root.field(users_field.name) else {
            return;
        };
        if users_signal.map_get(&session.public_id).is_some() {
            if let Some(SignalItem::Entity(entity)) = users_signal.map_get(&session.public_id) {
                if let Some(connected) = self.root.schema.connected_field() {
                    if let Some(signal) = entity.field(connected.name) {
                        signal.set(Value::Bool(true));
                    }
                }
            }
            return;
        }
        let crate::entity::FieldRole::Users { class_type } = &users_field.role else {
            return;
        };
        let Some(entity) = self.registry.instantiate(class_type) else {
            return;
        };
        entity.restore_scalars(&session.state);
        if let Some(connected) = self.root.schema.connected_field() {
            if let Some(signal) = entity.field(connected.name) {
                signal.set(Value::Bool(true));
            }
        }
        users_signal.map_set(session.public_id.clone(), crate::entity::entity_item(entity));
    }

    /// Dispatches a client action: guards, then the registered handler,
    /// under the single dispatch lock (spec.md §4.4 "Action dispatch").
    /// Auto sync/persist happen implicitly through signals the handler
    /// writes; no separate flush call is needed here.
    pub async fn dispatch_action(
        &self,
        private_id: &str,
        action: &str,
        payload: Value,
    ) -> EngineResult<()> {
        let _permit = self.dispatch_lock.lock().await;
        let session = self
            .sessions
            .lock()
            .unwrap()
            .get(private_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound("no session for private id".into()))?;

        let actions = self.actions.lock().unwrap();
        let (handler, guards, schema) = actions
            .get(action)
            .ok_or_else(|| EngineError::NotFound(format!("no handler for action {action}")))?;

        for guard in guards {
            guard(&session, action, &payload)?;
        }
        if let Some(schema) = schema
            && !schema.validate(&payload)
        {
            return Err(EngineError::Validation(format!(
                "payload for action {action} failed schema validation"
            )));
        }
        handler(&self.context(), &session, payload)
    }

    /// Dispatches an HTTP-style request against a registered path template
    /// (spec.md §4.4 "Request dispatch"). Templates use `{name}` segments;
    /// matching is exact-length, left-to-right.
    pub async fn dispatch_request(
        &self,
        method: &'static str,
        path: &str,
        body: Value,
    ) -> EngineResult<Value> {
        let _permit = self.dispatch_lock.lock().await;
        let requests = self.requests.lock().unwrap();
        for ((m, template), handler) in requests.iter() {
            if *m != method {
                continue;
            }
            if let Some(params) = match_template(template, path) {
                return handler(&self.context(), &params, body);
            }
        }
        Err(EngineError::NotFound(format!("no route for {method} {path}")))
    }

    /// Marks a connection offline and schedules cleanup after the
    /// configured grace period (`0` means immediate). Reconnecting within
    /// the grace period cancels the pending cleanup (see `accept`).
    pub fn disconnect(self: &Arc<Self>, private_id: &str) {
        let Some(mut session) = self.sessions.lock().unwrap().get(private_id).cloned() else {
            return;
        };
        self.set_connected(&session, false);

        // Persist {publicId, state: snapshot(user)} back to session:{privateId}
        // so a reconnect, even across a process restart during the grace
        // period, restores what the user last had (spec.md §4.3.4 step 2).
        if let Some(users_field) = self.root.schema.users_field() {
            if let Some(users_signal) = self.root.field(users_field.name) {
                if let Some(SignalItem::Entity(entity)) = users_signal.map_get(&session.public_id) {
                    session.state = entity.scalar_snapshot();
                    self.sessions
                        .lock()
                        .unwrap()
                        .insert(session.private_id.clone(), session.clone());
                }
            }
        }
        self.persist_session(&session);

        self.bus.broadcast(Frame::new(
            "presence",
            serde_json::json!({ "publicId": session.public_id, "status": "offline" }),
        ));

        if self.config.session_expiry_time == 0 {
            self.finalize_disconnect(&session);
            return;
        }

        let room = self.clone();
        let private_id = private_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(room.config.session_expiry_time)).await;
            if let Some(session) = room.sessions.lock().unwrap().get(&private_id).cloned() {
                room.finalize_disconnect(&session);
            }
            room.pending_disconnects.lock().unwrap().remove(&private_id);
        });
        self.pending_disconnects
            .lock()
            .unwrap()
            .insert(private_id.to_string(), handle);
    }

    fn set_connected(&self, session: &SessionData, connected: bool) {
        let Some(users_field) = self.root.schema.users_field() else {
            return;
        };
        let Some(users_signal) = self.root.field(users_field.name) else {
            return;
        };
        if let Some(SignalItem::Entity(entity)) = users_signal.map_get(&session.public_id) {
            if let Some(connected_field) = self.root.schema.connected_field() {
                if let Some(signal) = entity.field(connected_field.name) {
                    signal.set(Value::Bool(connected));
                }
            }
        }
    }

    fn finalize_disconnect(&self, session: &SessionData) {
        self.sessions.lock().unwrap().remove(&session.private_id);
        if let Some(users_field) = self.root.schema.users_field() {
            if let Some(users_signal) = self.root.field(users_field.name) {
                users_signal.map_remove(&session.public_id);
            }
        }
        if let Some(hook) = self.on_leave.lock().unwrap().as_ref() {
            hook(&self.context(), session);
        }
        self.delete_session(&session.private_id);
        self.bus.broadcast(Frame::new(
            "presence",
            serde_json::json!({ "publicId": session.public_id, "status": "left" }),
        ));
    }

    /// Builds a transfer grant for `private_id`'s current session and
    /// removes it from this room (spec.md §4.4 "prepareSessionTransfer").
    /// The grace-period path is skipped: a deliberate transfer is not a
    /// disconnect.
    pub fn prepare_session_transfer(
        &self,
        private_id: &str,
        target_room_id: Option<String>,
        transfers: &TransferRegistry,
    ) -> EngineResult<String> {
        let mut session = self
            .sessions
            .lock()
            .unwrap()
            .remove(private_id)
            .ok_or_else(|| EngineError::NotFound("no session for private id".into()))?;

        if let Some(users_field) = self.root.schema.users_field() {
            if let Some(users_signal) = self.root.field(users_field.name) {
                if let Some(SignalItem::Entity(entity)) = users_signal.map_remove(&session.public_id) {
                    session.state = entity.scalar_snapshot();
                }
            }
        }
        self.delete_session(private_id);

        Ok(transfers.issue(session, self.room_id.clone(), target_room_id))
    }
}

fn session_key(private_id: &str) -> String {
    format!("session:{private_id}")
}

fn match_template(template: &str, path: &str) -> Option<HashMap<String, String>> {
    let template_parts: Vec<&str> = template.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if template_parts.len() != path_parts.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (t, p) in template_parts.iter().zip(path_parts.iter()) {
        if let Some(name) = t.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            params.insert(name.to_string(), p.to_string());
        } else if t != p {
            return None;
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FieldDescriptor, FieldKind, FieldOptionsTemplate, FieldRole, SchemaDescriptor};
    use crate::persistence::InMemoryAdapter;

    fn lobby_schema() -> Arc<SchemaDescriptor> {
        Arc::new(SchemaDescriptor {
            class_name: "Lobby",
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
                    role: FieldRole::Users { class_type: "Player" },
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
                    name: "connected",
                    kind: FieldKind::Scalar,
                    role: FieldRole::Connected,
                    options: FieldOptionsTemplate::default(),
                },
                FieldDescriptor {
                    name: "score",
                    kind: FieldKind::Scalar,
                    role: FieldRole::Plain,
                    options: FieldOptionsTemplate::default(),
                },
            ],
        })
    }

    fn make_room() -> Arc<RoomRuntime> {
        make_room_with_persistence(Arc::new(InMemoryAdapter::new()))
    }

    fn make_room_with_persistence(persistence: Arc<dyn PersistenceAdapter>) -> Arc<RoomRuntime> {
        let mut registry = EntityRegistry::new();
        registry.register("Player", Arc::new(|| Entity::new(player_schema())));
        RoomRuntime::new("room1", RoomConfig::default(), lobby_schema(), registry, persistence)
    }

    #[tokio::test]
    async fn accept_creates_session_and_user_entity() {
        let room = make_room();
        let transfers = TransferRegistry::new();
        let accepted = room.accept(ConnectContext::default(), &transfers).await.unwrap();
        assert_eq!(room.active_connections(), 1);
        assert_eq!(
            accepted.initial_snapshot["users"][&accepted.session.public_id]["connected"],
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn dispatch_action_invokes_registered_handler() {
        let room = make_room();
        room.on_action(
            "increment",
            Vec::new(),
            None,
            Box::new(|ctx, _session, _payload| {
                ctx.root.field("count").unwrap().update(|v| {
                    Value::from(v.as_i64().unwrap_or(0) + 1)
                });
                Ok(())
            }),
        );
        let transfers = TransferRegistry::new();
        let accepted = room.accept(ConnectContext::default(), &transfers).await.unwrap();
        room.dispatch_action(&accepted.session.private_id, "increment", Value::Null)
            .await
            .unwrap();
        assert_eq!(room.root.field("count").unwrap().get(), Value::from(1));
    }

    #[tokio::test]
    async fn room_level_connect_guards_run_in_order_and_any_failure_rejects() {
        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let calls_a = calls.clone();
        let calls_b = calls.clone();
        let mut config = RoomConfig::default();
        config.guards = vec![
            Arc::new(move |_ctx: &ConnectContext| {
                calls_a.lock().unwrap().push("first");
                Ok(())
            }),
            Arc::new(move |_ctx: &ConnectContext| {
                calls_b.lock().unwrap().push("second");
                Err(EngineError::Authorization("not allowed".into()))
            }),
        ];
        let mut registry = EntityRegistry::new();
        registry.register("Player", Arc::new(|| Entity::new(player_schema())));
        let room = RoomRuntime::new("room1", config, lobby_schema(), registry, Arc::new(InMemoryAdapter::new()));

        let transfers = TransferRegistry::new();
        let err = room.accept(ConnectContext::default(), &transfers).await.unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(room.active_connections(), 0);
    }

    #[tokio::test]
    async fn action_guard_failure_blocks_the_handler() {
        let room = make_room();
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked2 = invoked.clone();
        room.on_action(
            "kick",
            vec![Box::new(|_session, _action, _payload| {
                Err(EngineError::Authorization("no permission".into()))
            })],
            None,
            Box::new(move |_ctx, _session, _payload| {
                invoked2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        );
        let transfers = TransferRegistry::new();
        let accepted = room.accept(ConnectContext::default(), &transfers).await.unwrap();
        let err = room
            .dispatch_action(&accepted.session.private_id, "kick", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn action_schema_rejects_payloads_missing_required_fields() {
        let room = make_room();
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked2 = invoked.clone();
        room.on_action(
            "setName",
            Vec::new(),
            Some(ActionSchema::new(vec!["name"])),
            Box::new(move |_ctx, _session, _payload| {
                invoked2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        );
        let transfers = TransferRegistry::new();
        let accepted = room.accept(ConnectContext::default(), &transfers).await.unwrap();

        let err = room
            .dispatch_action(&accepted.session.private_id, "setName", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));

        room.dispatch_action(
            &accepted.session.private_id,
            "setName",
            serde_json::json!({ "name": "alice" }),
        )
        .await
        .unwrap();
        assert!(invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnect_with_zero_grace_removes_session_immediately() {
        let room = make_room();
        let transfers = TransferRegistry::new();
        let accepted = room.accept(ConnectContext::default(), &transfers).await.unwrap();
        room.disconnect(&accepted.session.private_id);
        assert_eq!(room.active_connections(), 0);
    }

    #[tokio::test]
    async fn transfer_removes_from_source_and_adopts_in_target() {
        let source = make_room();
        let transfers = TransferRegistry::new();
        let accepted = source.accept(ConnectContext::default(), &transfers).await.unwrap();
        source
            .root
            .field("users")
            .unwrap()
            .map_get(&accepted.session.public_id)
            .map(|item| {
                if let SignalItem::Entity(entity) = item {
                    entity.field("score").unwrap().set(Value::from(7));
                }
            });

        let token = source
            .prepare_session_transfer(&accepted.session.private_id, Some("room2".to_string()), &transfers)
            .unwrap();
        assert_eq!(source.active_connections(), 0);

        let target = make_room();
        let mut ctx = ConnectContext::default();
        ctx.transfer_token = Some(token);
        let accepted_target = target.accept(ctx, &transfers).await.unwrap();
        assert_eq!(accepted_target.session.public_id, accepted.session.public_id);
    }

    #[tokio::test]
    async fn reconnect_within_grace_period_restores_scalar_state() {
        let mut config = RoomConfig::default();
        config.session_expiry_time = 60_000;
        let mut registry = EntityRegistry::new();
        registry.register("Player", Arc::new(|| Entity::new(player_schema())));
        let persistence = Arc::new(InMemoryAdapter::new());
        let room = RoomRuntime::new("room1", config, lobby_schema(), registry, persistence);

        let transfers = TransferRegistry::new();
        let accepted = room.accept(ConnectContext::default(), &transfers).await.unwrap();
        let private_id = accepted.session.private_id.clone();
        let public_id = accepted.session.public_id.clone();

        if let Some(SignalItem::Entity(entity)) = room.root.field("users").unwrap().map_get(&public_id) {
            entity.field("score").unwrap().set(Value::from(42));
        }

        room.disconnect(&private_id);
        assert_eq!(room.active_connections(), 1, "grace period keeps the session alive");

        let mut ctx = ConnectContext::default();
        ctx.private_id = Some(private_id.clone());
        let reconnected = room.accept(ctx, &transfers).await.unwrap();
        assert_eq!(reconnected.session.public_id, public_id);
        assert_eq!(
            reconnected.initial_snapshot["users"][&public_id]["score"],
            Value::from(42)
        );
    }

    #[tokio::test]
    async fn session_survives_across_a_fresh_room_instance_via_kv_fallback() {
        let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryAdapter::new());
        let room_a = make_room_with_persistence(persistence.clone());
        let transfers = TransferRegistry::new();
        let accepted = room_a.accept(ConnectContext::default(), &transfers).await.unwrap();
        let private_id = accepted.session.private_id.clone();

        // Simulate a process restart: a brand new `RoomRuntime` sharing only
        // the persisted KV, with no in-memory session of its own.
        let room_b = make_room_with_persistence(persistence);
        let mut ctx = ConnectContext::default();
        ctx.private_id = Some(private_id.clone());
        let reconnected = room_b.accept(ctx, &transfers).await.unwrap();
        assert_eq!(reconnected.session.public_id, accepted.session.public_id);
    }

    #[test]
    fn match_template_extracts_named_params() {
        let params = match_template("/rooms/{id}/kick/{user}", "/rooms/abc/kick/u1").unwrap();
        assert_eq!(params.get("id").unwrap(), "abc");
        assert_eq!(params.get("user").unwrap(), "u1");
        assert!(match_template("/rooms/{id}", "/rooms/abc/extra").is_none());
    }
}
