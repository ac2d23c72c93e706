//! Session lifecycle and transfer protocol (spec.md §4.4).
//!
//! A session binds a connection's private id to a user entity's public id
//! and a scalar-snapshot state bag. Transfer moves that binding from one
//! room to another via a one-shot token with a short TTL, modeled on the
//! teacher's `generate_webhook_token()` (`src/db.rs`) for token minting and
//! `RateLimiter`'s sliding-window bookkeeping (`src/rate_limit.rs`) for the
//! expiry-sweep shape reused in `world/mod.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::TRANSFER_TOKEN_TTL;
use crate::error::{EngineError, EngineResult};
use crate::persistence::PersistenceAdapter;

/// A connected user's identity and restorable state, held by the room
/// runtime for the lifetime of the connection (plus the disconnect grace
/// period).
#[derive(Debug, Clone)]
pub struct SessionData {
    pub private_id: String,
    pub public_id: String,
    /// Scalar snapshot carried across reconnects/transfers (spec.md §4.4
    /// "State restoration"); arrays/maps are not part of this bag.
    pub state: Value,
}

impl SessionData {
    pub fn new(public_id: impl Into<String>) -> Self {
        Self {
            private_id: Uuid::new_v4().to_string(),
            public_id: public_id.into(),
            state: Value::Object(serde_json::Map::new()),
        }
    }
}

/// A one-shot transfer grant issued by the source room and consumed by the
/// target room (spec.md §4.4 "Session transfer").
#[derive(Debug, Clone)]
struct TransferGrant {
    session: SessionData,
    source_room_id: String,
    target_room_id: Option<String>,
    issued_at: Instant,
}

/// The durable mirror of a [`TransferGrant`], written under `transfer:{token}`
/// (spec.md §6.3 "Persisted layout") so a transfer record survives a process
/// restart even though redemption itself is served from the in-memory map
/// (spec.md §5: the room is a single-process actor; persistence is the
/// crash-recovery path, not the hot path).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub source_room_id: String,
    pub target_room_id: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
    pub transfer_id: String,
}

fn transfer_key(token: &str) -> String {
    format!("transfer:{token}")
}

/// Tracks outstanding transfer tokens. One instance per world (tokens are
/// global, not scoped to a single room pair, since the target room may
/// differ from what the source room expected if placement changes between
/// issue and redemption).
pub struct TransferRegistry {
    grants: Mutex<HashMap<String, TransferGrant>>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// As `new`, but mirrors every grant to `transfer:{token}` in `persistence`
    /// so the catalog in spec.md §6.3 is honored and a crash between issue and
    /// redemption is recoverable (spec.md §5 "Cancellation / timeouts").
    pub fn with_persistence(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            persistence: Some(persistence),
        }
    }

    /// Issues a token for `session` leaving `source_room_id`. `target_room_id`
    /// pins the token to one destination room when known ahead of time;
    /// `None` lets any room validate it (spec.md §4.4 "transfer-user-session"
    /// request, which may not yet know the destination room).
    pub fn issue(
        &self,
        session: SessionData,
        source_room_id: impl Into<String>,
        target_room_id: Option<String>,
    ) -> String {
        let token = Uuid::new_v4().to_string();
        let source_room_id = source_room_id.into();
        let transfer_id = Uuid::new_v4().to_string();
        self.grants.lock().unwrap().insert(
            token.clone(),
            TransferGrant {
                session,
                source_room_id: source_room_id.clone(),
                target_room_id: target_room_id.clone(),
                issued_at: Instant::now(),
            },
        );
        if let Some(persistence) = &self.persistence {
            let metadata = TransferMetadata {
                source_room_id,
                target_room_id,
                timestamp: Utc::now(),
                transfer_id,
            };
            if let Ok(value) = serde_json::to_value(&metadata) {
                let _ = persistence.put(&transfer_key(&token), &value);
            }
        }
        token
    }

    /// Validates a token without consuming it, for a target room to preview
    /// the session before accepting the connection (spec.md §4.4
    /// "validateTransferToken").
    pub fn validate(&self, token: &str, target_room_id: &str) -> EngineResult<SessionData> {
        let grants = self.grants.lock().unwrap();
        let grant = grants
            .get(token)
            .ok_or_else(|| EngineError::NotFound("unknown transfer token".into()))?;
        self.check_grant(grant, target_room_id)?;
        Ok(grant.session.clone())
    }

    /// Validates and consumes the token, returning the session to adopt.
    /// Tokens are single-use: a second redemption attempt fails with
    /// `NotFound` (spec.md §4.4 "one-shot").
    pub fn complete(&self, token: &str, target_room_id: &str) -> EngineResult<SessionData> {
        let mut grants = self.grants.lock().unwrap();
        let grant = grants
            .get(token)
            .ok_or_else(|| EngineError::NotFound("unknown transfer token".into()))?;
        self.check_grant(grant, target_room_id)?;
        let grant = grants.remove(token).expect("checked above");
        drop(grants);
        if let Some(persistence) = &self.persistence {
            let _ = persistence.delete(&transfer_key(token));
        }
        Ok(grant.session)
    }

    fn check_grant(&self, grant: &TransferGrant, target_room_id: &str) -> EngineResult<()> {
        if grant.issued_at.elapsed() > TRANSFER_TOKEN_TTL {
            return Err(EngineError::Expired("transfer token expired".into()));
        }
        if let Some(expected) = &grant.target_room_id
            && expected != target_room_id
        {
            return Err(EngineError::Authorization(
                "transfer token not valid for this room".into(),
            ));
        }
        Ok(())
    }

    /// Drops tokens older than `ttl`, called from the same periodic sweep
    /// that reaps inactive shards (spec.md §4.5 heartbeat sweep). Returns
    /// the number of tokens removed, for logging.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let mut grants = self.grants.lock().unwrap();
        let mut expired_tokens = Vec::new();
        grants.retain(|token, grant| {
            let alive = grant.issued_at.elapsed() <= ttl;
            if !alive {
                expired_tokens.push(token.clone());
            }
            alive
        });
        let removed = expired_tokens.len();
        drop(grants);
        if let Some(persistence) = &self.persistence {
            for token in &expired_tokens {
                let _ = persistence.delete(&transfer_key(token));
            }
        }
        removed
    }

    /// Which room issued `token`, used by the world to route a
    /// `transfer-room-state` request to the correct source without
    /// consuming the grant.
    pub fn source_room_of(&self, token: &str) -> Option<String> {
        self.grants
            .lock()
            .unwrap()
            .get(token)
            .map(|g| g.source_room_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates_then_completes_once() {
        let registry = TransferRegistry::new();
        let session = SessionData::new("pubA");
        let token = registry.issue(session.clone(), "room1", Some("room2".to_string()));

        let previewed = registry.validate(&token, "room2").unwrap();
        assert_eq!(previewed.public_id, "pubA");

        let adopted = registry.complete(&token, "room2").unwrap();
        assert_eq!(adopted.public_id, "pubA");

        let err = registry.complete(&token, "room2").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn token_pinned_to_wrong_target_room_is_rejected() {
        let registry = TransferRegistry::new();
        let token = registry.issue(SessionData::new("pubA"), "room1", Some("room2".to_string()));
        let err = registry.complete(&token, "room3").unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
    }

    #[test]
    fn sweep_expired_removes_only_stale_grants() {
        let registry = TransferRegistry::new();
        registry.issue(SessionData::new("pubA"), "room1", None);
        let removed = registry.sweep_expired(Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert_eq!(registry.sweep_expired(Duration::from_secs(0)), 0);
    }

    #[test]
    fn completing_a_transfer_removes_its_persisted_record() {
        use crate::persistence::InMemoryAdapter;

        let persistence = Arc::new(InMemoryAdapter::new());
        let registry = TransferRegistry::with_persistence(persistence.clone());
        let token = registry.issue(SessionData::new("pubA"), "room1", Some("room2".to_string()));
        assert!(persistence.get(&transfer_key(&token)).unwrap().is_some());

        registry.complete(&token, "room2").unwrap();
        assert!(persistence.get(&transfer_key(&token)).unwrap().is_none());
    }
}
