//! C2: cross-replica fan-out of state-changed notifications and per-session
//! client traffic.
//!
//! Delivery is best-effort, at-most-once (a lagging subscriber drops the
//! oldest messages rather than blocking the publisher — the same semantics
//! `tokio::sync::broadcast` gives us and the same tradeoff the teacher's
//! subscription manager makes: the State Store stays authoritative, so a
//! dropped notification is recoverable by re-reading, never a correctness
//! bug). Within a single session, receivers must reject anything whose
//! `version` doesn't strictly exceed the last one they acted on — that
//! ordering filter lives in `VersionGate`, not here, since "last seen" is
//! per-subscriber state.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type SessionId = Uuid;

const STATE_CHANGED_CAPACITY: usize = 4096;
const SESSION_TRAFFIC_CAPACITY: usize = 256;

/// A change to session state, published whenever a write or delete is
/// accepted by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub session_id: SessionId,
    pub version: u64,
    pub kind: StateChangedKind,
    pub server_ts: common::types::Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateChangedKind {
    Updated(serde_json::Value),
    Deleted,
}

/// Server-pushed message to a specific session's attached clients that
/// isn't a whole-state update (e.g. a reconnection acknowledgement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTraffic {
    pub session_id: SessionId,
    pub payload: serde_json::Value,
}

/// Rejects messages that don't strictly advance a session's version,
/// suppressing stale/reordered deliveries from other replicas.
#[derive(Default)]
pub struct VersionGate {
    last_seen: DashMap<SessionId, u64>,
}

impl VersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `version` is newer than the last one admitted for
    /// `session_id`, and records it as the new high-water mark.
    pub fn admit(&self, session_id: SessionId, version: u64) -> bool {
        match self.last_seen.entry(session_id) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if version > *e.get() {
                    e.insert(version);
                    true
                } else {
                    false
                }
            },
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(version);
                true
            },
        }
    }

    pub fn forget(&self, session_id: SessionId) {
        self.last_seen.remove(&session_id);
    }
}

/// The fan-out bus: one global `state-changed` topic, plus one
/// `session-traffic` topic per session, created lazily and torn down once
/// the last subscriber drops.
#[derive(Clone)]
pub struct FanoutBus {
    state_changed_tx: broadcast::Sender<StateChanged>,
    session_traffic: Arc<DashMap<SessionId, broadcast::Sender<SessionTraffic>>>,
}

impl Default for FanoutBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutBus {
    pub fn new() -> Self {
        let (state_changed_tx, _) = broadcast::channel(STATE_CHANGED_CAPACITY);
        Self {
            state_changed_tx,
            session_traffic: Arc::new(DashMap::new()),
        }
    }

    pub fn publish_state_changed(&self, msg: StateChanged) {
        // No subscribers is routine (e.g. no replica currently has a
        // connection for this session) — not an error.
        let _ = self.state_changed_tx.send(msg);
    }

    pub fn subscribe_state_changed(&self) -> broadcast::Receiver<StateChanged> {
        self.state_changed_tx.subscribe()
    }

    pub fn publish_session_traffic(&self, session_id: SessionId, payload: serde_json::Value) {
        if let Some(tx) = self.session_traffic.get(&session_id) {
            let _ = tx.send(SessionTraffic { session_id, payload });
        }
    }

    /// Subscribe to a session's targeted traffic, creating its topic on
    /// first use.
    pub fn subscribe_session_traffic(
        &self,
        session_id: SessionId,
    ) -> broadcast::Receiver<SessionTraffic> {
        self.session_traffic
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(SESSION_TRAFFIC_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate_rejects_non_increasing_versions() {
        let gate = VersionGate::new();
        let id = Uuid::new_v4();
        assert!(gate.admit(id, 1));
        assert!(gate.admit(id, 2));
        assert!(!gate.admit(id, 2));
        assert!(!gate.admit(id, 1));
        assert!(gate.admit(id, 3));
    }

    #[tokio::test]
    async fn state_changed_reaches_all_subscribers() {
        let bus = FanoutBus::new();
        let mut a = bus.subscribe_state_changed();
        let mut b = bus.subscribe_state_changed();
        let id = Uuid::new_v4();
        bus.publish_state_changed(StateChanged {
            session_id: id,
            version: 1,
            kind: StateChangedKind::Deleted,
            server_ts: common::types::Timestamp::now(),
        });
        assert_eq!(a.recv().await.unwrap().session_id, id);
        assert_eq!(b.recv().await.unwrap().session_id, id);
    }

    #[tokio::test]
    async fn session_traffic_is_scoped_per_session() {
        let bus = FanoutBus::new();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let mut sub_a = bus.subscribe_session_traffic(id_a);
        let _sub_b = bus.subscribe_session_traffic(id_b);
        bus.publish_session_traffic(id_a, serde_json::json!({"ping": true}));
        let msg = sub_a.recv().await.unwrap();
        assert_eq!(msg.session_id, id_a);
    }
}
