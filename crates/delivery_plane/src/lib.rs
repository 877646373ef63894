//! C5: per-replica registry of long-lived client connections, and the
//! per-connection event loop that keeps each one's view of a session
//! current. Message types are wire-neutral `serde`-tagged enums; the only
//! place that touches an actual socket is the composition root's transport
//! adapter, which drains `outbound_rx`/feeds `inbound_tx` for a real
//! connection.
//!
//! Grounded on the sync worker's event loop shape: one `select_biased!`
//! per connection task, over inbound client messages, a subscription feed,
//! and a timer — `crates/sync/src/worker.rs`'s `SyncWorker::go`.

use std::sync::Arc;

use common::{
    runtime::Runtime,
    shutdown::ShutdownMessage,
};
use dashmap::DashMap;
use fanout_bus::{
    FanoutBus,
    StateChangedKind,
    VersionGate,
};
use futures::{
    select_biased,
    FutureExt,
};
use serde::{
    Deserialize,
    Serialize,
};
use sync_engine::{
    Session,
    SessionId,
    SyncEngine,
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    info,
    warn,
};
use uuid::Uuid;

mod metrics_impl;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { server_ts: common::types::Timestamp },
    StateUpdate { state: Session },
    StateSync { state: Session },
    SessionDeleted,
    Pong,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    RequestSync,
}

/// Local, per-replica map from session id to its attached connections. The
/// only mutation points are connect/disconnect; broadcast reads it, so it
/// must be a concurrency-safe map (spec.md §5's "shared resources").
#[derive(Default)]
pub struct ConnectionRegistry {
    by_session: DashMap<SessionId, DashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.by_session
            .entry(session_id)
            .or_default()
            .insert(connection_id, tx);
        metrics::log_gauge(&metrics_impl::DELIVERY_PLANE_CONNECTIONS, self.total_connections() as f64);
    }

    fn unregister(&self, session_id: SessionId, connection_id: ConnectionId) {
        if let Some(conns) = self.by_session.get(&session_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                drop(conns);
                self.by_session.remove(&session_id);
            }
        }
        metrics::log_gauge(&metrics_impl::DELIVERY_PLANE_CONNECTIONS, self.total_connections() as f64);
    }

    /// Push `message` to every connection currently attached to
    /// `session_id` on this replica.
    pub fn broadcast(&self, session_id: SessionId, message: ServerMessage) {
        if let Some(conns) = self.by_session.get(&session_id) {
            for entry in conns.iter() {
                // A send failure means the connection task already exited;
                // cleanup happens on its own disconnect path, not here.
                let _ = entry.value().send(message.clone());
            }
        }
    }

    pub fn total_connections(&self) -> usize {
        self.by_session.iter().map(|e| e.value().len()).sum()
    }

    pub fn connection_count(&self, session_id: SessionId) -> usize {
        self.by_session.get(&session_id).map(|c| c.len()).unwrap_or(0)
    }
}

/// Drives one attached client's connection: registers it, sends the
/// initial sync, then loops pushing state-changed notifications and
/// answering client messages until disconnect or keep-alive timeout.
pub struct ConnectionTask<RT: Runtime> {
    rt: RT,
    session_id: SessionId,
    connection_id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    bus: FanoutBus,
    engine: SyncEngine<RT>,
    version_gate: Arc<VersionGate>,
    keepalive_interval: std::time::Duration,
}

impl<RT: Runtime> ConnectionTask<RT> {
    pub fn new(
        rt: RT,
        session_id: SessionId,
        registry: Arc<ConnectionRegistry>,
        bus: FanoutBus,
        engine: SyncEngine<RT>,
        version_gate: Arc<VersionGate>,
        keepalive_interval: std::time::Duration,
    ) -> Self {
        Self {
            rt,
            session_id,
            connection_id: Uuid::new_v4(),
            registry,
            bus,
            engine,
            version_gate,
            keepalive_interval,
        }
    }

    /// Runs the connection to completion. `inbound_rx` carries client
    /// messages decoded by the transport adapter; `outbound_tx` is handed
    /// to the caller so it can register it for this task's own pushes, and
    /// is also what the transport adapter drains to write to the socket.
    /// `shutdown_rx` is the composition root's broadcast of fatal shutdown
    /// — `common::shutdown::ShutdownSignal` only exposes a way to send one,
    /// so the receiver side is threaded in here directly.
    pub async fn run(
        mut self,
        mut inbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
        outbound_tx: mpsc::UnboundedSender<ServerMessage>,
        mut shutdown_rx: async_broadcast::Receiver<ShutdownMessage>,
    ) {
        self.registry.register(self.session_id, self.connection_id, outbound_tx.clone());
        let _ = outbound_tx.send(ServerMessage::Connected {
            server_ts: self.rt.generate_timestamp(),
        });

        match self.engine.get_current_state(self.session_id) {
            Ok(state) => {
                let _ = outbound_tx.send(ServerMessage::StateSync { state });
            },
            Err(e) => {
                let _ = outbound_tx.send(ServerMessage::Error {
                    message: format!("{e:#}"),
                });
            },
        }

        let mut state_changed_rx = self.bus.subscribe_state_changed();

        'connection: loop {
            let mut keepalive = self.rt.wait(self.keepalive_interval);
            select_biased! {
                msg = inbound_rx.recv().fuse() => {
                    match msg {
                        Some(ClientMessage::Ping) => {
                            let _ = outbound_tx.send(ServerMessage::Pong);
                        },
                        Some(ClientMessage::RequestSync) => {
                            match self.engine.get_current_state(self.session_id) {
                                Ok(state) => {
                                    let _ = outbound_tx.send(ServerMessage::StateSync { state });
                                },
                                Err(e) => {
                                    let _ = outbound_tx.send(ServerMessage::Error {
                                        message: format!("{e:#}"),
                                    });
                                },
                            }
                        },
                        None => break 'connection,
                    }
                },
                event = state_changed_rx.recv().fuse() => {
                    match event {
                        Ok(event) if event.session_id == self.session_id => {
                            if !self.version_gate.admit(self.session_id, event.version) {
                                continue 'connection;
                            }
                            match event.kind {
                                StateChangedKind::Updated(snapshot) => {
                                    match serde_json::from_value::<Session>(snapshot) {
                                        Ok(state) => {
                                            let _ = outbound_tx.send(ServerMessage::StateUpdate { state });
                                        },
                                        Err(e) => {
                                            warn!(session_id = %self.session_id, error = %e, "dropping malformed state-changed payload");
                                        },
                                    }
                                },
                                StateChangedKind::Deleted => {
                                    let _ = outbound_tx.send(ServerMessage::SessionDeleted);
                                    self.version_gate.forget(self.session_id);
                                    break 'connection;
                                },
                            }
                        },
                        Ok(_) => {
                            // Notification for a different session; ignore.
                        },
                        Err(_lagged) => {
                            debug!(session_id = %self.session_id, "state-changed subscriber lagged; resyncing");
                            if let Ok(state) = self.engine.get_current_state(self.session_id) {
                                let _ = outbound_tx.send(ServerMessage::StateSync { state });
                            }
                        },
                    }
                },
                () = keepalive => {
                    info!(session_id = %self.session_id, connection_id = %self.connection_id, "keep-alive timeout, closing connection");
                    break 'connection;
                },
                _ = shutdown_rx.recv().fuse() => {
                    info!(session_id = %self.session_id, connection_id = %self.connection_id, "shutting down, closing connection");
                    break 'connection;
                },
            }
        }

        self.registry.unregister(self.session_id, self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use audit_pipeline::{
        AuditPipeline,
        InMemoryAuditStore,
        InMemoryDeadLetterSink,
    };
    use common::runtime::testing::TestRuntime;
    use state_store::StateStore;
    use sync_engine::{
        ParticipantConfig,
        SessionConfig,
        SyncMode,
    };

    use super::*;

    fn make_engine(rt: TestRuntime) -> SyncEngine<TestRuntime> {
        let store = StateStore::new(rt.clone(), Duration::from_secs(3600));
        let bus = FanoutBus::new();
        let audit = AuditPipeline::new(
            rt.clone(),
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        SyncEngine::new(rt, store, bus, audit)
    }

    fn one_participant_config() -> SessionConfig {
        SessionConfig {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::CountUp,
            participants: vec![ParticipantConfig {
                participant_id: Uuid::new_v4(),
                total_time_ms: 60_000,
                group_id: None,
            }],
            total_time_ms: 60_000,
            time_per_cycle_ms: None,
            increment_ms: 0,
            max_time_ms: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_receives_initial_sync_then_state_update() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt.clone());
        let bus = engine.bus().clone();
        let config = one_participant_config();
        let session_id = config.session_id;
        engine.create(config).unwrap();
        engine.start(session_id).unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let task = ConnectionTask::new(
            rt.clone(),
            session_id,
            registry.clone(),
            bus.clone(),
            engine.clone(),
            Arc::new(VersionGate::new()),
            Duration::from_secs(30),
        );
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = async_broadcast::broadcast(1);

        let handle = tokio::spawn(task.run(inbound_rx, outbound_tx, shutdown_rx));
        tokio::task::yield_now().await;

        assert!(matches!(
            outbound_rx.recv().await.unwrap(),
            ServerMessage::Connected { .. }
        ));
        assert!(matches!(
            outbound_rx.recv().await.unwrap(),
            ServerMessage::StateSync { .. }
        ));
        assert_eq!(registry.connection_count(session_id), 1);

        engine.switch_cycle(session_id, None).unwrap();
        tokio::task::yield_now().await;
        assert!(matches!(
            outbound_rx.recv().await.unwrap(),
            ServerMessage::StateUpdate { .. }
        ));

        drop(inbound_tx);
        drop(shutdown_tx);
        handle.await.unwrap();
        assert_eq!(registry.connection_count(session_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_answered_with_pong() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt.clone());
        let bus = engine.bus().clone();
        let config = one_participant_config();
        let session_id = config.session_id;
        engine.create(config).unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let task = ConnectionTask::new(
            rt.clone(),
            session_id,
            registry,
            bus,
            engine,
            Arc::new(VersionGate::new()),
            Duration::from_secs(30),
        );
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = async_broadcast::broadcast(1);
        let handle = tokio::spawn(task.run(inbound_rx, outbound_tx, shutdown_rx));

        let _ = outbound_rx.recv().await; // connected
        let _ = outbound_rx.recv().await; // state_sync
        inbound_tx.send(ClientMessage::Ping).unwrap();
        assert!(matches!(outbound_rx.recv().await.unwrap(), ServerMessage::Pong));

        drop(inbound_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_timeout_closes_connection() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt.clone());
        let bus = engine.bus().clone();
        let config = one_participant_config();
        let session_id = config.session_id;
        engine.create(config).unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let task = ConnectionTask::new(
            rt.clone(),
            session_id,
            registry.clone(),
            bus,
            engine,
            Arc::new(VersionGate::new()),
            Duration::from_millis(100),
        );
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = async_broadcast::broadcast(1);
        let handle = tokio::spawn(task.run(inbound_rx, outbound_tx, shutdown_rx));

        let _ = outbound_rx.recv().await; // connected
        let _ = outbound_rx.recv().await; // state_sync
        tokio::time::advance(Duration::from_millis(150)).await;
        handle.await.unwrap();
        assert_eq!(registry.connection_count(session_id), 0);
    }
}
