//! C4: business rules. The State Store doesn't know what a "session" is;
//! every mutating method here follows the same shape — read a snapshot,
//! validate the transition, compute the new value, CAS it back — mirroring
//! the read-compute-CAS-write shape of the teacher's transaction committer.

use anyhow::Context;
use audit_pipeline::{
    AuditJob,
    AuditPipeline,
};
use common::{
    runtime::Runtime,
    types::Timestamp,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use fanout_bus::{
    FanoutBus,
    StateChanged,
    StateChangedKind,
};
use metrics::StatusTimer;
use state_store::StateStore;
use uuid::Uuid;

use crate::{
    metrics_impl,
    model::{
        Participant,
        ParticipantId,
        Session,
        SessionConfig,
        SessionId,
        SessionStatus,
        SwitchCycleResult,
    },
    validation::validate_session_config,
};

/// A delete notification always wins the per-session ordering check at
/// subscribers (`version > last_seen`), since the State Store no longer
/// tracks a version for a key it just removed.
const DELETE_NOTIFICATION_VERSION: u64 = u64::MAX;

#[derive(Clone)]
pub struct SyncEngine<RT: Runtime> {
    rt: RT,
    store: StateStore<RT>,
    bus: FanoutBus,
    audit: AuditPipeline<RT>,
}

impl<RT: Runtime> SyncEngine<RT> {
    pub fn new(rt: RT, store: StateStore<RT>, bus: FanoutBus, audit: AuditPipeline<RT>) -> Self {
        Self {
            rt,
            store,
            bus,
            audit,
        }
    }

    /// The fan-out bus this engine publishes state changes to. Exposed so
    /// the Delivery Plane can subscribe directly rather than the
    /// composition root threading a second handle through separately.
    pub fn bus(&self) -> &FanoutBus {
        &self.bus
    }

    /// §4.4.1 `create`.
    pub fn create(&self, config: SessionConfig) -> anyhow::Result<Session> {
        validate_session_config(&config)?;

        let now = self.rt.generate_timestamp();
        let participants = config
            .participants
            .iter()
            .enumerate()
            .map(|(index, p)| Participant {
                participant_id: p.participant_id,
                participant_index: index as u32,
                total_time_ms: p.total_time_ms,
                time_used_ms: 0,
                cycle_count: 0,
                is_active: false,
                has_expired: false,
                group_id: p.group_id,
            })
            .collect();

        let session = Session {
            session_id: config.session_id,
            sync_mode: config.sync_mode,
            status: SessionStatus::Pending,
            version: 1,
            participants,
            active_participant_id: None,
            total_time_ms: config.total_time_ms,
            time_per_cycle_ms: config.time_per_cycle_ms,
            increment_ms: config.increment_ms,
            max_time_ms: config.max_time_ms,
            cycle_started_at: None,
            session_started_at: None,
            session_completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.create(session.session_id, &session)?;
        self.emit_change(&session, 1, "create", None, None)?;
        Ok(session)
    }

    /// §4.4.2 `start`.
    pub fn start(&self, session_id: SessionId) -> anyhow::Result<Session> {
        let (mut session, _version) = self.fetch(session_id)?;
        if session.status != SessionStatus::Pending {
            return Err(invalid_state_transition("start is only valid from status=pending"));
        }

        let now = self.rt.generate_timestamp();
        let first = session
            .participants
            .first()
            .map(|p| p.participant_id)
            .context("session has no participants")?;

        session.status = SessionStatus::Running;
        session.active_participant_id = Some(first);
        if let Some(p) = session.participant_mut(first) {
            p.is_active = true;
        }
        session.session_started_at = Some(now);
        session.cycle_started_at = Some(now);
        session.updated_at = now;

        // "Writes via StateStore.update without version check (caller
        // already fetched)" — spec.md §4.4.2.
        let write = self.store.update(session_id, &session, None)?;
        session.version = write.0;
        self.emit_change(&session, write.0, "start", Some(first), None)?;
        Ok(session)
    }

    /// §4.4.3 `switchCycle` — the hot path. No durable writes here; the
    /// Audit Pipeline enqueue below is an in-memory handoff only.
    pub fn switch_cycle(
        &self,
        session_id: SessionId,
        next_participant_id: Option<ParticipantId>,
    ) -> anyhow::Result<SwitchCycleResult> {
        let timer = StatusTimer::new(&metrics_impl::SWITCH_CYCLE_SECONDS);
        let result = self.switch_cycle_inner(session_id, next_participant_id);
        match &result {
            Ok(_) => {
                timer.finish();
            },
            Err(e) if e.is_conflict() => {
                timer.finish_with("conflict");
            },
            Err(e) if e.is_not_found() => {
                timer.finish_with("not_found");
            },
            Err(_) => {
                // leave the default error label from `Drop`
            },
        }
        result
    }

    fn switch_cycle_inner(
        &self,
        session_id: SessionId,
        next_participant_id: Option<ParticipantId>,
    ) -> anyhow::Result<SwitchCycleResult> {
        let (mut session, expected_version) = self.fetch(session_id)?;
        if session.status != SessionStatus::Running {
            return Err(invalid_state_transition("switchCycle is only valid from status=running"));
        }

        let now = self.rt.generate_timestamp();
        let expired_participant_id = fold_cycle(&mut session, now, true);

        let next_id = match next_participant_id {
            Some(id) => {
                if session.participant(id).is_none() {
                    return Err(validation_error(
                        "next_participant_id",
                        format!("unknown participant {id}"),
                    ));
                }
                id
            },
            None => next_in_rotation(&session)?,
        };

        session.active_participant_id = Some(next_id);
        if let Some(next) = session.participant_mut(next_id) {
            next.is_active = true;
        }
        session.cycle_started_at = Some(now);
        session.updated_at = now;

        let write = match self.store.update(session_id, &session, Some(expected_version)) {
            Ok(w) => w,
            Err(e) => {
                if e.is_conflict() {
                    metrics::log_counter(&metrics_impl::SWITCH_CYCLE_CONCURRENCY_CONFLICTS_TOTAL, 1);
                }
                return Err(e);
            },
        };
        session.version = write.0;

        let time_remaining_ms = session
            .active_participant()
            .map(|p| p.total_time_ms as i64);
        self.emit_change(&session, write.0, "switch_cycle", Some(next_id), time_remaining_ms)?;

        Ok(SwitchCycleResult {
            active_participant_id: session.active_participant_id,
            cycle_started_at: session.cycle_started_at,
            participants: session.participants,
            status: session.status,
            expired_participant_id,
        })
    }

    /// §4.4.4 `pause`.
    pub fn pause(&self, session_id: SessionId) -> anyhow::Result<Session> {
        let (mut session, expected_version) = self.fetch(session_id)?;
        if session.status != SessionStatus::Running {
            return Err(invalid_state_transition("pause is only valid from status=running"));
        }

        let now = self.rt.generate_timestamp();
        fold_cycle(&mut session, now, false);
        session.cycle_started_at = None;
        session.status = SessionStatus::Paused;
        session.updated_at = now;

        let write = self.store.update(session_id, &session, Some(expected_version))?;
        session.version = write.0;
        let active = session.active_participant_id;
        self.emit_change(&session, write.0, "pause", active, None)?;
        Ok(session)
    }

    /// §4.4.5 `resume`.
    pub fn resume(&self, session_id: SessionId) -> anyhow::Result<Session> {
        let (mut session, expected_version) = self.fetch(session_id)?;
        if session.status != SessionStatus::Paused {
            return Err(invalid_state_transition("resume is only valid from status=paused"));
        }

        let now = self.rt.generate_timestamp();
        session.status = SessionStatus::Running;
        session.cycle_started_at = Some(now);
        session.updated_at = now;
        if let Some(active_id) = session.active_participant_id {
            if let Some(p) = session.participant_mut(active_id) {
                p.is_active = true;
            }
        }

        let write = self.store.update(session_id, &session, Some(expected_version))?;
        session.version = write.0;
        let active = session.active_participant_id;
        self.emit_change(&session, write.0, "resume", active, None)?;
        Ok(session)
    }

    /// §4.4.6 `complete`. Idempotent: completing an already-completed
    /// session is a no-op that returns the current state unchanged, without
    /// a new write or a new *state-changed* notification.
    pub fn complete(&self, session_id: SessionId) -> anyhow::Result<Session> {
        let (mut session, expected_version) = self.fetch(session_id)?;
        if session.status == SessionStatus::Completed {
            return Ok(session);
        }
        if matches!(session.status, SessionStatus::Expired | SessionStatus::Cancelled) {
            return Err(invalid_state_transition("complete is not valid from a terminal status"));
        }

        let now = self.rt.generate_timestamp();
        for p in &mut session.participants {
            p.is_active = false;
        }
        session.active_participant_id = None;
        session.cycle_started_at = None;
        session.session_completed_at = Some(now);
        session.status = SessionStatus::Completed;
        session.updated_at = now;

        let write = self.store.update(session_id, &session, Some(expected_version))?;
        session.version = write.0;
        self.emit_change(&session, write.0, "complete", None, None)?;
        Ok(session)
    }

    /// §4.4.7 `getCurrentState`. Pure read; never computes remaining time
    /// from `now` — that's the client's job ("Calculate, Don't Count").
    pub fn get_current_state(&self, session_id: SessionId) -> anyhow::Result<Session> {
        Ok(self.fetch(session_id)?.0)
    }

    /// §4.4.8 `delete`.
    pub fn delete(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.store.delete(session_id)?;
        self.bus.publish_state_changed(StateChanged {
            session_id,
            version: DELETE_NOTIFICATION_VERSION,
            kind: StateChangedKind::Deleted,
            server_ts: Timestamp::now(),
        });
        self.audit.enqueue(AuditJob {
            session_id,
            event_type: "delete".to_owned(),
            participant_id: None,
            time_remaining_ms: None,
            timestamp: self.rt.generate_timestamp(),
            state_snapshot: serde_json::Value::Null,
            status: "deleted".to_owned(),
        });
        Ok(())
    }

    fn fetch(&self, session_id: SessionId) -> anyhow::Result<(Session, u64)> {
        let (mut session, version) = self
            .store
            .get::<Session>(session_id)?
            .ok_or_else(|| session_not_found(session_id))?;
        // The stored blob's own `version` field is whatever it was
        // serialized with; `store.get`'s returned version is authoritative.
        session.version = version;
        Ok((session, version))
    }

    fn emit_change(
        &self,
        session: &Session,
        version: u64,
        event_type: &str,
        participant_id: Option<Uuid>,
        time_remaining_ms: Option<i64>,
    ) -> anyhow::Result<()> {
        let snapshot = serde_json::to_value(session)
            .context("serializing session for state-changed notification")?;
        self.bus.publish_state_changed(StateChanged {
            session_id: session.session_id,
            version,
            kind: StateChangedKind::Updated(snapshot.clone()),
            server_ts: self.rt.generate_timestamp(),
        });
        self.audit.enqueue(AuditJob {
            session_id: session.session_id,
            event_type: event_type.to_owned(),
            participant_id,
            time_remaining_ms,
            timestamp: self.rt.generate_timestamp(),
            state_snapshot: snapshot,
            status: session.status.as_str().to_owned(),
        });
        Ok(())
    }
}

/// Folds the elapsed cycle time into the currently active participant —
/// the shared arithmetic behind both `switchCycle` (steps 4a-4c, with
/// rotation and increment) and `pause` (same arithmetic, no increment, no
/// rotation). Returns the expired participant's id, if the fold drained
/// their clock to zero.
fn fold_cycle(session: &mut Session, now: Timestamp, apply_increment: bool) -> Option<ParticipantId> {
    let active_id = session.active_participant_id?;
    let cycle_started_at = session.cycle_started_at?;
    let increment_ms = session.increment_ms;
    let current = session.participant_mut(active_id)?;

    let elapsed_ms = now.saturating_millis_since(&cycle_started_at) as u64;
    current.time_used_ms += elapsed_ms;
    current.total_time_ms = current.total_time_ms.saturating_sub(elapsed_ms);
    current.cycle_count += 1;
    current.is_active = false;

    if current.total_time_ms == 0 {
        current.has_expired = true;
        Some(current.participant_id)
    } else {
        if apply_increment && increment_ms > 0 {
            current.total_time_ms += increment_ms;
        }
        None
    }
}

fn next_in_rotation(session: &Session) -> anyhow::Result<ParticipantId> {
    let n = session.participants.len();
    if n == 0 {
        anyhow::bail!("session has no participants");
    }
    let current_index = session
        .active_participant_id
        .and_then(|id| session.participant(id))
        .map(|p| p.participant_index as usize)
        .unwrap_or(0);
    let next_index = (current_index + 1) % n;
    session
        .participants
        .iter()
        .find(|p| p.participant_index as usize == next_index)
        .map(|p| p.participant_id)
        .context("rotation index not found among participants")
}

fn session_not_found(id: SessionId) -> anyhow::Error {
    anyhow::anyhow!("session {id} not found")
        .context(ErrorMetadata::not_found("SessionNotFound", format!("session {id} not found")))
}

fn invalid_state_transition(msg: impl Into<String>) -> anyhow::Error {
    let msg = msg.into();
    anyhow::anyhow!("invalid state transition: {msg}")
        .context(ErrorMetadata::bad_request("InvalidStateTransition", msg))
}

fn validation_error(field: &str, message: impl Into<String>) -> anyhow::Error {
    let message = message.into();
    anyhow::anyhow!("validation failed: {field}: {message}")
        .context(ErrorMetadata::bad_request("ValidationError", format!("{field}: {message}")))
}
