//! C4: the Sync Engine — session/participant lifecycle and the hot-path
//! switch-cycle computation. Every business rule lives here; the State
//! Store it sits on top of treats sessions as opaque, versioned blobs.

mod engine;
mod metrics_impl;
mod model;
mod validation;

#[cfg(test)]
mod proptest_invariants;

pub use engine::SyncEngine;
pub use model::{
    Participant,
    ParticipantConfig,
    Session,
    SessionConfig,
    SessionId,
    SessionStatus,
    SwitchCycleResult,
    SyncMode,
};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use audit_pipeline::{
        AuditPipeline,
        InMemoryAuditStore,
        InMemoryDeadLetterSink,
    };
    use common::runtime::testing::TestRuntime;
    use errors::ErrorMetadataAnyhowExt;
    use fanout_bus::FanoutBus;
    use state_store::StateStore;
    use std::sync::Arc;
    use uuid::Uuid;

    use super::*;

    fn two_participants(p1_ms: u64, p2_ms: u64) -> (Uuid, Uuid, SessionConfig) {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let config = SessionConfig {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::PerParticipant,
            participants: vec![
                ParticipantConfig {
                    participant_id: p1,
                    total_time_ms: p1_ms,
                    group_id: None,
                },
                ParticipantConfig {
                    participant_id: p2,
                    total_time_ms: p2_ms,
                    group_id: None,
                },
            ],
            total_time_ms: p1_ms + p2_ms,
            time_per_cycle_ms: None,
            increment_ms: 0,
            max_time_ms: None,
        };
        (p1, p2, config)
    }

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

    #[tokio::test(start_paused = true)]
    async fn two_participant_switch() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (p1, p2, config) = two_participants(60_000, 60_000);
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.start(session_id).unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let result = engine.switch_cycle(session_id, None).unwrap();

        assert_eq!(result.active_participant_id, Some(p2));
        let p1_state = result.participants.iter().find(|p| p.participant_id == p1).unwrap();
        assert!((450..=550).contains(&p1_state.time_used_ms));
        assert!((59_450..=59_550).contains(&p1_state.total_time_ms));

        let session = engine.get_current_state(session_id).unwrap();
        assert_eq!(session.version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn increment_applied_on_switch() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (p1, _p2, mut config) = two_participants(60_000, 60_000);
        config.increment_ms = 5_000;
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.start(session_id).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let result = engine.switch_cycle(session_id, None).unwrap();

        let p1_state = result.participants.iter().find(|p| p.participant_id == p1).unwrap();
        assert!((64_450..=64_550).contains(&p1_state.total_time_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_marks_participant_and_returns_expired_id() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (p1, p2, config) = two_participants(1_000, 60_000);
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.start(session_id).unwrap();
        tokio::time::advance(Duration::from_millis(1_200)).await;
        let result = engine.switch_cycle(session_id, None).unwrap();

        assert_eq!(result.expired_participant_id, Some(p1));
        assert_eq!(result.active_participant_id, Some(p2));
        let p1_state = result.participants.iter().find(|p| p.participant_id == p1).unwrap();
        assert_eq!(p1_state.total_time_ms, 0);
        assert!(p1_state.has_expired);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_switches_strictly_increase_version() {
        // Exercises the monotonic-version invariant end to end through the
        // engine; the actual CAS-rejection path (two writers racing on the
        // same expected_version) is covered directly at the state_store
        // layer, since the engine always re-fetches before writing and so
        // can't be driven into a stale write from a single call site.
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (_p1, _p2, config) = two_participants(60_000, 60_000);
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.start(session_id).unwrap();
        let mut last_version = engine.get_current_state(session_id).unwrap().version;
        for _ in 0..5 {
            engine.switch_cycle(session_id, None).unwrap();
            let version = engine.get_current_state(session_id).unwrap().version;
            assert_eq!(version, last_version + 1);
            last_version = version;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_then_resume_preserves_active_participant() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (p1, _p2, config) = two_participants(60_000, 60_000);
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.start(session_id).unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        let paused = engine.pause(session_id).unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.active_participant_id, Some(p1));
        assert!(paused.cycle_started_at.is_none());

        let resumed = engine.resume(session_id).unwrap();
        assert_eq!(resumed.status, SessionStatus::Running);
        assert_eq!(resumed.active_participant_id, Some(p1));
        assert!(resumed.cycle_started_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn complete_is_idempotent() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (_p1, _p2, config) = two_participants(60_000, 60_000);
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.start(session_id).unwrap();
        let first = engine.complete(session_id).unwrap();
        assert_eq!(first.active_participant_id, None);
        let version_after_first = first.version;

        let second = engine.complete(session_id).unwrap();
        assert_eq!(second.version, version_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_then_get_is_not_found() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let (_p1, _p2, config) = two_participants(60_000, 60_000);
        let session_id = config.session_id;

        engine.create(config).unwrap();
        engine.delete(session_id).unwrap();
        let err = engine.get_current_state(session_id).unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn single_participant_self_rotates() {
        let rt = TestRuntime::new();
        let engine = make_engine(rt);
        let p1 = Uuid::new_v4();
        let config = SessionConfig {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::CountUp,
            participants: vec![ParticipantConfig {
                participant_id: p1,
                total_time_ms: 60_000,
                group_id: None,
            }],
            total_time_ms: 60_000,
            time_per_cycle_ms: None,
            increment_ms: 0,
            max_time_ms: None,
        };
        let session_id = config.session_id;
        engine.create(config).unwrap();
        engine.start(session_id).unwrap();
        let result = engine.switch_cycle(session_id, None).unwrap();
        assert_eq!(result.active_participant_id, Some(p1));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_eviction_surfaces_not_found() {
        let rt = TestRuntime::new();
        let store = StateStore::new(rt.clone(), Duration::from_millis(100));
        let bus = FanoutBus::new();
        let audit = AuditPipeline::new(
            rt.clone(),
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        let engine = SyncEngine::new(rt, store, bus, audit);

        let (_p1, _p2, config) = two_participants(60_000, 60_000);
        let session_id = config.session_id;
        engine.create(config).unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(engine.get_current_state(session_id).unwrap_err().is_not_found());
        assert!(engine.switch_cycle(session_id, None).unwrap_err().is_not_found());
    }
}
