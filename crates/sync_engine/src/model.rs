//! The session/participant data model. The State Store treats these as
//! opaque JSON; only this crate assigns them meaning.

use common::types::Timestamp;
use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

pub type SessionId = Uuid;
pub type ParticipantId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    PerParticipant,
    PerCycle,
    PerGroup,
    Global,
    CountUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Expired,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Expired => "expired",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub participant_index: u32,
    pub total_time_ms: u64,
    pub time_used_ms: u64,
    pub cycle_count: u64,
    pub is_active: bool,
    pub has_expired: bool,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub sync_mode: SyncMode,
    pub status: SessionStatus,
    /// Mirrors the version the State Store last accepted. The store is the
    /// sole source of truth for this value — the copy serialized into the
    /// stored blob is stale the instant a write bumps it, so every read
    /// path overwrites this field with the version the store just handed
    /// back rather than trusting the deserialized value. Per spec.md's Open
    /// Question resolution, any version a caller supplies on input is
    /// advisory only — the store decides what the next version is.
    pub version: u64,
    pub participants: Vec<Participant>,
    pub active_participant_id: Option<ParticipantId>,
    pub total_time_ms: u64,
    pub time_per_cycle_ms: Option<u64>,
    pub increment_ms: u64,
    pub max_time_ms: Option<u64>,
    pub cycle_started_at: Option<Timestamp>,
    pub session_started_at: Option<Timestamp>,
    pub session_completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Session {
    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.participant_id == id)
    }

    pub fn participant_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.participant_id == id)
    }

    pub fn active_participant(&self) -> Option<&Participant> {
        self.active_participant_id.and_then(|id| self.participant(id))
    }
}

/// Input to `create`. Participant and session ids are accepted from the
/// caller (client-chosen UUIDs are the norm here) but validated before any
/// write is attempted.
#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantConfig {
    pub participant_id: Uuid,
    pub total_time_ms: u64,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub session_id: Uuid,
    pub sync_mode: SyncMode,
    pub participants: Vec<ParticipantConfig>,
    pub total_time_ms: u64,
    pub time_per_cycle_ms: Option<u64>,
    #[serde(default)]
    pub increment_ms: u64,
    pub max_time_ms: Option<u64>,
}

/// Result of a successful `switchCycle`, per spec.md §4.4.3 step 8.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchCycleResult {
    pub active_participant_id: Option<ParticipantId>,
    pub cycle_started_at: Option<Timestamp>,
    pub participants: Vec<Participant>,
    pub status: SessionStatus,
    pub expired_participant_id: Option<ParticipantId>,
}
