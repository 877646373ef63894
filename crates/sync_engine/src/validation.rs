//! Request-shape validation for `create`, per spec.md §4.4.1. Runs before
//! any State Store write is attempted; a session is either fully valid or
//! not written at all.

use std::collections::HashSet;

use errors::ErrorMetadata;

use crate::model::SessionConfig;

const MIN_PARTICIPANT_TIME_MS: u64 = 1_000;
const MAX_PARTICIPANT_TIME_MS: u64 = 86_400_000;
const MAX_PARTICIPANTS: usize = 1_000;

#[derive(Debug, Clone)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

pub fn validate_session_config(config: &SessionConfig) -> Result<(), anyhow::Error> {
    let mut errors = Vec::new();

    if config.participants.is_empty() || config.participants.len() > MAX_PARTICIPANTS {
        errors.push(FieldError {
            field: "participants".to_owned(),
            message: format!(
                "expected between 1 and {MAX_PARTICIPANTS} participants, got {}",
                config.participants.len()
            ),
        });
    }

    let mut seen = HashSet::with_capacity(config.participants.len());
    for p in &config.participants {
        if !seen.insert(p.participant_id) {
            errors.push(FieldError {
                field: "participants".to_owned(),
                message: format!("duplicate participant id {}", p.participant_id),
            });
        }
        if !(MIN_PARTICIPANT_TIME_MS..=MAX_PARTICIPANT_TIME_MS).contains(&p.total_time_ms) {
            errors.push(FieldError {
                field: format!("participants[{}].total_time_ms", p.participant_id),
                message: format!(
                    "must be between {MIN_PARTICIPANT_TIME_MS} and {MAX_PARTICIPANT_TIME_MS}, got {}",
                    p.total_time_ms
                ),
            });
        }
    }

    if errors.is_empty() {
        return Ok(());
    }

    let joined = errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(anyhow::anyhow!("validation failed: {joined}")
        .context(ErrorMetadata::bad_request("ValidationError", joined)))
}
