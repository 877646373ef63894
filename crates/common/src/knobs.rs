//! Tunable limits and parameters, overridable with environment variables.
//!
//! When running locally these knobs can all be overridden with an
//! environment variable of the same name. See `cmd_util::env::env_config`
//! for the override mechanics.

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// TTL applied to every state-store write; refreshed on every accepted
/// mutation. Inactive sessions evict themselves once this elapses.
pub static SESSION_TTL_SECONDS: LazyLock<u64> =
    LazyLock::new(|| env_config("SESSION_TTL_SECONDS", 3600));

pub fn session_ttl() -> Duration {
    Duration::from_secs(*SESSION_TTL_SECONDS)
}

/// Maximum audit-pipeline retry attempts before an event is dead-lettered.
pub static AUDIT_RETRY_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("AUDIT_RETRY_ATTEMPTS", 5));

/// Initial audit-pipeline retry backoff, doubled per attempt up to
/// `AUDIT_BACKOFF_MAX_MS`.
pub static AUDIT_BACKOFF_INITIAL_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("AUDIT_BACKOFF_INITIAL_MS", 2000));

pub static AUDIT_BACKOFF_MAX_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("AUDIT_BACKOFF_MAX_MS", 32_000));

/// Push-channel keepalive ping cadence.
pub static KEEPALIVE_INTERVAL_SECONDS: LazyLock<u64> =
    LazyLock::new(|| env_config("KEEPALIVE_INTERVAL_SECONDS", 30));

pub fn keepalive_interval() -> Duration {
    Duration::from_secs(*KEEPALIVE_INTERVAL_SECONDS)
}

/// Rate limit on `switchCycle` calls, per session.
pub static RATE_LIMIT_SWITCH_PER_SECOND: LazyLock<u32> =
    LazyLock::new(|| env_config("RATE_LIMIT_SWITCH_PER_SECOND", 10));

/// Rate limit on all other operations, per session.
pub static RATE_LIMIT_GENERAL_PER_MINUTE: LazyLock<u32> =
    LazyLock::new(|| env_config("RATE_LIMIT_GENERAL_PER_MINUTE", 100));

/// Worker threads for the Tokio runtime. 0 means use the default (number of
/// cores).
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));
