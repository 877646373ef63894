//! C1: the authoritative, in-memory key/value layer for session state.
//!
//! Every session lives under one key. Writes are version-checked
//! (optimistic concurrency) and every accepted write refreshes the key's
//! TTL. This crate knows nothing about what a "session" *means* — that's
//! the sync engine's job; it just stores and CAS-updates opaque, versioned
//! JSON blobs keyed by session id, grounded on the same
//! read-modify-CAS-write shape the teacher's transaction committer uses for
//! its document store.

use std::{
    sync::Arc,
    time::Duration,
};

use common::runtime::Runtime;
use dashmap::DashMap;
use errors::ErrorMetadata;
use metrics::log_gauge;
use serde::{
    de::DeserializeOwned,
    Serialize,
};
use tracing::debug;
use uuid::Uuid;

mod metrics_impl;

pub type SessionId = Uuid;

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    version: u64,
    expires_at: std::time::SystemTime,
}

/// In-memory authoritative store. Cheap to clone — it's a handle around a
/// shared concurrent map.
#[derive(Clone)]
pub struct StateStore<RT: Runtime> {
    rt: RT,
    entries: Arc<DashMap<SessionId, Entry>>,
    ttl: Duration,
}

/// Outcome of a successful `update`: the version actually written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteVersion(pub u64);

impl<RT: Runtime> StateStore<RT> {
    pub fn new(rt: RT, ttl: Duration) -> Self {
        Self {
            rt,
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Fetch and deserialize the session at `id`, returning `None` if it
    /// doesn't exist or has expired. Fails `STATE_DESERIALIZATION_ERROR`
    /// if the stored blob doesn't parse as `T` — a corrupt blob is never
    /// silently treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, id: SessionId) -> anyhow::Result<Option<(T, u64)>> {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(None);
        };
        if self.rt.system_time() >= entry.expires_at {
            drop(entry);
            self.entries.remove(&id);
            return Ok(None);
        }
        let value = serde_json::from_value(entry.value.clone()).map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::internal(format!(
                "stored session {id} failed to deserialize: {e}"
            )))
        })?;
        Ok(Some((value, entry.version)))
    }

    /// Write `value` as a brand-new record with version 1, overwriting any
    /// stale entry at the same key (creation is last-writer-wins by
    /// design — session ids are client-chosen and expected unique).
    pub fn create<T: Serialize>(&self, id: SessionId, value: &T) -> anyhow::Result<WriteVersion> {
        let json = serde_json::to_value(value)?;
        let expires_at = self.rt.system_time() + self.ttl;
        self.entries.insert(
            id,
            Entry {
                value: json,
                version: 1,
                expires_at,
            },
        );
        self.report_size();
        Ok(WriteVersion(1))
    }

    /// Version-checked write. If `expected_version` is `Some`, the write is
    /// only accepted if the currently stored version matches; otherwise
    /// fails `CONCURRENCY_ERROR(expected, actual)`. On success the new
    /// version is `expected_version + 1` (or 1 for a missing key treated as
    /// fresh), and the TTL is refreshed.
    pub fn update<T: Serialize>(
        &self,
        id: SessionId,
        value: &T,
        expected_version: Option<u64>,
    ) -> anyhow::Result<WriteVersion> {
        let json = serde_json::to_value(value)?;
        let expires_at = self.rt.system_time() + self.ttl;

        let Some(mut slot) = self.entries.get_mut(&id) else {
            return Err(session_not_found(id));
        };
        if self.rt.system_time() >= slot.expires_at {
            drop(slot);
            self.entries.remove(&id);
            return Err(session_not_found(id));
        }
        if let Some(expected) = expected_version {
            if slot.version != expected {
                return Err(concurrency_error(expected, slot.version));
            }
        }
        let new_version = slot.version + 1;
        *slot = Entry {
            value: json,
            version: new_version,
            expires_at,
        };
        drop(slot);
        self.report_size();
        Ok(WriteVersion(new_version))
    }

    /// Remove the key outright. Fails `SESSION_NOT_FOUND` if it doesn't
    /// exist.
    pub fn delete(&self, id: SessionId) -> anyhow::Result<()> {
        if self.entries.remove(&id).is_none() {
            return Err(session_not_found(id));
        }
        self.report_size();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep expired keys. Meant to be driven by a background task spawned
    /// off the composition root; `get`/`update` also self-evict lazily so
    /// correctness never depends on the reaper's cadence.
    pub fn reap_expired(&self) -> usize {
        let now = self.rt.system_time();
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|e| now >= e.expires_at)
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "reaped expired sessions");
            self.report_size();
        }
        expired.len()
    }

    fn report_size(&self) {
        log_gauge(&metrics_impl::STATE_STORE_SESSIONS, self.entries.len() as f64);
    }
}

fn session_not_found(id: SessionId) -> anyhow::Error {
    anyhow::anyhow!("session {id} not found").context(ErrorMetadata::not_found(
        "SessionNotFound",
        format!("session {id} not found"),
    ))
}

fn concurrency_error(expected: u64, actual: u64) -> anyhow::Error {
    anyhow::anyhow!("version mismatch: expected {expected}, found {actual}").context(
        ErrorMetadata::conflict(
            "ConcurrencyError",
            format!("expected version {expected}, found {actual}"),
        ),
    )
}

#[cfg(test)]
mod tests {
    use common::runtime::testing::TestRuntime;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_get_round_trips() {
        let store = StateStore::new(TestRuntime::new(), Duration::from_secs(3600));
        let id = Uuid::new_v4();
        store.create(id, &Doc { value: 1 }).unwrap();
        let (doc, version) = store.get::<Doc>(id).unwrap().unwrap();
        assert_eq!(doc, Doc { value: 1 });
        assert_eq!(version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn update_rejects_stale_version() {
        let store = StateStore::new(TestRuntime::new(), Duration::from_secs(3600));
        let id = Uuid::new_v4();
        store.create(id, &Doc { value: 1 }).unwrap();
        let err = store
            .update(id, &Doc { value: 2 }, Some(99))
            .unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_conflict(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn update_missing_key_is_not_found() {
        let store = StateStore::new(TestRuntime::new(), Duration::from_secs(3600));
        let err = store.update(Uuid::new_v4(), &Doc { value: 2 }, None).unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_not_found(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_evicts_on_read() {
        let store = StateStore::new(TestRuntime::new(), Duration::from_millis(100));
        let id = Uuid::new_v4();
        store.create(id, &Doc { value: 1 }).unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(store.get::<Doc>(id).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_sweeps_expired_entries() {
        let store = StateStore::new(TestRuntime::new(), Duration::from_millis(100));
        store.create(Uuid::new_v4(), &Doc { value: 1 }).unwrap();
        store.create(Uuid::new_v4(), &Doc { value: 2 }).unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(store.reap_expired(), 2);
        assert!(store.is_empty());
    }
}
