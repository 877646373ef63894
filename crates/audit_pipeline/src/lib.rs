//! C3: off-hot-path, reliable persistence of session mutations to a durable
//! audit log.
//!
//! `enqueue` hands a job to a per-session lane and returns immediately —
//! the caller never awaits durable persistence. Each lane is a single
//! sequential task, so events for one session always land in the order
//! they were enqueued, while lanes across sessions run concurrently (capped
//! globally by a semaphore, mirroring the "process many jobs in parallel
//! but guarantee per-session ordering" requirement). Retries use the same
//! exponential-backoff-with-jitter the teacher's index workers use for
//! their OCC retry loop, grounded on `Backoff` + `retriable_worker.rs`.

use std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

use async_trait::async_trait;
use common::{
    backoff::Backoff,
    knobs::{
        AUDIT_BACKOFF_INITIAL_MS,
        AUDIT_BACKOFF_MAX_MS,
        AUDIT_RETRY_ATTEMPTS,
    },
    runtime::Runtime,
    types::Timestamp,
};
use dashmap::DashMap;
use errors::ErrorMetadataAnyhowExt;
use metrics::log_gauge;
use serde_json::Value;
use tokio::sync::{
    mpsc,
    Semaphore,
};
use tracing::{
    error,
    warn,
};
use uuid::Uuid;

mod metrics_impl;

pub type SessionId = Uuid;

/// One durable write: an upsert into the sessions table and an append-only
/// insert into the events table, both under a single transaction in a real
/// backing store.
#[derive(Debug, Clone)]
pub struct AuditJob {
    pub session_id: SessionId,
    pub event_type: String,
    pub participant_id: Option<Uuid>,
    pub time_remaining_ms: Option<i64>,
    pub timestamp: Timestamp,
    pub state_snapshot: Value,
    pub status: String,
}

/// Durable backing store for the audit log. A real implementation talks to
/// a database; `InMemoryAuditStore` below is the in-process reference used
/// in tests and the demo binary.
#[async_trait]
pub trait AuditStore: Send + Sync + 'static {
    /// Upsert the sessions-table row and append the events-table row for
    /// `job`, atomically. Implementations distinguish retryable failures
    /// (connection errors) from non-retryable ones (constraint violations)
    /// by tagging the returned error with `errors::ErrorMetadata::conflict`
    /// for the latter.
    async fn write(&self, job: &AuditJob) -> anyhow::Result<()>;
}

/// Where jobs go once retries are exhausted.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn dead_letter(&self, job: AuditJob, last_error: anyhow::Error);
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    sessions: DashMap<SessionId, Value>,
    events: std::sync::Mutex<Vec<AuditJob>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn latest_session_snapshot(&self, id: SessionId) -> Option<Value> {
        self.sessions.get(&id).map(|e| e.clone())
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn write(&self, job: &AuditJob) -> anyhow::Result<()> {
        self.sessions
            .insert(job.session_id, job.state_snapshot.clone());
        self.events.lock().unwrap().push(job.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    entries: std::sync::Mutex<Vec<(AuditJob, String)>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(AuditJob, String)> {
        std::mem::take(&mut self.entries.lock().unwrap())
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn dead_letter(&self, job: AuditJob, last_error: anyhow::Error) {
        error!(
            session_id = %job.session_id,
            event_type = %job.event_type,
            error = %last_error,
            "audit job exhausted retries; dead-lettering"
        );
        self.entries
            .lock()
            .unwrap()
            .push((job, format!("{last_error:#}")));
    }
}

const MAX_CONCURRENT_JOBS: usize = 10;

/// Handle used by the sync engine to fire-and-forget audit writes.
pub struct AuditPipeline<RT: Runtime> {
    rt: RT,
    lanes: Arc<DashMap<SessionId, mpsc::UnboundedSender<AuditJob>>>,
    store: Arc<dyn AuditStore>,
    dead_letter: Arc<dyn DeadLetterSink>,
    concurrency: Arc<Semaphore>,
    queue_depth: Arc<AtomicUsize>,
}

impl<RT: Runtime> Clone for AuditPipeline<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            lanes: self.lanes.clone(),
            store: self.store.clone(),
            dead_letter: self.dead_letter.clone(),
            concurrency: self.concurrency.clone(),
            queue_depth: self.queue_depth.clone(),
        }
    }
}

impl<RT: Runtime> AuditPipeline<RT> {
    pub fn new(rt: RT, store: Arc<dyn AuditStore>, dead_letter: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            rt,
            lanes: Arc::new(DashMap::new()),
            store,
            dead_letter,
            concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accept `job` into the session's lane and return immediately. The
    /// lane's worker task is spawned lazily on first use and lives for the
    /// process's lifetime (sessions are few enough, and churn slowly
    /// enough, that tearing lanes down isn't worth the complexity here).
    pub fn enqueue(&self, job: AuditJob) {
        let session_id = job.session_id;
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.report_depth();

        let tx = self
            .lanes
            .entry(session_id)
            .or_insert_with(|| self.spawn_lane(session_id))
            .clone();
        if tx.send(job).is_err() {
            // The lane's worker died (shouldn't happen: its loop never
            // returns); drop the job rather than panic the caller.
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.report_depth();
        }
    }

    fn spawn_lane(&self, _session_id: SessionId) -> mpsc::UnboundedSender<AuditJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditJob>();
        let rt = self.rt.clone();
        let store = self.store.clone();
        let dead_letter = self.dead_letter.clone();
        let concurrency = self.concurrency.clone();
        let queue_depth = self.queue_depth.clone();

        let rt_for_spawn = rt.clone();
        rt_for_spawn.spawn("audit_pipeline_lane", async move {
            while let Some(job) = rx.recv().await {
                let _permit = concurrency.acquire().await;
                process_one(&rt, &*store, &*dead_letter, job).await;
                queue_depth.fetch_sub(1, Ordering::Relaxed);
                log_gauge(
                    &metrics_impl::AUDIT_QUEUE_DEPTH,
                    queue_depth.load(Ordering::Relaxed) as f64,
                );
            }
        });
        tx
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    fn report_depth(&self) {
        log_gauge(
            &metrics_impl::AUDIT_QUEUE_DEPTH,
            self.queue_depth.load(Ordering::Relaxed) as f64,
        );
    }
}

async fn process_one<RT: Runtime>(
    rt: &RT,
    store: &dyn AuditStore,
    dead_letter: &dyn DeadLetterSink,
    job: AuditJob,
) {
    let mut backoff = Backoff::new(
        std::time::Duration::from_millis(*AUDIT_BACKOFF_INITIAL_MS),
        std::time::Duration::from_millis(*AUDIT_BACKOFF_MAX_MS),
    );
    loop {
        match store.write(&job).await {
            Ok(()) => return,
            Err(e) if e.is_conflict() => {
                // Constraint violation: a logic bug, not a transient
                // failure. Retrying would just fail the same way.
                dead_letter.dead_letter(job, e).await;
                metrics::log_counter(&metrics_impl::AUDIT_JOBS_DEAD_LETTERED_TOTAL, 1);
                return;
            },
            Err(e) => {
                if backoff.failures() >= *AUDIT_RETRY_ATTEMPTS {
                    dead_letter.dead_letter(job, e).await;
                    metrics::log_counter(&metrics_impl::AUDIT_JOBS_DEAD_LETTERED_TOTAL, 1);
                    return;
                }
                let delay = backoff.fail(&mut *rt.rng());
                warn!(
                    session_id = %job.session_id,
                    attempt = backoff.failures(),
                    error = %e,
                    "audit write failed, retrying after {:?}", delay
                );
                metrics::log_counter(&metrics_impl::AUDIT_JOBS_RETRIED_TOTAL, 1);
                rt.wait(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use common::runtime::testing::TestRuntime;

    use super::*;

    fn sample_job(session_id: SessionId) -> AuditJob {
        AuditJob {
            session_id,
            event_type: "switch_cycle".to_owned(),
            participant_id: None,
            time_remaining_ms: Some(1000),
            timestamp: Timestamp::now(),
            state_snapshot: serde_json::json!({"status": "running"}),
            status: "running".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_eventually_persists() {
        let rt = TestRuntime::new();
        let store = Arc::new(InMemoryAuditStore::new());
        let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
        let pipeline = AuditPipeline::new(rt, store.clone(), dead_letter);

        let id = Uuid::new_v4();
        pipeline.enqueue(sample_job(id));

        for _ in 0..50 {
            if store.event_count() == 1 {
                break;
            }
            tokio::time::advance(std::time::Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(store.event_count(), 1);
        assert!(store.latest_session_snapshot(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_per_session_order() {
        let rt = TestRuntime::new();
        let store = Arc::new(InMemoryAuditStore::new());
        let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
        let pipeline = AuditPipeline::new(rt, store.clone(), dead_letter);

        let id = Uuid::new_v4();
        for i in 0..5 {
            let mut job = sample_job(id);
            job.event_type = format!("event_{i}");
            pipeline.enqueue(job);
        }

        for _ in 0..200 {
            if store.event_count() == 5 {
                break;
            }
            tokio::time::advance(std::time::Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }
        let events = store.events.lock().unwrap();
        for (i, job) in events.iter().enumerate() {
            assert_eq!(job.event_type, format!("event_{i}"));
        }
    }
}
