//! Deterministic `Runtime` for tests, built on Tokio's paused-time test
//! driver rather than a hand-rolled scheduler: run tests with
//! `#[tokio::test(start_paused = true)]` and advance time with
//! `tokio::time::advance`/`tokio::time::sleep`, and `TestRuntime` reports
//! exactly the clock Tokio is virtualizing.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use rand::{
    rngs::StdRng,
    RngCore,
    SeedableRng,
};

use super::{
    JoinError,
    Runtime,
    SpawnHandle,
};

pub struct TestFutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestFutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move { (&mut self.handle).await.map_err(|e| e.into()) }.boxed()
    }
}

/// Runtime for tests: spawns onto whatever Tokio runtime the test is
/// running under (a `#[tokio::test(start_paused = true)]` one, typically)
/// and seeds its RNG deterministically so test failures reproduce.
#[derive(Clone)]
pub struct TestRuntime {
    seed: u64,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TestFutureHandle {
            handle: tokio::spawn(f),
        })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(StdRng::seed_from_u64(self.seed))
    }
}
