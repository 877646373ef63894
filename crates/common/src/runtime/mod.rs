//! `Runtime` abstracts away OS-esque features — time, randomness, task
//! spawning — so the engine can be driven by a deterministic implementation
//! in tests and by Tokio/the OS clock in production.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use futures::future::{
    BoxFuture,
    FusedFuture,
};
use rand::RngCore;
use uuid::Uuid;

use crate::types::Timestamp;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("future canceled")]
    Canceled,
    #[error("future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e}"))
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shut down the associated future, preempting it at its next yield point,
/// and join on its result.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// Abstraction over an operating system clock/executor/RNG. Application code
/// is parameterized by a `Runtime` implementation rather than calling
/// `tokio::spawn`/`Instant::now`/`rand::thread_rng` directly, so tests can
/// swap in a deterministic implementation.
#[async_trait]
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Return the (potentially virtualized) system time.
    fn system_time(&self) -> SystemTime;

    /// Use the runtime's source of randomness.
    fn rng(&self) -> Box<dyn RngCore>;

    fn new_uuid_v4(&self) -> Uuid {
        let mut rng = self.rng();
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    fn generate_timestamp(&self) -> Timestamp {
        Timestamp::from_system_time(self.system_time())
    }
}
