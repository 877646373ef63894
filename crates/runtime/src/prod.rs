//! Production implementation of the `Runtime` trait: real wallclock time, a
//! real OS thread RNG, and real Tokio task spawning.

use std::{
    future::Future,
    pin::Pin,
    time::SystemTime,
};

use async_trait::async_trait;
use common::{
    knobs::RUNTIME_WORKER_THREADS,
    runtime::{
        JoinError,
        Runtime,
        SpawnHandle,
    },
};
use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use metrics::ENGINE_METRICS_REGISTRY;
use parking_lot::Mutex;
use rand::rngs::ThreadRng;
use std::{
    collections::HashMap,
    sync::LazyLock,
    time::Duration,
};
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::sleep,
};
use tokio_metrics_collector::TaskMonitor;

/// Set a consistent thread stack size regardless of environment.
pub const STACK_SIZE: usize = 4 * 1024 * 1024;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move { (&mut self.handle).await.map_err(|e| e.into()) }.boxed()
    }
}

/// Runtime for running in production: real wallclock time, no mocked
/// functionality.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        assert!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let mut tokio_builder = Builder::new_multi_thread();
        tokio_builder.thread_stack_size(STACK_SIZE);
        if *RUNTIME_WORKER_THREADS > 0 {
            tokio_builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        let tokio_rt = tokio_builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    pub fn task_monitor(name: &'static str) -> TaskMonitor {
        GLOBAL_TASK_MANAGER.lock().get(name)
    }

    /// Create a new Tokio-backed runtime. `tokio_rt` should live for the
    /// duration of `main`; at the end of `main` its `Drop` joins all spawned
    /// futures, which should include all references to the handle
    /// `ProdRuntime`.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, name: &'static str, f: F) -> F::Output {
        let monitor = GLOBAL_TASK_MANAGER.lock().get(name);
        self.rt.block_on(monitor.instrument(f))
    }
}

#[async_trait]
impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let monitor = GLOBAL_TASK_MANAGER.lock().get(name);
        let handle = self.rt.spawn(monitor.instrument(f));
        Box::new(FutureHandle { handle })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn rng(&self) -> Box<dyn rand::RngCore> {
        Box::new(ThreadRng::default())
    }
}

static GLOBAL_TASK_MANAGER: LazyLock<Mutex<TaskManager>> = LazyLock::new(|| {
    let task_collector = tokio_metrics_collector::default_task_collector();
    ENGINE_METRICS_REGISTRY
        .register(Box::new(task_collector))
        .expect("failed to register task collector");

    Mutex::new(TaskManager {
        monitors: HashMap::new(),
    })
});

struct TaskManager {
    monitors: HashMap<&'static str, TaskMonitor>,
}

impl TaskManager {
    fn get(&mut self, name: &'static str) -> TaskMonitor {
        if let Some(monitor) = self.monitors.get(name) {
            return monitor.clone();
        }
        let monitor = TaskMonitor::new();
        self.monitors.insert(name, monitor.clone());
        tokio_metrics_collector::default_task_collector()
            .add(name, monitor.clone())
            .expect("duplicate task label");
        monitor
    }
}
