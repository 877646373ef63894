//! C7: Composition Root. Builds C1–C6 once at process start and wires them
//! into a thin Axum transport, the way `crates/local_backend/src/main.rs`
//! builds the local backend's persistence/database/sync stack and hands it
//! to `make_app`. This binary is a demonstration of the wiring, not the
//! HTTP/WebSocket framing surface spec.md's Non-goals disclaim.

mod config;
mod router;

use std::sync::Arc;

use clap::Parser;
use cmd_util::env::config_service;
use common::{
    knobs,
    shutdown::ShutdownSignal,
};
use config::EngineConfig;
use delivery_plane::ConnectionRegistry;
use fanout_bus::FanoutBus;
use runtime::prod::ProdRuntime;
use state_store::StateStore;
use sync_engine::SyncEngine;
use tokio::signal;

fn main() -> anyhow::Result<()> {
    let _guard = config_service();
    let config = EngineConfig::parse();
    tracing::info!(?config, "starting session-sync-server");

    if let Some(origin) = &config.cors_origin {
        tracing::info!(%origin, "configured allowed origin (not enforced by this binary)");
    }

    let tokio_rt = ProdRuntime::init_tokio()?;
    let runtime = ProdRuntime::new(&tokio_rt);
    let runtime_ = runtime.clone();

    runtime.block_on("main", run_server(runtime_, config))
}

async fn run_server(runtime: ProdRuntime, config: EngineConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = async_broadcast::broadcast(1);
    let fatal_signal = ShutdownSignal::new(shutdown_tx.clone(), "session-sync-server".to_owned());

    let store = StateStore::new(runtime.clone(), knobs::session_ttl());
    let bus = FanoutBus::new();
    let audit = audit_pipeline::AuditPipeline::new(
        runtime.clone(),
        Arc::new(audit_pipeline::InMemoryAuditStore::new()),
        Arc::new(audit_pipeline::InMemoryDeadLetterSink::new()),
    );
    let engine = SyncEngine::new(runtime.clone(), store, bus, audit);
    let connections = Arc::new(ConnectionRegistry::new());

    let state = router::AppState {
        engine,
        connections,
        runtime,
        shutdown_rx: shutdown_rx.clone(),
    };
    let app = router::router(state);

    let addr = std::net::SocketAddr::from((config.interface, config.port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => {
            result?;
        },
        _ = signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            fatal_signal.signal(anyhow::anyhow!("ctrl-c"));
        },
    }

    Ok(())
}
