//! Process-level configuration: bind address and backing-store locations.
//! The per-operation knobs from spec.md §6 (keep-alive cadence, audit
//! retry/backoff, rate limits, session TTL) are environment-variable knobs
//! read directly by the crates that use them — see
//! `common::knobs` — rather than threaded through here, matching the
//! teacher's split between process config (`LocalConfig`) and tunable knobs.

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[clap(author = "Convex, Inc. <team@convex.dev>")]
pub struct EngineConfig {
    /// Host interface to bind to.
    #[clap(long, default_value = "0.0.0.0")]
    pub interface: std::net::Ipv4Addr,

    /// Port the WebSocket/HTTP listener binds to.
    #[clap(long, default_value = "8787")]
    pub port: u16,

    /// Connection string for the backing State Store. The in-process demo
    /// binary always uses the in-memory implementation; this is surfaced so
    /// a real deployment's connection info has somewhere to live.
    #[clap(long, env = "STATE_STORE_URL")]
    pub state_store_url: Option<String>,

    /// Connection string for the Audit Pipeline's durable sink.
    #[clap(long, env = "AUDIT_STORE_URL")]
    pub audit_store_url: Option<String>,

    /// Origin allowed to open a WebSocket connection. Enforcement is a
    /// transport-edge concern this binary doesn't implement (spec.md §1
    /// Non-goals); logged so it's visible which origin an operator expects.
    #[clap(long, env = "CORS_ORIGIN")]
    pub cors_origin: Option<String>,
}
