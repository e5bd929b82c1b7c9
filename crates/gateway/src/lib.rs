//! The routing server: one HTTP listener fronting every enabled agent.
//!
//! Hosts the aggregated MCP endpoint, per-agent JSON-RPC proxies, the
//! browser terminal/chat PTY tabs (SSE), the per-agent blob store, and the
//! in-process container monitor.

pub mod aggregate;
pub mod auth;
pub mod blobs;
pub mod error;
pub mod logs;
pub mod proxy;
pub mod pty;
pub mod server;
pub mod state;

pub use {
    error::{Error, Result},
    logs::LifecycleLog,
    server::{build_router, serve},
    state::GatewayState,
};
