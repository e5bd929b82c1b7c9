//! MCP client for agent containers: JSON-RPC 2.0 over HTTP with the
//! `mcp-session-id` header (protocol revision 2025-06-18).
//!
//! One client talks to one agent's `/mcp` endpoint on its loopback host
//! port. The router owns one client per agent per router session.

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use {
    client::{McpAgentClient, McpClientState},
    error::{Error, Result},
    transport::HttpTransport,
    types::{
        JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpResourceDef, McpToolDef,
        PROTOCOL_VERSION, ResourcesListResult, ResourcesReadResult, ToolContent, ToolsCallResult,
        ToolsListResult,
    },
};
