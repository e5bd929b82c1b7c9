//! MCP client: handshake and tool/resource interactions with one agent.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    transport::HttpTransport,
    types::{
        ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, McpResourceDef,
        McpToolDef, PROTOCOL_VERSION, ResourcesListResult, ResourcesReadParams,
        ResourcesReadResult, ToolsCallParams, ToolsCallResult, ToolsListResult,
    },
};

/// Timeout for list and ping calls.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for `tools/call`; callers may override per call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClientState {
    /// Transport constructed, not yet initialized.
    Connected,
    /// `initialize` completed, `initialized` notification sent.
    Ready,
    /// Session closed after shutdown or transport failure.
    Closed,
}

/// A JSON-RPC 2.0 / MCP 2025-06-18 client for one agent container.
#[derive(Debug)]
pub struct McpAgentClient {
    agent_name: String,
    transport: HttpTransport,
    state: McpClientState,
    server_info: Option<InitializeResult>,
}

impl McpAgentClient {
    /// Build a client against the agent's loopback host port and perform the
    /// MCP handshake (initialize + initialized).
    pub async fn connect(agent_name: &str, host_port: u16) -> Result<Self> {
        let mut client = Self {
            agent_name: agent_name.into(),
            transport: HttpTransport::for_host_port(host_port),
            state: McpClientState::Connected,
            server_info: None,
        };
        if let Err(e) = client.initialize().await {
            warn!(agent = %agent_name, error = %e, "MCP initialize handshake failed");
            return Err(e);
        }
        Ok(client)
    }

    async fn initialize(&mut self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "ploinky-router".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let resp = self
            .transport
            .request(
                "initialize",
                Some(serde_json::to_value(&params)?),
                LIST_TIMEOUT,
            )
            .await?;

        let result: InitializeResult = serde_json::from_value(resp.result.ok_or_else(|| {
            Error::InvalidResponse {
                detail: "initialize returned no result".into(),
            }
        })?)?;

        info!(
            agent = %self.agent_name,
            protocol = %result.protocol_version,
            server = %result.server_info.name,
            "MCP agent initialized"
        );
        self.server_info = Some(result);

        self.transport
            .notify("notifications/initialized", None, LIST_TIMEOUT)
            .await?;
        self.state = McpClientState::Ready;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != McpClientState::Ready {
            return Err(Error::Message {
                message: format!(
                    "MCP client for '{}' is not ready (state: {:?})",
                    self.agent_name, self.state
                ),
            });
        }
        Ok(())
    }

    /// Run a request, closing the client on transport-level failure.
    async fn guarded<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result
            && e.is_transport()
        {
            self.state = McpClientState::Closed;
            self.transport.close_session();
        }
        result
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn state(&self) -> McpClientState {
        self.state
    }

    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.as_ref()
    }

    pub async fn list_tools(&mut self) -> Result<Vec<McpToolDef>> {
        self.ensure_ready()?;
        let result = self.transport.request("tools/list", None, LIST_TIMEOUT).await;
        let resp = self.guarded(result).await?;
        let list: ToolsListResult = match resp.result {
            Some(value) => serde_json::from_value(value)?,
            None => ToolsListResult::default(),
        };
        debug!(agent = %self.agent_name, count = list.tools.len(), "fetched tools");
        Ok(list.tools)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<ToolsCallResult> {
        self.ensure_ready()?;
        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };
        let result = self
            .transport
            .request(
                "tools/call",
                Some(serde_json::to_value(&params)?),
                timeout.unwrap_or(CALL_TIMEOUT),
            )
            .await;
        let resp = self.guarded(result).await?;
        let result: ToolsCallResult = serde_json::from_value(resp.result.ok_or_else(|| {
            Error::InvalidResponse {
                detail: "tools/call returned no result".into(),
            }
        })?)?;
        Ok(result)
    }

    pub async fn list_resources(&mut self) -> Result<Vec<McpResourceDef>> {
        self.ensure_ready()?;
        let result = self
            .transport
            .request("resources/list", None, LIST_TIMEOUT)
            .await;
        let resp = self.guarded(result).await?;
        let list: ResourcesListResult = match resp.result {
            Some(value) => serde_json::from_value(value)?,
            None => ResourcesListResult::default(),
        };
        Ok(list.resources)
    }

    pub async fn read_resource(&mut self, uri: &str) -> Result<ResourcesReadResult> {
        self.ensure_ready()?;
        let params = ResourcesReadParams { uri: uri.into() };
        let result = self
            .transport
            .request(
                "resources/read",
                Some(serde_json::to_value(&params)?),
                CALL_TIMEOUT,
            )
            .await;
        let resp = self.guarded(result).await?;
        let read: ResourcesReadResult = serde_json::from_value(resp.result.ok_or_else(|| {
            Error::InvalidResponse {
                detail: "resources/read returned no result".into(),
            }
        })?)?;
        Ok(read)
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let result = self.transport.request("ping", None, LIST_TIMEOUT).await;
        self.guarded(result).await?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.state = McpClientState::Closed;
        self.transport.close_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_body() -> &'static str {
        r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"sim"}}}"#
    }

    async fn connected(server: &mockito::ServerGuard) -> McpAgentClient {
        let mut client = McpAgentClient {
            agent_name: "simulator".into(),
            transport: HttpTransport::new(format!("{}/mcp", server.url())),
            state: McpClientState::Connected,
            server_info: None,
        };
        client.initialize().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_handshake_then_list_tools() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"initialize"}"#.to_string(),
            ))
            .with_header("mcp-session-id", "s1")
            .with_body(init_body())
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"notifications/initialized"}"#.to_string(),
            ))
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"tools/list"}"#.to_string(),
            ))
            .with_body(
                r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"run_simulation","inputSchema":{}}]}}"#,
            )
            .create_async()
            .await;

        let mut client = connected(&server).await;
        assert_eq!(client.state(), McpClientState::Ready);
        assert_eq!(
            client.server_info().unwrap().protocol_version,
            "2025-06-18"
        );

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "run_simulation");
    }

    #[tokio::test]
    async fn test_transport_failure_closes_client() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_body(init_body())
            .expect(2)
            .create_async()
            .await;
        let mut client = connected(&server).await;

        // Replace the transport with one pointing at a dead port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        client.transport = HttpTransport::for_host_port(port);

        let err = client.ping().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(client.state(), McpClientState::Closed);

        // Further calls are rejected without touching the network.
        let err = client.list_tools().await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }
}
