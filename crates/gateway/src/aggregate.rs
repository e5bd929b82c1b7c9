//! Router MCP aggregator.
//!
//! `initialize` discovers every routed agent's tool and resource catalogue
//! in parallel and exposes them under qualified names: `<agent>:<tool>` for
//! tools, `agent://<agent><originalUri>` for resources. Calls are routed to
//! the owning agent; results are never cached. Sessions expire lazily 30
//! minutes after last use.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use {
    axum::{
        extract::State,
        http::HeaderMap,
        response::{IntoResponse, Json, Response},
    },
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use {
    ploinky_mcp::{McpAgentClient, PROTOCOL_VERSION, types::SESSION_HEADER},
    ploinky_workspace::RecordStatus,
};

use crate::state::GatewayState;

pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

// ── Session model ────────────────────────────────────────────────────────────

pub struct SessionAgent {
    pub base_url: String,
    pub host_port: u16,
    pub available: bool,
    pub tools: Vec<ploinky_mcp::McpToolDef>,
    pub resources: Vec<ploinky_mcp::McpResourceDef>,
    /// One in-flight request per agent connection: callers take the mutex
    /// for the duration of their JSON-RPC exchange.
    client: Option<Arc<Mutex<McpAgentClient>>>,
}

/// Everything about a session except `last_access` is immutable after
/// initialize, so the session itself is shared without an outer lock.
pub struct RouterSession {
    pub id: String,
    pub created_at: Instant,
    last_access: StdMutex<Instant>,
    /// Ordered mapping captured at initialize.
    pub agents: BTreeMap<String, SessionAgent>,
    /// Qualified resource URI → (agent, original URI).
    resource_index: HashMap<String, (String, String)>,
}

impl RouterSession {
    pub fn expired(&self, now: Instant) -> bool {
        let last = self
            .last_access
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|p| *p.into_inner());
        now.duration_since(last) > SESSION_TTL
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_access.lock() {
            *last = Instant::now();
        }
    }

    fn aggregated_tools(&self) -> Vec<Value> {
        let mut tools = Vec::new();
        for (agent, entry) in &self.agents {
            if !entry.available {
                continue;
            }
            for tool in &entry.tools {
                tools.push(json!({
                    "name": qualify_tool(agent, &tool.name),
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                }));
            }
        }
        tools
    }

    fn aggregated_resources(&self) -> Vec<Value> {
        let mut resources = Vec::new();
        for (agent, entry) in &self.agents {
            if !entry.available {
                continue;
            }
            for res in &entry.resources {
                resources.push(json!({
                    "uri": qualify_resource(agent, &res.uri),
                    "name": res.name,
                    "description": res.description,
                    "mimeType": res.mime_type,
                }));
            }
        }
        resources
    }

    /// The shared client for an available agent, or the JSON-RPC error to
    /// return instead.
    fn client_for(&self, agent: &str, id: &Value) -> Result<Arc<Mutex<McpAgentClient>>, Value> {
        match self.agents.get(agent) {
            None => Err(rpc_error(id.clone(), -32000, "Agent not found")),
            Some(entry) if !entry.available => Err(rpc_error(
                id.clone(),
                -32000,
                format!("Agent unavailable: {agent}"),
            )),
            Some(entry) => entry.client.clone().ok_or_else(|| {
                rpc_error(id.clone(), -32000, format!("Agent unavailable: {agent}"))
            }),
        }
    }
}

// ── Qualified names ─────────────────────────────────────────────────────────

pub fn qualify_tool(agent: &str, tool: &str) -> String {
    format!("{agent}:{tool}")
}

/// Split `<agent>:<tool>`; the agent part must be non-empty and the
/// remainder is the tool name verbatim.
pub fn parse_qualified_tool(name: &str) -> Option<(&str, &str)> {
    let (agent, tool) = name.split_once(':')?;
    if agent.is_empty() || tool.is_empty() {
        return None;
    }
    Some((agent, tool))
}

pub fn qualify_resource(agent: &str, uri: &str) -> String {
    format!("agent://{agent}{uri}")
}

// ── JSON-RPC plumbing ───────────────────────────────────────────────────────

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

const SESSION_ERROR: &str = "Session not found or expired";

// ── Handler ─────────────────────────────────────────────────────────────────

/// `POST /mcp` — the aggregated MCP endpoint.
pub async fn mcp_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(rpc_error(Value::Null, -32700, format!("parse error: {e}")))
                .into_response();
        },
    };
    if parsed.is_array() {
        return Json(rpc_error(
            Value::Null,
            -32600,
            "Batch requests are not supported",
        ))
        .into_response();
    }
    let id = parsed.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = parsed.get("method").and_then(Value::as_str) else {
        return Json(rpc_error(id, -32600, "missing method")).into_response();
    };
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);

    if method == "initialize" {
        return initialize(state, id).await;
    }
    if method == "notifications/initialized" {
        return Json(rpc_result(id, json!({}))).into_response();
    }

    let session = match lookup_session(&state, &headers).await {
        Some(session) => session,
        None => return Json(rpc_error(id, -32000, SESSION_ERROR)).into_response(),
    };
    session.touch();

    let response = match method {
        "ping" => rpc_result(id, json!({})),
        "tools/list" => rpc_result(id, json!({ "tools": session.aggregated_tools() })),
        "resources/list" => {
            rpc_result(id, json!({ "resources": session.aggregated_resources() }))
        },
        "tools/call" => call_tool(&session, id, params).await,
        "resources/read" => read_resource(&session, id, params).await,
        other => rpc_error(id, -32601, format!("method not found: {other}")),
    };
    Json(response).into_response()
}

/// Resolve the caller's session, sweeping expired ones on the way.
async fn lookup_session(state: &GatewayState, headers: &HeaderMap) -> Option<Arc<RouterSession>> {
    let session_id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())?;
    let mut sessions = state.sessions.write().await;
    let now = Instant::now();
    sessions.retain(|_, s| !s.expired(now));
    sessions.get(session_id).cloned()
}

async fn initialize(state: Arc<GatewayState>, id: Value) -> Response {
    let routing = match state.routing().await {
        Ok(routing) => routing,
        Err(e) => {
            return Json(rpc_error(id, -32000, format!("routing unavailable: {e}")))
                .into_response();
        },
    };
    let unhealthy: Vec<String> = state
        .registry()
        .map(|reg| {
            reg.records
                .values()
                .filter(|r| r.status == RecordStatus::Unhealthy)
                .map(|r| r.agent_name.clone())
                .collect()
        })
        .unwrap_or_default();

    let discoveries = routing.routes.iter().map(|(agent, route)| {
        let agent = agent.clone();
        let host_port = route.host_port;
        let skip = unhealthy.contains(&agent);
        async move {
            if skip {
                debug!(agent = %agent, "skipping unhealthy agent at initialize");
                return (agent, host_port, None, Vec::new(), Vec::new());
            }
            match McpAgentClient::connect(&agent, host_port).await {
                Ok(mut client) => {
                    let tools = client.list_tools().await.unwrap_or_default();
                    let resources = client.list_resources().await.unwrap_or_default();
                    (agent, host_port, Some(client), tools, resources)
                },
                Err(e) => {
                    warn!(agent = %agent, error = %e, "agent unreachable at initialize");
                    (agent, host_port, None, Vec::new(), Vec::new())
                },
            }
        }
    });
    let results = futures::future::join_all(discoveries).await;

    let mut agents = BTreeMap::new();
    let mut resource_index = HashMap::new();
    for (agent, host_port, client, tools, resources) in results {
        for res in &resources {
            resource_index.insert(
                qualify_resource(&agent, &res.uri),
                (agent.clone(), res.uri.clone()),
            );
        }
        agents.insert(agent.clone(), SessionAgent {
            base_url: format!("http://127.0.0.1:{host_port}/mcp"),
            host_port,
            available: client.is_some(),
            tools,
            resources,
            client: client.map(|c| Arc::new(Mutex::new(c))),
        });
    }

    let session = Arc::new(RouterSession {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: Instant::now(),
        last_access: StdMutex::new(Instant::now()),
        agents,
        resource_index,
    });
    let session_id = session.id.clone();
    info!(
        session = %session_id,
        agents = session.agents.len(),
        available = session.agents.values().filter(|a| a.available).count(),
        "router session initialized"
    );
    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), session);

    let result = rpc_result(id, json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {}, "resources": {} },
        "serverInfo": {
            "name": "ploinky-router",
            "version": env!("CARGO_PKG_VERSION"),
        },
    }));
    ([(SESSION_HEADER, session_id)], Json(result)).into_response()
}

async fn call_tool(session: &RouterSession, id: Value, params: Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return rpc_error(id, -32602, "missing tool name");
    };
    let Some((agent, tool)) = parse_qualified_tool(name) else {
        return rpc_error(
            id,
            -32602,
            format!("tool name must be qualified as <agent>:<tool>, got '{name}'"),
        );
    };
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let client = match session.client_for(agent, &id) {
        Ok(client) => client,
        Err(error) => return error,
    };
    let mut client = client.lock().await;
    match client.call_tool(tool, arguments, None).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => rpc_result(id, value),
            Err(e) => rpc_error(id, -32000, format!("unencodable tool result: {e}")),
        },
        Err(e) => rpc_error(id, -32000, format!("{agent}:{tool} failed: {e}")),
    }
}

async fn read_resource(session: &RouterSession, id: Value, params: Value) -> Value {
    let Some(uri) = params.get("uri").and_then(Value::as_str) else {
        return rpc_error(id, -32602, "missing resource uri");
    };
    if !uri.starts_with("agent://") {
        return rpc_error(
            id,
            -32602,
            format!("resource uri must use the agent:// scheme, got '{uri}'"),
        );
    }
    let Some((agent, original_uri)) = session.resource_index.get(uri).cloned() else {
        return rpc_error(id, -32000, format!("resource not found: {uri}"));
    };

    let client = match session.client_for(&agent, &id) {
        Ok(client) => client,
        Err(error) => return error,
    };
    let mut client = client.lock().await;
    match client.read_resource(&original_uri).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => rpc_result(id, value),
            Err(e) => rpc_error(id, -32000, format!("unencodable resource: {e}")),
        },
        Err(e) => rpc_error(id, -32000, format!("reading {agent} resource failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_session() -> RouterSession {
        RouterSession {
            id: "s".into(),
            created_at: Instant::now(),
            last_access: StdMutex::new(Instant::now()),
            agents: BTreeMap::new(),
            resource_index: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_qualified_tool() {
        assert_eq!(
            parse_qualified_tool("simulator:run_simulation"),
            Some(("simulator", "run_simulation"))
        );
        // The tool part keeps any further colons verbatim.
        assert_eq!(parse_qualified_tool("a:b:c"), Some(("a", "b:c")));
        assert_eq!(parse_qualified_tool("noseparator"), None);
        assert_eq!(parse_qualified_tool(":tool"), None);
        assert_eq!(parse_qualified_tool("agent:"), None);
    }

    #[test]
    fn test_qualify_roundtrip() {
        for (agent, tool) in [("sim", "run"), ("a_b", "x.y")] {
            let qualified = qualify_tool(agent, tool);
            assert_eq!(parse_qualified_tool(&qualified), Some((agent, tool)));
        }
    }

    #[test]
    fn test_qualify_resource() {
        assert_eq!(
            qualify_resource("simulator", "/reports/latest"),
            "agent://simulator/reports/latest"
        );
    }

    #[test]
    fn test_session_expiry() {
        let session = empty_session();
        assert!(!session.expired(Instant::now()));
        assert!(session.expired(Instant::now() + SESSION_TTL + Duration::from_secs(1)));
        // Touching refreshes the deadline.
        session.touch();
        assert!(!session.expired(Instant::now() + Duration::from_secs(1)));
    }

    #[test]
    fn test_aggregated_listing_skips_unavailable() {
        let mut session = empty_session();
        session.agents.insert("up".to_string(), SessionAgent {
            base_url: "http://127.0.0.1:1/mcp".into(),
            host_port: 1,
            available: true,
            tools: vec![ploinky_mcp::McpToolDef {
                name: "go".into(),
                description: None,
                input_schema: json!({}),
            }],
            resources: Vec::new(),
            client: None,
        });
        session.agents.insert("down".to_string(), SessionAgent {
            base_url: "http://127.0.0.1:2/mcp".into(),
            host_port: 2,
            available: false,
            tools: vec![ploinky_mcp::McpToolDef {
                name: "hidden".into(),
                description: None,
                input_schema: json!({}),
            }],
            resources: Vec::new(),
            client: None,
        });
        let tools = session.aggregated_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "up:go");
    }

    #[test]
    fn test_unknown_agent_error_shape() {
        let session = empty_session();
        let err = session.client_for("ghost", &json!(1)).unwrap_err();
        assert_eq!(err["error"]["code"], -32000);
        assert_eq!(err["error"]["message"], "Agent not found");
    }
}
