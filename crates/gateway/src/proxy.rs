//! Per-agent proxies: `/mcps/<agent>/mcp` (JSON-RPC passthrough with its
//! own upstream session store) and `/mcps/<agent>/task` (GET query proxy
//! to the agent's `getTaskStatus`).

use std::{sync::Arc, time::Duration};

use {
    axum::{
        extract::{Path, RawQuery, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Json, Response},
    },
    serde_json::{Value, json},
    tracing::debug,
};

use ploinky_mcp::types::SESSION_HEADER;

use crate::{auth::error_response, state::GatewayState};

const PROXY_TIMEOUT: Duration = Duration::from_secs(60);

/// URL-decode the agent path segment and strip a `repo:`/`repo/`
/// disambiguator: the value before the separator names the repo.
pub fn parse_agent_segment(raw: &str) -> (Option<String>, String) {
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    for separator in [':', '/'] {
        if let Some((repo, agent)) = decoded.split_once(separator)
            && !repo.is_empty()
            && !agent.is_empty()
        {
            return (Some(repo.to_string()), agent.to_string());
        }
    }
    (None, decoded)
}

/// `POST /mcps/<agent>/mcp` — forward one JSON-RPC request to the agent.
pub async fn agent_mcp_handler(
    State(state): State<Arc<GatewayState>>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let (_repo, agent) = parse_agent_segment(&agent);

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": format!("parse error: {e}") },
            }))
            .into_response();
        },
    };
    if parsed.is_array() {
        return Json(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": -32600, "message": "Batch requests are not supported" },
        }))
        .into_response();
    }

    let host_port = match state.agent_host_port(&agent).await {
        Ok(port) => port,
        Err(e) => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": parsed.get("id").cloned().unwrap_or(Value::Null),
                "error": { "code": -32000, "message": e.to_string() },
            }))
            .into_response();
        },
    };

    // The upstream session store is keyed by the caller's aggregator
    // session so parallel router sessions do not share agent sessions.
    let caller_session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    let store_key = format!("{caller_session}:{agent}");

    let upstream_session = state.proxy_sessions.read().await.get(&store_key).cloned();

    let mut request = state
        .http
        .post(format!("http://127.0.0.1:{host_port}/mcp"))
        .timeout(PROXY_TIMEOUT)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(session) = upstream_session {
        request = request.header(SESSION_HEADER, session);
    }

    let upstream = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            let code = if e.is_timeout() {
                "transport_timeout"
            } else if e.is_connect() {
                "transport_refused"
            } else {
                "transport_error"
            };
            return Json(json!({
                "jsonrpc": "2.0",
                "id": parsed.get("id").cloned().unwrap_or(Value::Null),
                "error": { "code": -32000, "message": format!("{code}: {e}") },
            }))
            .into_response();
        },
    };

    if let Some(session) = upstream
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        debug!(agent = %agent, "captured upstream mcp session");
        state
            .proxy_sessions
            .write()
            .await
            .insert(store_key, session.to_string());
    }

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let payload = upstream.bytes().await.unwrap_or_default();
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response()
}

/// `GET /mcps/<agent>/task?...` — transparent query proxy to
/// `http://127.0.0.1:<hostPort>/getTaskStatus?...`.
pub async fn agent_task_handler(
    State(state): State<Arc<GatewayState>>,
    Path(agent): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let (_repo, agent) = parse_agent_segment(&agent);
    let host_port = match state.agent_host_port(&agent).await {
        Ok(port) => port,
        Err(e) => {
            return error_response(StatusCode::NOT_FOUND, e.code(), &e.to_string());
        },
    };
    let mut url = format!("http://127.0.0.1:{host_port}/getTaskStatus");
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }
    match state.http.get(&url).timeout(PROXY_TIMEOUT).send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let payload = upstream.bytes().await.unwrap_or_default();
            (status, [(header::CONTENT_TYPE, content_type)], payload).into_response()
        },
        Err(e) => error_response(StatusCode::BAD_GATEWAY, "transport_error", &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_segment_plain() {
        assert_eq!(parse_agent_segment("simulator"), (None, "simulator".into()));
    }

    #[test]
    fn test_parse_agent_segment_repo_disambiguators() {
        assert_eq!(
            parse_agent_segment("demo:simulator"),
            (Some("demo".into()), "simulator".into())
        );
        assert_eq!(
            parse_agent_segment("demo%2Fsimulator"),
            (Some("demo".into()), "simulator".into())
        );
    }

    #[test]
    fn test_parse_agent_segment_url_decoding() {
        assert_eq!(
            parse_agent_segment("my%20agent"),
            (None, "my agent".into())
        );
    }
}
