//! HTTP transport: JSON-RPC 2.0 POSTs against an agent's `/mcp` endpoint.
//!
//! The server assigns a session id on `initialize`; we capture it from the
//! `mcp-session-id` response header and echo it on every subsequent request.
//! At most one request is in flight per transport.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, SESSION_HEADER},
};

#[derive(Debug)]
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// Transport for `http://127.0.0.1:<host_port>/mcp`.
    pub fn for_host_port(host_port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{host_port}/mcp"))
    }

    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|g| g.clone())
    }

    /// Drop the captured session id. Called on transport failure and on
    /// client shutdown.
    pub fn close_session(&self) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = None;
        }
    }

    fn classify(&self, method: &str, started: Instant, err: &reqwest::Error) -> Error {
        let elapsed_ms = started.elapsed().as_millis();
        self.close_session();
        if err.is_timeout() {
            Error::TransportTimeout {
                method: method.to_string(),
                elapsed_ms,
            }
        } else if err.is_connect() {
            Error::TransportRefused {
                method: method.to_string(),
                elapsed_ms,
            }
        } else {
            Error::Transport {
                method: method.to_string(),
                elapsed_ms,
                detail: err.to_string(),
            }
        }
    }

    /// Send one JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let started = Instant::now();

        debug!(url = %self.url, method, id, "mcp request");

        let mut builder = self.http.post(&self.url).timeout(timeout).json(&req);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.classify(method, started, &e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            && let Ok(mut guard) = self.session_id.lock()
        {
            *guard = Some(session.to_string());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify(method, started, &e))?;

        let value: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
            Error::InvalidResponse {
                detail: format!("non-JSON body on '{method}': {e}"),
            }
        })?;
        if value.is_array() {
            return Err(Error::UnsupportedBatch);
        }

        let resp: JsonRpcResponse =
            serde_json::from_value(value).map_err(|e| Error::InvalidResponse {
                detail: format!("malformed response on '{method}': {e}"),
            })?;
        if resp.jsonrpc != "2.0" {
            return Err(Error::InvalidResponse {
                detail: format!("unexpected jsonrpc version '{}'", resp.jsonrpc),
            });
        }
        if resp.id != serde_json::Value::Number(id.into()) && !resp.id.is_null() {
            warn!(method, expected = id, got = %resp.id, "response id mismatch");
        }

        if let Some(err) = resp.error {
            return Err(Error::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp)
    }

    /// Send a notification; the server acknowledges with an empty response.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<()> {
        let notif = JsonRpcNotification {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        };

        trace!(url = %self.url, method, "mcp notification");

        let started = Instant::now();
        let mut builder = self.http.post(&self.url).timeout(timeout).json(&notif);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
            .send()
            .await
            .map_err(|e| self.classify(method, started, &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_header_captured_and_echoed() {
        let mut server = mockito::Server::new_async().await;
        let init = server
            .mock("POST", "/mcp")
            .with_header(SESSION_HEADER, "sess-42")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .create_async()
            .await;
        let follow_up = server
            .mock("POST", "/mcp")
            .match_header(SESSION_HEADER, "sess-42")
            .with_body(r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.url()));
        transport
            .request("initialize", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.session_id().as_deref(), Some("sess-42"));

        transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap();
        init.assert_async().await;
        follow_up.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.url()));
        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::Rpc { code, .. } => assert_eq!(code, -32601),
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_response_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_body(r#"[{"jsonrpc":"2.0","id":1,"result":{}}]"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.url()));
        let err = transport
            .request("initialize", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_batch");
    }

    #[tokio::test]
    async fn test_refused_classification_closes_session() {
        // Grab a port with no listener.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::for_host_port(port);
        let err = transport
            .request("ping", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transport_refused");
        assert!(transport.session_id().is_none());
    }
}
