//! HTTP entry point: route table, request pipeline, SSE terminal tabs,
//! graceful shutdown, and the in-process container monitor.

use std::{
    convert::Infallible,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use {
    axum::{
        Router,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode, header},
        response::{
            IntoResponse, Json, Response,
            sse::{Event, KeepAlive, Sse},
        },
        routing::{get, post},
    },
    futures::Stream,
    serde::Deserialize,
    tokio_stream::wrappers::UnboundedReceiverStream,
    tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer},
    tracing::{info, warn},
};

use {
    ploinky_manifest::Manifest,
    ploinky_runtime::{
        ContainerMonitor, HealthProber, RuntimeKind,
        health::{HealthEvent, ProbeKind, ProbeTransition},
        monitor::MonitorEvent,
    },
    ploinky_workspace::RecordStatus,
};

use crate::{
    aggregate, auth,
    auth::error_response,
    blobs,
    error::{Error, Result},
    logs,
    proxy,
    pty::{DisposeOnDrop, KEEPALIVE_INTERVAL, PtyCommand, Refusal},
    state::GatewayState,
};

const BROWSER_CLIENT_JS: &str = include_str!("assets/MCPBrowserClient.js");
const SHUTDOWN_GRACE_SECS: u64 = 10;

// ── Route table ─────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/MCPBrowserClient.js", get(browser_client_handler))
        .route("/mcp", post(aggregate::mcp_handler))
        .route("/mcps/{agent}/mcp", post(proxy::agent_mcp_handler))
        .route("/mcps/{agent}/task", get(proxy::agent_task_handler))
        .route("/blobs/{agent}", post(blobs::post_handler))
        .route("/blobs/{agent}/{id}", get(blobs::get_handler))
        .route("/{app}/stream", get(stream_handler))
        .route("/{app}/input", post(input_handler))
        .route("/{app}/resize", post(resize_handler))
        .route("/{app}/auth", post(auth::auth_handler))
        .route("/{app}/whoami", get(auth::whoami_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "internal", "no such route")
}

// ── Plain endpoints ─────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "app": std::env::var("APP_NAME").unwrap_or_else(|_| "ploinky".to_string()),
        "uptime": state.started_at.elapsed().as_secs(),
        "pid": std::process::id(),
        "memory": { "rssBytes": rss_bytes() },
        "activeSessions": {
            "mcp": state.live_session_count().await,
            "ptyTabs": state.pty.live_tabs(),
        },
    }))
    .into_response()
}

fn rss_bytes() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

async fn browser_client_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        BROWSER_CLIENT_JS,
    )
        .into_response()
}

// ── PTY endpoints ───────────────────────────────────────────────────────────

const PTY_APPS: &[&str] = &["webtty", "webchat"];

#[derive(Debug, Deserialize)]
struct TabQuery {
    #[serde(rename = "tabId")]
    tab_id: String,
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

/// Resolve (session key, tab id) for a PTY request, authenticating first.
fn pty_session(
    state: &GatewayState,
    app: &str,
    headers: &HeaderMap,
    query: &TabQuery,
) -> std::result::Result<(String, String), Response> {
    if !PTY_APPS.contains(&app) {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "internal",
            "unknown component",
        ));
    }
    let Some(identity) = auth::authenticate(state, app, headers) else {
        return Err(error_response(StatusCode::FORBIDDEN, "forbidden", "not authenticated"));
    };
    let session = query
        .session
        .clone()
        .unwrap_or_else(|| format!("{app}:{}", identity.id));
    Ok((session, query.tab_id.clone()))
}

/// Decide what a tab runs: webchat prefers the static agent's `cli` entry
/// executed in its container; webtty (and webchat without one) runs the
/// configured shell.
async fn pty_command(state: &GatewayState, app: &str) -> PtyCommand {
    if app == "webchat"
        && let Ok(routing) = state.routing().await
        && let Some(static_agent) = routing.static_agent
        && let Ok(registry) = state.registry()
        && let Some(record) = registry.by_agent_name(&static_agent)
    {
        let manifest_path = state
            .paths
            .repo_dir(&record.repo_name)
            .join(record.source_agent_dir())
            .join("manifest.json");
        if let Ok(manifest) = Manifest::load(&manifest_path)
            && let Some(cli) = manifest.cli
            && let Ok(kind) = RuntimeKind::detect()
        {
            return PtyCommand::ContainerExec {
                runtime_binary: kind.binary().to_string(),
                container: record.container_name.clone(),
                command: cli,
            };
        }
    }
    let shell = std::env::var("WEBTTY_SHELL")
        .or_else(|_| std::env::var("SHELL"))
        .unwrap_or_else(|_| "bash".to_string());
    PtyCommand::Shell(shell)
}

/// SSE stream that owns the tab's dispose guard.
struct TabStream {
    inner: UnboundedReceiverStream<Vec<u8>>,
    _guard: DisposeOnDrop,
}

impl Stream for TabStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                let frame = serde_json::json!({
                    "data": String::from_utf8_lossy(&chunk),
                });
                Poll::Ready(Some(Ok(Event::default().data(frame.to_string()))))
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    Path(app): Path<String>,
    Query(query): Query<TabQuery>,
    headers: HeaderMap,
) -> Response {
    let (session, tab) = match pty_session(&state, &app, &headers, &query) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    match state.pty.admit(&session, &tab, Instant::now()) {
        Ok(()) => {},
        Err(Refusal::GlobalCapacity) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "capacity",
                "terminal capacity exhausted",
            );
        },
        Err(Refusal::SessionCapacity) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "5")],
                Json(serde_json::json!({
                    "error": "rate_limited",
                    "detail": "session tab limit reached",
                })),
            )
                .into_response();
        },
        Err(Refusal::Reconnect) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "1")],
                Json(serde_json::json!({
                    "error": "rate_limited",
                    "detail": "reconnecting too fast",
                })),
            )
                .into_response();
        },
    }

    let command = pty_command(&state, &app).await;
    let rx = match state.pty.open(&session, &tab, &command) {
        Ok(rx) => rx,
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.code(), &e.to_string());
        },
    };

    let stream = TabStream {
        inner: UnboundedReceiverStream::new(rx),
        _guard: DisposeOnDrop {
            broker: Arc::clone(&state),
            session,
            tab,
        },
    };
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEPALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response()
}

async fn input_handler(
    State(state): State<Arc<GatewayState>>,
    Path(app): Path<String>,
    Query(query): Query<TabQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let (session, tab) = match pty_session(&state, &app, &headers, &query) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    match state.pty.write(&session, &tab, &body) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.code(), &e.to_string()),
    }
}

async fn resize_handler(
    State(state): State<Arc<GatewayState>>,
    Path(app): Path<String>,
    Query(query): Query<TabQuery>,
    headers: HeaderMap,
    Json(body): Json<ResizeBody>,
) -> Response {
    let (session, tab) = match pty_session(&state, &app, &headers, &query) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    match state.pty.resize(&session, &tab, body.cols, body.rows) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.code(), &e.to_string()),
    }
}

// ── Supervision wiring ──────────────────────────────────────────────────────

/// Start the container monitor and health probers inside the router process.
fn spawn_supervision(state: &Arc<GatewayState>) {
    let (monitor_tx, mut monitor_rx) = tokio::sync::mpsc::unbounded_channel();
    let monitor = ContainerMonitor::new(
        Arc::clone(&state.runtime),
        state.paths.clone(),
        monitor_tx,
    );
    tokio::spawn(monitor.run());

    let log = state.log.clone();
    tokio::spawn(async move {
        while let Some(event) = monitor_rx.recv().await {
            match event {
                MonitorEvent::RestartScheduled {
                    container_name,
                    delay,
                } => log.event("container_restart_scheduled", serde_json::json!({
                    "container": container_name,
                    "delayMs": delay.as_millis() as u64,
                })),
                MonitorEvent::Restarted { container_name } => {
                    log.event("container_restarted", serde_json::json!({
                        "container": container_name,
                    }));
                },
                MonitorEvent::RestartFailed {
                    container_name,
                    detail,
                } => log.event("container_restart_failed", serde_json::json!({
                    "container": container_name,
                    "detail": detail,
                })),
                MonitorEvent::BreakerTripped { container_name } => {
                    log.event("container_circuit_breaker_tripped", serde_json::json!({
                        "container": container_name,
                    }));
                },
            }
        }
    });

    let (health_tx, mut health_rx) = tokio::sync::mpsc::unbounded_channel();
    let prober = HealthProber::new(Arc::clone(&state.runtime), health_tx);
    if let Ok(registry) = state.registry() {
        for record in registry.records.values() {
            let manifest_path = state
                .paths
                .repo_dir(&record.repo_name)
                .join(record.source_agent_dir())
                .join("manifest.json");
            let Ok(manifest) = Manifest::load(&manifest_path) else {
                continue;
            };
            if let Some(health) = manifest.health {
                prober.spawn(&record.container_name, &health);
            }
        }
    }

    let health_state = Arc::clone(state);
    tokio::spawn(async move {
        while let Some(event) = health_rx.recv().await {
            handle_health_event(&health_state, event).await;
        }
    });
}

async fn handle_health_event(state: &GatewayState, event: HealthEvent) {
    let HealthEvent {
        container_name,
        kind,
        transition,
    } = event;
    match (kind, transition) {
        // A failing liveness probe stops the container; the monitor then
        // restarts it under the backoff budget.
        (ProbeKind::Liveness, ProbeTransition::BecameFailing) => {
            warn!(container = %container_name, "liveness probe failing, stopping container");
            state.log.event("liveness_failed", serde_json::json!({
                "container": container_name,
            }));
            if let Err(e) = state.runtime.stop(&container_name).await {
                warn!(container = %container_name, error = %e, "failed to stop unhealthy container");
            }
        },
        (ProbeKind::Readiness, ProbeTransition::BecameFailing) => {
            set_record_status(state, &container_name, RecordStatus::Unhealthy);
            state.log.event("readiness_failed", serde_json::json!({
                "container": container_name,
            }));
        },
        (ProbeKind::Readiness, ProbeTransition::BecamePassing) => {
            set_record_status(state, &container_name, RecordStatus::Ready);
        },
        _ => {},
    }
}

fn set_record_status(state: &GatewayState, container_name: &str, status: RecordStatus) {
    let Ok(mut registry) = state.registry() else {
        return;
    };
    if let Some(record) = registry.get_mut(container_name) {
        record.status = status;
        let _ = registry.save();
    }
}

// ── Serve & shutdown ────────────────────────────────────────────────────────

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut interrupt = signal(SignalKind::interrupt()).ok();
    let mut terminate = signal(SignalKind::terminate()).ok();
    let mut quit = signal(SignalKind::quit()).ok();

    tokio::select! {
        () = async {
            match interrupt.as_mut() {
                Some(sig) => { sig.recv().await; },
                None => std::future::pending().await,
            }
        } => {},
        () = async {
            match terminate.as_mut() {
                Some(sig) => { sig.recv().await; },
                None => std::future::pending().await,
            }
        } => {},
        () = async {
            match quit.as_mut() {
                Some(sig) => { sig.recv().await; },
                None => std::future::pending().await,
            }
        } => {},
    }
}

/// Bind, start supervision, and serve until a shutdown signal. Active
/// handlers get [`SHUTDOWN_GRACE_SECS`] to finish before a forced exit.
pub async fn serve(state: Arc<GatewayState>, port: u16) -> Result<()> {
    logs::install_crash_hook(state.log.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Listen {
            addr: addr.to_string(),
            detail: e.to_string(),
        })?;
    info!(%addr, "router listening");
    state.log.event("router_started", serde_json::json!({
        "port": port,
        "pid": std::process::id(),
    }));

    spawn_supervision(&state);

    let (sig_tx, mut sig_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = sig_tx.send(true);
    });

    // Force the exit code 1 path when draining overruns the grace window.
    let force_state = Arc::clone(&state);
    let mut force_rx = sig_rx.clone();
    tokio::spawn(async move {
        if force_rx.changed().await.is_err() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
        force_state.log.event("router_forced_exit", serde_json::json!({}));
        std::process::exit(1);
    });

    let app = build_router(Arc::clone(&state));
    let shutdown = async move {
        let _ = sig_rx.changed().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Message {
            message: format!("server error: {e}"),
        })?;

    state.close_all().await;
    state.log.event("router_stopped", serde_json::json!({}));
    info!("router stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMode;
    use ploinky_runtime::CliRuntime;
    use ploinky_workspace::WorkspacePaths;
    use tower::util::ServiceExt;

    fn test_state() -> (tempfile::TempDir, Arc<GatewayState>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(paths.dot_ploinky()).unwrap();
        let runtime = Arc::new(CliRuntime::new(RuntimeKind::Docker));
        let state = Arc::new(GatewayState::new(paths, runtime, AuthMode::Token));
        (dir, state)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["pid"].as_u64().is_some());
        assert_eq!(json["activeSessions"]["ptyTabs"], 0);
    }

    #[tokio::test]
    async fn test_browser_client_asset() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/MCPBrowserClient.js")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("application/javascript")
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_json() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/definitely/not/here")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mcp_requires_session_for_non_initialize() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], -32000);
        assert_eq!(json["error"]["message"], "Session not found or expired");
    }

    #[tokio::test]
    async fn test_mcp_batch_rejected() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], -32600);
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("Batch requests")
        );
    }

    #[tokio::test]
    async fn test_stream_requires_auth() {
        let (_dir, state) = test_state();
        state.store.set_env_var("WEBTTY_TOKEN", "tok").unwrap();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/webtty/stream?tabId=t1")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_whoami_reports_unauthenticated() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/webtty/whoami")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["authenticated"], false);
    }

    #[tokio::test]
    async fn test_auth_sets_cookie_then_whoami_sees_it() {
        let (_dir, state) = test_state();
        state.store.set_env_var("WEBTTY_TOKEN", "tok123").unwrap();
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/webtty/auth")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"token":"tok123"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));

        let cookie_pair = cookie.split(';').next().unwrap().to_string();
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/webtty/whoami")
                    .header(header::COOKIE, cookie_pair)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["authenticated"], true);
        assert_eq!(json["user"]["method"], "token");
    }

    #[tokio::test]
    async fn test_blob_store_roundtrip_with_range() {
        let (_dir, state) = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/blobs/simulator")
                    .header("content-type", "text/plain")
                    .body(axum::body::Body::from("hello blob world"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = json["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 48);
        assert_eq!(json["size"], 16);
        assert_eq!(json["mime"], "text/plain");
        let url = json["downloadUrl"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri(&url)
                    .header(header::RANGE, "bytes=6-9")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
            "bytes 6-9/16"
        );
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        assert_eq!(&body[..], b"blob");

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri(&url)
                    .header(header::RANGE, "bytes=99-100")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }
}
