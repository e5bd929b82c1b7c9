//! Shared router state. One `GatewayState` value owns the session and PTY
//! tables; handlers reach it through `Arc`, never through globals.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

use {
    ploinky_runtime::ContainerRuntime,
    ploinky_workspace::{AgentsRegistry, RoutingTable, SecretStore, WorkspacePaths},
};

use crate::{
    aggregate::RouterSession,
    auth::AuthMode,
    error::{Error, Result},
    logs::LifecycleLog,
    pty::PtyBroker,
};

struct CachedRouting {
    table: RoutingTable,
    loaded_at: Option<Instant>,
}

pub struct GatewayState {
    pub started_at: Instant,
    pub paths: WorkspacePaths,
    pub store: SecretStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub auth_mode: AuthMode,
    pub log: LifecycleLog,
    pub pty: PtyBroker,
    /// Aggregator sessions, expired lazily on access.
    pub sessions: RwLock<HashMap<String, Arc<RouterSession>>>,
    /// Upstream `mcp-session-id` per `(router session, agent)` for the
    /// per-agent JSON-RPC proxy.
    pub proxy_sessions: RwLock<HashMap<String, String>>,
    /// Shared client for proxying to agent containers.
    pub http: reqwest::Client,
    routing: RwLock<CachedRouting>,
    routing_ttl: Duration,
}

impl GatewayState {
    pub fn new(
        paths: WorkspacePaths,
        runtime: Arc<dyn ContainerRuntime>,
        auth_mode: AuthMode,
    ) -> Self {
        let store = SecretStore::new(paths.clone());
        let log = LifecycleLog::new(paths.router_log());
        // PLOINKY_CONFIG_CACHE_TTL seconds; 0 reloads on every access.
        let routing_ttl = std::env::var("PLOINKY_CONFIG_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(2));
        Self {
            started_at: Instant::now(),
            paths,
            store,
            runtime,
            auth_mode,
            log,
            pty: PtyBroker::new(),
            sessions: RwLock::new(HashMap::new()),
            proxy_sessions: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
            routing: RwLock::new(CachedRouting {
                table: RoutingTable::default(),
                loaded_at: None,
            }),
            routing_ttl,
        }
    }

    /// The routing table, re-read from disk when the cache TTL lapses.
    pub async fn routing(&self) -> Result<RoutingTable> {
        {
            let cached = self.routing.read().await;
            if let Some(loaded_at) = cached.loaded_at
                && !self.routing_ttl.is_zero()
                && loaded_at.elapsed() < self.routing_ttl
            {
                return Ok(cached.table.clone());
            }
        }
        let table = RoutingTable::load(&self.paths)?;
        let mut cached = self.routing.write().await;
        cached.table = table.clone();
        cached.loaded_at = Some(Instant::now());
        Ok(table)
    }

    /// Host port for an agent, from the routing table.
    pub async fn agent_host_port(&self, agent: &str) -> Result<u16> {
        let routing = self.routing().await?;
        routing
            .routes
            .get(agent)
            .map(|r| r.host_port)
            .ok_or_else(|| Error::AgentNotFound {
                agent: agent.to_string(),
            })
    }

    pub fn registry(&self) -> Result<AgentsRegistry> {
        Ok(AgentsRegistry::load(&self.paths)?)
    }

    pub async fn live_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every aggregator session and PTY tab (graceful shutdown).
    pub async fn close_all(&self) {
        self.sessions.write().await.clear();
        self.proxy_sessions.write().await.clear();
        self.pty.dispose_all();
    }
}
