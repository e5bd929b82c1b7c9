//! `start`, `stop`, `restart`, `shutdown`, `destroy`, `clean`, `status`,
//! and the hidden `router` entry that runs the gateway in-process.

use std::sync::Arc;

use anyhow::{Context, bail};

use {
    ploinky_gateway::{GatewayState, auth::AuthMode},
    ploinky_manifest::Manifest,
    ploinky_runtime::{AgentServiceManager, CliRuntime, ContainerRuntime, service::AgentIdentity},
    ploinky_workspace::{
        AgentsRegistry, RecordStatus, RoutingTable, SecretStore, WorkspacePaths, layout,
        repos::{self, EnabledRepos},
    },
};

use super::workspace;
use crate::supervisor;

pub fn service_manager(paths: &WorkspacePaths) -> anyhow::Result<AgentServiceManager> {
    let runtime = Arc::new(CliRuntime::detect()?);
    Ok(AgentServiceManager::new(runtime, paths.clone()))
}

/// Materialise every enabled agent, regenerate the routing table, and spawn
/// the router.
pub async fn start(static_agent: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let paths = workspace()?;
    layout::init_workspace(&paths)?;
    let mut registry = AgentsRegistry::load(&paths)?;

    if let Some(agent) = static_agent {
        if registry.by_agent_name(&agent).is_none() {
            bail!("static agent '{agent}' is not enabled; run: ploinky enable agent {agent}");
        }
        registry.config.static_agent = Some(agent);
    }
    if let Some(port) = port {
        registry.config.router_port = Some(port);
    }
    let port = registry
        .config
        .router_port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .context("no router port configured; run: ploinky start <staticAgent> <port>")?;
    registry.save()?;

    // Provision every enabled agent before the router comes up.
    let manager = service_manager(&paths)?;
    let store = SecretStore::new(paths.clone());
    let repos_list = EnabledRepos::load(&paths)?;
    let profile = repos::active_profile(&paths)?;
    let records: Vec<_> = registry.records.values().cloned().collect();
    for record in records {
        let lookup = format!("{}/{}", record.repo_name, record.source_agent_dir());
        let (repo, agent, manifest_path) = repos::find_agent(&paths, &repos_list, &lookup)?;
        let manifest = Manifest::load(&manifest_path)?;
        let identity = AgentIdentity {
            alias: record.agent_name.clone(),
            repo,
            agent,
            run_mode: record.run_mode,
        };
        manager
            .provision(&mut registry, &store, &identity, &manifest, profile)
            .await
            .with_context(|| format!("provisioning agent '{}' failed", record.agent_name))?;
        println!("agent '{}' ready", record.agent_name);
    }

    let routing = RoutingTable::regenerate(&registry, port);
    routing.save(&paths)?;

    let pid = supervisor::spawn_router(&paths, port)?;
    println!("router started on http://127.0.0.1:{port} (pid {pid})");
    Ok(())
}

/// Stop the router; containers keep running.
pub fn stop() -> anyhow::Result<()> {
    let paths = workspace()?;
    if supervisor::stop_router(&paths)? {
        println!("router stopped");
    } else {
        println!("router was not running");
    }
    Ok(())
}

/// `restart` / `restart router` restarts the router process;
/// `restart <agent>` stop+starts that agent's container.
pub async fn restart(target: Option<&str>) -> anyhow::Result<()> {
    let paths = workspace()?;
    match target {
        None | Some("router") => {
            let registry = AgentsRegistry::load(&paths)?;
            let port = registry
                .config
                .router_port
                .context("no router port configured; run start first")?;
            supervisor::stop_router(&paths)?;
            let pid = supervisor::spawn_router(&paths, port)?;
            println!("router restarted (pid {pid})");
        },
        Some(agent) => {
            let mut registry = AgentsRegistry::load(&paths)?;
            let Some(record) = registry.by_agent_name(agent).cloned() else {
                bail!("agent '{agent}' is not enabled");
            };
            let manager = service_manager(&paths)?;
            manager.runtime().stop(&record.container_name).await?;
            manager.runtime().start(&record.container_name).await?;
            if let Some(record) = registry.get_mut(&record.container_name) {
                record.status = RecordStatus::Ready;
            }
            registry.save()?;
            println!("agent '{agent}' restarted");
        },
    }
    Ok(())
}

/// `shutdown` removes containers and records; `destroy` additionally wipes
/// workspace state (routing, logs, blobs, run files — the secret store and
/// enabled repos survive).
pub async fn shutdown(destroy: bool) -> anyhow::Result<()> {
    let paths = workspace()?;
    supervisor::stop_router(&paths)?;

    let mut registry = AgentsRegistry::load(&paths)?;
    if let Ok(manager) = service_manager(&paths) {
        for name in registry.records.keys().cloned().collect::<Vec<_>>() {
            if let Err(e) = manager.remove_agent(&name).await {
                tracing::warn!(container = %name, error = %e, "container removal failed");
            }
        }
    }
    for record in registry.records.values() {
        layout::teardown_agent(&paths, &record.agent_name)?;
    }
    registry.records.clear();
    registry.save()?;

    if destroy {
        for path in [
            paths.agents_registry(),
            paths.routing(),
            paths.running_dir(),
            paths.logs_dir(),
            paths.blobs_dir(),
        ] {
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
        println!("workspace destroyed");
    } else {
        println!("shutdown complete");
    }
    Ok(())
}

/// Remove stopped containers and registry records whose container is gone.
pub async fn clean() -> anyhow::Result<()> {
    let paths = workspace()?;
    let mut registry = AgentsRegistry::load(&paths)?;
    let manager = service_manager(&paths)?;
    let mut removed = 0usize;
    for name in registry.records.keys().cloned().collect::<Vec<_>>() {
        match manager.runtime().inspect(&name).await? {
            Some(ploinky_runtime::ContainerState::Running) => {},
            Some(_) => {
                manager.remove_agent(&name).await?;
                registry.remove(&name);
                removed += 1;
            },
            None => {
                registry.remove(&name);
                removed += 1;
            },
        }
    }
    registry.save()?;
    println!("cleaned {removed} stale record(s)");
    Ok(())
}

pub async fn status() -> anyhow::Result<()> {
    let paths = workspace()?;
    let registry = AgentsRegistry::load(&paths)?;
    let routing = RoutingTable::load(&paths)?;

    match supervisor::running_router(&paths) {
        Some(pid) => println!("router: running (pid {pid}, port {})", routing.port),
        None => println!("router: stopped"),
    }
    if let Some(static_agent) = &registry.config.static_agent {
        println!("static agent: {static_agent}");
    }
    println!("profile: {}", repos::active_profile(&paths)?);

    if registry.records.is_empty() {
        println!("agents: none enabled");
        return Ok(());
    }
    let runtime = CliRuntime::detect().ok();
    for record in registry.records.values() {
        let observed = match &runtime {
            Some(rt) => match rt.inspect(&record.container_name).await {
                Ok(Some(state)) => format!("{state:?}").to_lowercase(),
                Ok(None) => "missing".to_string(),
                Err(_) => "unknown".to_string(),
            },
            None => "unknown".to_string(),
        };
        println!(
            "  {} [{}] container={} state={} record={:?}",
            record.agent_name,
            record.repo_name,
            record.container_name,
            observed,
            record.status,
        );
    }
    Ok(())
}

/// The hidden `router` subcommand: run the gateway until shutdown.
pub async fn run_router(port: u16) -> anyhow::Result<()> {
    let paths = workspace()?;
    let runtime = Arc::new(CliRuntime::detect()?);

    // Regenerate the routing table from the registry on every start.
    let registry = AgentsRegistry::load(&paths)?;
    let routing = RoutingTable::regenerate(&registry, port);
    routing.save(&paths)?;

    let auth_mode = if std::env::var("PLOINKY_OIDC").is_ok() {
        AuthMode::Oidc
    } else {
        AuthMode::Token
    };
    let state = Arc::new(GatewayState::new(paths, runtime, auth_mode));
    ploinky_gateway::serve(state, port).await?;
    Ok(())
}
