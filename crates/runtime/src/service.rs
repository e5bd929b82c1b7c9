//! Agent service manager: computes the container spec for an agent,
//! reconciles it against the registry and the live runtime state, and runs
//! the ordered provisioning pipeline (create → hooks → start → installs →
//! hooks → ready).

use std::{fs, path::PathBuf, sync::Arc};

use tracing::{debug, info, warn};

use {
    ploinky_common::names,
    ploinky_manifest::{EffectiveProfile, Manifest, Profile, ResolvedEnvVar, resolve_env},
    ploinky_workspace::{
        AgentRecord, AgentsRegistry, Bind, PortBinding, RecordStatus, RunMode, SecretStore,
        WorkspacePaths, layout,
        ports::{PortAllocator, allocate_host_port},
    },
};

use crate::{
    adapter::{ContainerRuntime, ContainerState, is_wildcard_ip},
    error::{Error, Result},
    hooks::{self, HookEnv},
    install::{DependencyInstaller, install_dir},
    spec::ContainerSpec,
};

/// Identity of the agent being materialised.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Name in this workspace (the alias when enabled `as <alias>`).
    pub alias: String,
    pub repo: String,
    /// Directory name inside the repo.
    pub agent: String,
    pub run_mode: RunMode,
}

pub struct EnsureOutcome {
    pub container_name: String,
    pub record: AgentRecord,
    /// True when a container was (re)created this call.
    pub created: bool,
}

pub struct AgentServiceManager {
    runtime: Arc<dyn ContainerRuntime>,
    paths: WorkspacePaths,
}

impl AgentServiceManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, paths: WorkspacePaths) -> Self {
        Self { runtime, paths }
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Compute the container spec and reconcile container + registry record.
    /// Does not run hooks or installs; [`provision`](Self::provision) does.
    pub async fn ensure_agent_service(
        &self,
        registry: &mut AgentsRegistry,
        store: &SecretStore,
        identity: &AgentIdentity,
        manifest: &Manifest,
        profile: Profile,
    ) -> Result<EnsureOutcome> {
        let effective = ploinky_manifest::effective(manifest, profile)?;
        let container_name =
            names::container_name(&identity.repo, &identity.alias, self.paths.root());

        // A spec change that renames the container migrates the old record.
        if let Some(stale) = registry.find_stale_identity(
            &identity.repo,
            &identity.alias,
            self.paths.root(),
            &container_name,
        ) {
            let old = stale;
            if let Some(state) = self.runtime.inspect(&old).await? {
                debug!(old = %old, state = ?state, "removing renamed container");
                self.runtime.stop(&old).await?;
                self.runtime.rm(&old).await?;
            }
            registry.migrate(&old, &container_name);
        }

        let binds = self.compute_binds(identity, manifest, &effective)?;
        let env = self.compute_env(registry, store, identity, manifest, &effective)?;
        let ports = self.compute_ports(registry, manifest, &container_name)?;

        let spec = ContainerSpec {
            image: manifest.image.clone(),
            binds: binds.clone(),
            env: env.clone(),
            ports: ports.clone(),
            workdir: Some(self.paths.agent_work_dir(&identity.alias).display().to_string()),
            entrypoint: None,
            command: manifest
                .agent
                .as_ref()
                .map(|cmd| vec!["sh".to_string(), "-lc".to_string(), cmd.clone()])
                .unwrap_or_default(),
        };
        let spec_hash = spec.hash();

        let existing = registry.get(&container_name).cloned();
        let state = self.runtime.inspect(&container_name).await?;
        let unchanged = existing
            .as_ref()
            .map(|r| r.spec_hash == spec_hash)
            .unwrap_or(false);

        let created = match (state, unchanged) {
            (Some(ContainerState::Running), true) => {
                debug!(container = %container_name, "spec unchanged, reusing running container");
                false
            },
            (Some(_), true) => false,
            (Some(_), false) => {
                info!(container = %container_name, "spec changed, recreating container");
                self.runtime.stop(&container_name).await?;
                self.runtime.rm(&container_name).await?;
                self.runtime.create(&container_name, &spec).await?;
                true
            },
            (None, _) => {
                self.runtime.create(&container_name, &spec).await?;
                true
            },
        };

        let record = AgentRecord {
            container_name: container_name.clone(),
            agent_name: identity.alias.clone(),
            source_agent: identity.agent.clone(),
            repo_name: identity.repo.clone(),
            image: manifest.image.clone(),
            created_at: existing
                .map(|r| r.created_at)
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            project_path: self.paths.root().to_path_buf(),
            run_mode: identity.run_mode,
            profile: profile.to_string(),
            binds,
            env,
            ports,
            status: RecordStatus::Created,
            spec_hash,
        };
        registry.upsert(record.clone());
        registry.verify_port_uniqueness()?;
        registry.save()?;

        Ok(EnsureOutcome {
            container_name,
            record,
            created,
        })
    }

    /// The full ordered provisioning pipeline. On hook or install failure
    /// the record is marked failed and the container stopped but kept for
    /// inspection.
    pub async fn provision(
        &self,
        registry: &mut AgentsRegistry,
        store: &SecretStore,
        identity: &AgentIdentity,
        manifest: &Manifest,
        profile: Profile,
    ) -> Result<AgentRecord> {
        layout::init_workspace(&self.paths)?;
        layout::create_agent_symlinks(&self.paths, &identity.alias, &identity.repo, &identity.agent)?;

        let effective = ploinky_manifest::effective(manifest, profile)?;
        let container_name =
            names::container_name(&identity.repo, &identity.alias, self.paths.root());
        let outcome = match self
            .ensure_agent_service(registry, store, identity, manifest, profile)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // A pending record from `enable agent` surfaces the failure.
                if let Some(record) = registry.get_mut(&container_name) {
                    record.status = RecordStatus::Failed;
                    registry.save()?;
                }
                return Err(e);
            },
        };

        let result = self
            .run_pipeline(store, identity, &effective, &outcome, profile)
            .await;

        let status = match &result {
            Ok(()) => RecordStatus::Ready,
            Err(_) => RecordStatus::Failed,
        };
        if let Some(record) = registry.get_mut(&container_name) {
            record.status = status;
        }
        registry.save()?;

        match result {
            Ok(()) => {
                info!(container = %container_name, agent = %identity.alias, "agent ready");
                Ok(registry.get(&container_name).cloned().ok_or_else(|| {
                    Error::Message {
                        message: format!("record for '{container_name}' vanished"),
                    }
                })?)
            },
            Err(e) => {
                warn!(container = %container_name, error = %e, "provisioning failed, stopping container");
                self.runtime.stop(&container_name).await.ok();
                Err(e)
            },
        }
    }

    async fn run_pipeline(
        &self,
        store: &SecretStore,
        identity: &AgentIdentity,
        effective: &EffectiveProfile,
        outcome: &EnsureOutcome,
        profile: Profile,
    ) -> Result<()> {
        let container_name = &outcome.container_name;
        let secrets: Vec<(String, String)> = effective
            .secrets
            .iter()
            .map(|name| Ok((name.clone(), store.require_var(name)?)))
            .collect::<Result<_>>()?;
        let hook_env = HookEnv {
            profile: profile.to_string(),
            agent_name: identity.alias.clone(),
            repo_name: identity.repo.clone(),
            cwd: self.paths.root().display().to_string(),
            container_name: container_name.clone(),
            container_id: container_name.clone(),
            secrets,
        };

        if outcome.created
            && let Some(cmd) = &effective.hooks.hosthook_aftercreation
        {
            hooks::run_host_hook("hosthook_aftercreation", cmd, &hook_env).await?;
        }

        self.runtime.start(container_name).await?;
        self.verify_loopback(container_name, &outcome.record.ports).await?;

        let installer = DependencyInstaller::new(self.runtime.as_ref(), &self.paths);
        installer
            .ensure_dependencies(container_name, &identity.alias)
            .await?;

        let workdir = Some(self.paths.agent_work_dir(&identity.alias).display().to_string());
        for (name, cmd) in [
            ("preinstall", &effective.hooks.preinstall),
            ("install", &effective.hooks.install),
            ("postinstall", &effective.hooks.postinstall),
        ] {
            if let Some(cmd) = cmd {
                hooks::run_container_hook(
                    self.runtime.as_ref(),
                    container_name,
                    name,
                    cmd,
                    workdir.clone(),
                )
                .await?;
            }
        }

        if let Some(cmd) = &effective.hooks.hosthook_postinstall {
            hooks::run_host_hook("hosthook_postinstall", cmd, &hook_env).await?;
        }
        Ok(())
    }

    /// Stop an agent's container, keeping the record.
    pub async fn stop_agent(&self, container_name: &str) -> Result<()> {
        self.runtime.stop(container_name).await
    }

    /// Stop and remove an agent's container.
    pub async fn remove_agent(&self, container_name: &str) -> Result<()> {
        self.runtime.stop(container_name).await?;
        self.runtime.rm(container_name).await
    }

    /// Enforce the loopback invariant: every published port must resolve to
    /// a loopback host ip through the runtime's port query.
    pub async fn verify_loopback(&self, name: &str, ports: &[PortBinding]) -> Result<()> {
        for binding in ports {
            let published = self.runtime.port(name, binding.container_port).await?;
            for p in &published {
                if is_wildcard_ip(&p.host_ip) {
                    return Err(Error::PortWildcard {
                        name: name.to_string(),
                        container_port: binding.container_port,
                        host_ip: p.host_ip.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Binds, in the documented order, with every source materialised on
    /// disk before create.
    fn compute_binds(
        &self,
        identity: &AgentIdentity,
        manifest: &Manifest,
        effective: &EffectiveProfile,
    ) -> Result<Vec<Bind>> {
        let root = self.paths.root().to_path_buf();
        let work_dir = self.paths.agent_work_dir(&identity.alias);
        let node_modules = work_dir.join("node_modules");
        fs::create_dir_all(&node_modules)?;

        let mut binds = vec![
            Bind {
                source: root.clone(),
                target: root.display().to_string(),
                ro: false,
            },
            Bind {
                source: self.paths.code_link(&identity.alias),
                target: "/code".to_string(),
                ro: effective.mounts.code.read_only(),
            },
            Bind {
                source: node_modules,
                target: "/code/node_modules".to_string(),
                ro: true,
            },
            Bind {
                source: self.paths.skills_link(&identity.alias),
                target: "/code/.AchillesSkills".to_string(),
                ro: effective.mounts.skills.read_only(),
            },
            Bind {
                source: install_dir().join("Agent"),
                target: "/Agent".to_string(),
                ro: true,
            },
        ];
        for (host, target) in &manifest.volumes {
            binds.push(Bind {
                source: PathBuf::from(host),
                target: target.clone(),
                ro: false,
            });
        }
        for bind in &binds {
            if !bind.source.exists() {
                fs::create_dir_all(&bind.source)?;
            }
        }
        Ok(binds)
    }

    fn compute_env(
        &self,
        registry: &AgentsRegistry,
        store: &SecretStore,
        identity: &AgentIdentity,
        manifest: &Manifest,
        effective: &EffectiveProfile,
    ) -> Result<Vec<ResolvedEnvVar>> {
        let mut env = vec![
            ResolvedEnvVar {
                name: "AGENT_NAME".to_string(),
                value: identity.alias.clone(),
            },
            ResolvedEnvVar {
                name: "WORKSPACE_PATH".to_string(),
                value: self.paths.agent_work_dir(&identity.alias).display().to_string(),
            },
        ];

        env.extend(resolve_env(&effective.env, |name| {
            store.resolve_var_value(name)
        })?);

        // `expose` entries: manifest first, then workspace-level mappings
        // recorded by the expose command (global `*` before per-agent).
        let mut exposed: Vec<(String, String)> = manifest
            .expose
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for scope in ["*", identity.alias.as_str()] {
            if let Some(entries) = registry.config.expose.get(scope) {
                exposed.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        for (name, value) in exposed {
            let value = match value.strip_prefix('$') {
                Some(var) => store.require_var(var)?,
                None => value,
            };
            match env.iter_mut().find(|e| e.name == name) {
                Some(existing) => existing.value = value,
                None => env.push(ResolvedEnvVar { name, value }),
            }
        }

        // Secrets ride in as env only; nothing is written inside the container.
        for name in &effective.secrets {
            let value = store.require_var(name)?;
            if !env.iter().any(|e| e.name == *name) {
                env.push(ResolvedEnvVar {
                    name: name.clone(),
                    value,
                });
            }
        }
        Ok(env)
    }

    /// One loopback host port per declared container port. Recorded ports
    /// are reused so an unchanged agent keeps a stable spec hash.
    fn compute_ports(
        &self,
        registry: &AgentsRegistry,
        manifest: &Manifest,
        container_name: &str,
    ) -> Result<Vec<PortBinding>> {
        let existing: Vec<PortBinding> = registry
            .get(container_name)
            .map(|r| r.ports.clone())
            .unwrap_or_default();

        let mut allocator = PortAllocator::open(&self.paths)?;
        let mut bindings = Vec::with_capacity(manifest.ports.len());
        allocator.with_lock(|| {
            for port in &manifest.ports {
                let host_ip = match port.host_ip.as_deref() {
                    Some(ip) if !is_wildcard_ip(ip) => ip.to_string(),
                    _ => "127.0.0.1".to_string(),
                };
                let host_port = if let Some(declared) = port.host {
                    declared
                } else if let Some(prev) = existing
                    .iter()
                    .find(|p| p.container_port == port.container)
                {
                    prev.host_port
                } else {
                    let mut candidate;
                    loop {
                        candidate = allocate_host_port(registry)?;
                        if !bindings
                            .iter()
                            .any(|b: &PortBinding| b.host_port == candidate)
                        {
                            break;
                        }
                    }
                    candidate
                };
                bindings.push(PortBinding {
                    container_port: port.container,
                    host_port,
                    host_ip,
                });
            }
            Ok(())
        })?;
        Ok(bindings)
    }
}
