//! The agents registry (`.ploinky/agents`): one record per materialised
//! container, keyed by the deterministic container name, plus a `_config`
//! block holding workspace-level settings.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ploinky_common::fsio;
use ploinky_manifest::ResolvedEnvVar;

use crate::{Error, Result, WorkspacePaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Isolated,
    Global,
    Devel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Created,
    Ready,
    Unhealthy,
    Failed,
}

/// A host→container bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub source: PathBuf,
    pub target: String,
    pub ro: bool,
}

/// A published port. `host_ip` defaults to loopback and is never written as
/// a wildcard address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default = "default_host_ip")]
    pub host_ip: String,
}

fn default_host_ip() -> String {
    "127.0.0.1".to_string()
}

/// The persisted representation of a materialised agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub container_name: String,
    pub agent_name: String,
    /// Directory name inside the repo; differs from `agent_name` when the
    /// agent was enabled `as <alias>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_agent: String,
    pub repo_name: String,
    pub image: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    pub project_path: PathBuf,
    #[serde(default)]
    pub run_mode: RunMode,
    pub profile: String,
    #[serde(default)]
    pub binds: Vec<Bind>,
    #[serde(default)]
    pub env: Vec<ResolvedEnvVar>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub status: RecordStatus,
    /// Hash of the computed container spec, used to decide reuse vs recreate.
    #[serde(default)]
    pub spec_hash: String,
}

impl AgentRecord {
    /// The repo directory holding this agent's manifest.
    pub fn source_agent_dir(&self) -> &str {
        if self.source_agent.is_empty() {
            &self.agent_name
        } else {
            &self.source_agent
        }
    }
}

/// Workspace-level settings stored under the `_config` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_port: Option<u16>,
    /// Exported env mappings recorded by `expose`: agent name (or `"*"` for
    /// all agents) → exported name → literal or `$VAR` reference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expose: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "_config", skip_serializing_if = "is_default_config")]
    config: RegistryConfig,
    #[serde(flatten)]
    records: BTreeMap<String, AgentRecord>,
}

fn is_default_config(config: &RegistryConfig) -> bool {
    *config == RegistryConfig::default()
}

/// In-memory copy of the registry file. Single-writer: callers load, mutate,
/// and save; concurrent writers are serialised by the port-allocation lock
/// at the call sites that need it.
#[derive(Debug, Clone)]
pub struct AgentsRegistry {
    path: PathBuf,
    pub config: RegistryConfig,
    pub records: BTreeMap<String, AgentRecord>,
}

impl AgentsRegistry {
    pub fn load(paths: &WorkspacePaths) -> Result<Self> {
        let path = paths.agents_registry();
        let file: RegistryFile = fsio::load_json_or_default(&path).map_err(|e| Error::Registry {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            path,
            config: file.config,
            records: file.records,
        })
    }

    pub fn save(&self) -> Result<()> {
        let file = RegistryFile {
            config: self.config.clone(),
            records: self.records.clone(),
        };
        fsio::atomic_write_json(&self.path, &file).map_err(|e| Error::Registry {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a record under its container name.
    pub fn upsert(&mut self, record: AgentRecord) {
        self.records.insert(record.container_name.clone(), record);
    }

    pub fn remove(&mut self, container_name: &str) -> Option<AgentRecord> {
        self.records.remove(container_name)
    }

    pub fn get(&self, container_name: &str) -> Option<&AgentRecord> {
        self.records.get(container_name)
    }

    pub fn get_mut(&mut self, container_name: &str) -> Option<&mut AgentRecord> {
        self.records.get_mut(container_name)
    }

    pub fn by_agent_name(&self, agent: &str) -> Option<&AgentRecord> {
        self.records.values().find(|r| r.agent_name == agent)
    }

    /// Find a record for the same `(repo, agent, projectPath)` identity but a
    /// different container name, for migration after a naming change.
    pub fn find_stale_identity(
        &self,
        repo: &str,
        agent: &str,
        project_path: &Path,
        current_name: &str,
    ) -> Option<String> {
        self.records
            .values()
            .find(|r| {
                r.repo_name == repo
                    && r.agent_name == agent
                    && r.project_path == project_path
                    && r.container_name != current_name
            })
            .map(|r| r.container_name.clone())
    }

    /// Migrate a record to a new container name, keeping its contents.
    pub fn migrate(&mut self, old_name: &str, new_name: &str) {
        if let Some(mut record) = self.records.remove(old_name) {
            debug!(old = old_name, new = new_name, "migrating agent record");
            record.container_name = new_name.to_string();
            self.records.insert(new_name.to_string(), record);
        }
    }

    /// Every host port currently claimed by a record.
    pub fn claimed_host_ports(&self) -> Vec<u16> {
        self.records
            .values()
            .flat_map(|r| r.ports.iter().map(|p| p.host_port))
            .collect()
    }

    /// Invariant check: no two records share a host port.
    pub fn verify_port_uniqueness(&self) -> Result<()> {
        let mut seen = BTreeMap::new();
        for record in self.records.values() {
            for port in &record.ports {
                if let Some(other) = seen.insert(port.host_port, &record.container_name) {
                    return Err(Error::PortAllocation {
                        detail: format!(
                            "host port {} claimed by both {} and {}",
                            port.host_port, other, record.container_name
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, agent: &str, host_port: u16) -> AgentRecord {
        AgentRecord {
            container_name: name.to_string(),
            agent_name: agent.to_string(),
            source_agent: String::new(),
            repo_name: "demo".to_string(),
            image: "node:20".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            project_path: PathBuf::from("/tmp/ws"),
            run_mode: RunMode::Isolated,
            profile: "default".to_string(),
            binds: Vec::new(),
            env: Vec::new(),
            ports: vec![PortBinding {
                container_port: 7000,
                host_port,
                host_ip: default_host_ip(),
            }],
            status: RecordStatus::Created,
            spec_hash: String::new(),
        }
    }

    fn registry() -> (tempfile::TempDir, AgentsRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(paths.dot_ploinky()).unwrap();
        let reg = AgentsRegistry::load(&paths).unwrap();
        (dir, reg)
    }

    #[test]
    fn test_roundtrip_with_config_key() {
        let (dir, mut reg) = registry();
        reg.config.static_agent = Some("web".to_string());
        reg.config.router_port = Some(21080);
        reg.upsert(record("ploinky_demo_web_ws_abcd1234", "web", 31001));
        reg.save().unwrap();

        let paths = WorkspacePaths::new(dir.path());
        let loaded = AgentsRegistry::load(&paths).unwrap();
        assert_eq!(loaded.config.static_agent.as_deref(), Some("web"));
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(
            loaded.records["ploinky_demo_web_ws_abcd1234"].ports[0].host_port,
            31001
        );

        // `_config` lives beside the records in the same JSON object.
        let raw = std::fs::read_to_string(loaded.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("_config").is_some());
        assert!(value.get("ploinky_demo_web_ws_abcd1234").is_some());
    }

    #[test]
    fn test_serialisation_is_stable() {
        let (_dir, mut reg) = registry();
        reg.upsert(record("b_container", "b", 31002));
        reg.upsert(record("a_container", "a", 31003));
        reg.save().unwrap();
        let first = std::fs::read_to_string(reg.path()).unwrap();
        reg.save().unwrap();
        let second = std::fs::read_to_string(reg.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_port_uniqueness_violation() {
        let (_dir, mut reg) = registry();
        reg.upsert(record("one", "a", 31005));
        reg.upsert(record("two", "b", 31005));
        let err = reg.verify_port_uniqueness().unwrap_err();
        assert_eq!(err.code(), "port_allocation");
    }

    #[test]
    fn test_migration_keeps_record() {
        let (_dir, mut reg) = registry();
        reg.upsert(record("old_name", "a", 31006));
        let stale =
            reg.find_stale_identity("demo", "a", Path::new("/tmp/ws"), "new_name");
        assert_eq!(stale.as_deref(), Some("old_name"));
        reg.migrate("old_name", "new_name");
        assert!(reg.get("old_name").is_none());
        assert_eq!(reg.get("new_name").unwrap().agent_name, "a");
    }
}
