//! The router routing table (`.ploinky/routing.json`), regenerated from the
//! agents registry on every router start.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ploinky_common::fsio;

use crate::{AgentsRegistry, Error, Result, WorkspacePaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_agent: Option<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteEntry>,
}

impl RoutingTable {
    pub fn load(paths: &WorkspacePaths) -> Result<Self> {
        let path = paths.routing();
        fsio::load_json_or_default(&path).map_err(|e| Error::Registry {
            path,
            detail: e.to_string(),
        })
    }

    pub fn save(&self, paths: &WorkspacePaths) -> Result<()> {
        let path = paths.routing();
        fsio::atomic_write_json(&path, self).map_err(|e| Error::Registry {
            path,
            detail: e.to_string(),
        })
    }

    /// Rebuild routes from the registry's records and their live host-port
    /// mappings. Every route references a record; records without published
    /// ports carry no route.
    pub fn regenerate(registry: &AgentsRegistry, port: u16) -> Self {
        let mut routes = BTreeMap::new();
        for record in registry.records.values() {
            if let Some(binding) = record.ports.first() {
                routes.insert(record.agent_name.clone(), RouteEntry {
                    container_port: binding.container_port,
                    host_port: binding.host_port,
                });
            }
        }
        Self {
            static_agent: registry.config.static_agent.clone(),
            port,
            routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentRecord, PortBinding, RecordStatus, RunMode};

    #[test]
    fn test_regenerate_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(paths.dot_ploinky()).unwrap();

        let mut registry = AgentsRegistry::load(&paths).unwrap();
        registry.config.static_agent = Some("web".to_string());
        registry.upsert(AgentRecord {
            container_name: "c1".to_string(),
            agent_name: "web".to_string(),
            source_agent: String::new(),
            repo_name: "demo".to_string(),
            image: "img".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            project_path: dir.path().to_path_buf(),
            run_mode: RunMode::Isolated,
            profile: "default".to_string(),
            binds: Vec::new(),
            env: Vec::new(),
            ports: vec![PortBinding {
                container_port: 7000,
                host_port: 32123,
                host_ip: "127.0.0.1".to_string(),
            }],
            status: RecordStatus::Ready,
            spec_hash: String::new(),
        });

        let table = RoutingTable::regenerate(&registry, 21080);
        assert_eq!(table.port, 21080);
        assert_eq!(table.routes["web"], RouteEntry {
            container_port: 7000,
            host_port: 32123,
        });

        table.save(&paths).unwrap();
        let loaded = RoutingTable::load(&paths).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        let table = RoutingTable::load(&paths).unwrap();
        assert!(table.routes.is_empty());
        assert_eq!(table.port, 0);
    }
}
