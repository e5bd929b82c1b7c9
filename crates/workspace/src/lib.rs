//! Workspace state: on-disk layout, the secret/variable store, and the
//! persisted registry and routing files under `.ploinky/`.
//!
//! The agents registry is the single source of truth for materialised
//! agents; the routing table is regenerated from it on every router start.
//! All persisted JSON goes through temp-file + atomic rename, and readers
//! tolerate missing files.

pub mod error;
pub mod layout;
pub mod ports;
pub mod registry;
pub mod repos;
pub mod routing;
pub mod secrets;

pub use {
    error::{Error, Result},
    layout::{create_agent_symlinks, init_workspace, teardown_agent, verify_workspace_structure},
    registry::{AgentRecord, AgentsRegistry, Bind, PortBinding, RecordStatus, RunMode},
    routing::RoutingTable,
    secrets::SecretStore,
};

use std::path::{Path, PathBuf};

/// Paths of the persisted files for one workspace root.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dot_ploinky(&self) -> PathBuf {
        self.root.join(".ploinky")
    }

    pub fn agents_registry(&self) -> PathBuf {
        self.dot_ploinky().join("agents")
    }

    pub fn routing(&self) -> PathBuf {
        self.dot_ploinky().join("routing.json")
    }

    pub fn enabled_repos(&self) -> PathBuf {
        self.dot_ploinky().join("enabled_repos.json")
    }

    pub fn profile(&self) -> PathBuf {
        self.dot_ploinky().join("profile")
    }

    pub fn secrets(&self) -> PathBuf {
        self.dot_ploinky().join(".secrets")
    }

    pub fn dotenv(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn running_dir(&self) -> PathBuf {
        self.dot_ploinky().join("running")
    }

    pub fn router_pid(&self) -> PathBuf {
        self.running_dir().join("router.pid")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dot_ploinky().join("logs")
    }

    pub fn router_log(&self) -> PathBuf {
        self.logs_dir().join("router.log")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.dot_ploinky().join("blobs")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.dot_ploinky().join("repos")
    }

    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.repos_dir().join(repo)
    }

    pub fn agent_work_dir(&self, agent: &str) -> PathBuf {
        self.root.join("agents").join(agent)
    }

    pub fn code_link(&self, agent: &str) -> PathBuf {
        self.root.join("code").join(agent)
    }

    pub fn skills_link(&self, agent: &str) -> PathBuf {
        self.root.join("skills").join(agent)
    }
}
