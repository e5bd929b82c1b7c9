//! In-container dependency installation.
//!
//! Two-phase npm install: the core template (`/Agent/package.base.json`)
//! first, then the merge of core + agent dependencies with core versions
//! always winning. The result is cached host-side under
//! `agents/<a>/node_modules` with a hash of both inputs, and mounted
//! read-only at `/code/node_modules` on subsequent runs.

use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use ploinky_workspace::WorkspacePaths;

use crate::{
    adapter::{ContainerRuntime, ExecOptions},
    error::{Error, Result},
};

const NPM_TIMEOUT: Duration = Duration::from_secs(600);
const HASH_FILE: &str = ".dep-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No `/code/package.json`: nothing to install.
    NoAgentPackage,
    /// Cached `node_modules` matches the input hash.
    Cached,
    Installed,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

/// Directory holding the core agent runtime shipped with ploinky, mounted
/// read-only at `/Agent` in every container.
pub fn install_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PLOINKY_INSTALL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub struct DependencyInstaller<'a> {
    runtime: &'a dyn ContainerRuntime,
    paths: &'a WorkspacePaths,
}

impl<'a> DependencyInstaller<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, paths: &'a WorkspacePaths) -> Self {
        Self { runtime, paths }
    }

    /// Ensure the agent's dependencies are installed, using the host-side
    /// cache when the inputs are unchanged.
    pub async fn ensure_dependencies(
        &self,
        container: &str,
        agent: &str,
    ) -> Result<InstallOutcome> {
        let code_pkg_path = self.paths.code_link(agent).join("package.json");
        let Ok(code_pkg_text) = fs::read_to_string(&code_pkg_path) else {
            debug!(agent, "no agent package.json, skipping dependency install");
            return Ok(InstallOutcome::NoAgentPackage);
        };

        let base_pkg_path = install_dir().join("Agent/package.base.json");
        let base_pkg_text = fs::read_to_string(&base_pkg_path).unwrap_or_else(|_| "{}".to_string());

        let work_dir = self.paths.agent_work_dir(agent);
        let hash = input_hash(&base_pkg_text, &code_pkg_text);
        let hash_path = work_dir.join(HASH_FILE);
        if work_dir.join("node_modules").is_dir()
            && fs::read_to_string(&hash_path).map(|h| h.trim() == hash).unwrap_or(false)
        {
            debug!(agent, "dependency cache hit");
            return Ok(InstallOutcome::Cached);
        }

        let base: PackageJson = serde_json::from_str(&base_pkg_text).unwrap_or_default();
        let agent_pkg: PackageJson =
            serde_json::from_str(&code_pkg_text).map_err(|e| Error::Message {
                message: format!("invalid {}: {e}", code_pkg_path.display()),
            })?;
        let merged = merge_dependencies(&base.dependencies, &agent_pkg.dependencies)?;

        fs::create_dir_all(&work_dir)?;
        let container_work_dir = work_dir.display().to_string();

        // Phase one: the core template alone.
        let phase_one = if base_pkg_text.trim().is_empty() {
            "{}"
        } else {
            base_pkg_text.as_str()
        };
        fs::write(work_dir.join("package.json"), phase_one)?;
        self.npm_install(container, &container_work_dir).await?;

        // Phase two: core + agent merge, core winning.
        let merged_pkg = serde_json::json!({ "dependencies": merged });
        let merged_text = serde_json::to_string_pretty(&merged_pkg).map_err(|e| Error::Message {
            message: e.to_string(),
        })?;
        fs::write(work_dir.join("package.json"), merged_text)?;
        self.npm_install(container, &container_work_dir).await?;

        fs::write(&hash_path, &hash)?;
        info!(agent, "dependencies installed");
        Ok(InstallOutcome::Installed)
    }

    /// Run `npm install` in the container, retrying once when the runtime
    /// itself was unreachable.
    async fn npm_install(&self, container: &str, workdir: &str) -> Result<()> {
        match self.exec_npm(container, workdir).await {
            Err(e) if e.code() == "transport_refused" => {
                debug!(container, "runtime refused npm exec, retrying once");
                self.exec_npm(container, workdir).await
            },
            other => other,
        }
    }

    async fn exec_npm(&self, container: &str, workdir: &str) -> Result<()> {
        let out = self
            .runtime
            .exec(container, "npm install --no-audit --no-fund", ExecOptions {
                workdir: Some(workdir.to_string()),
                env: Vec::new(),
                timeout: Some(NPM_TIMEOUT),
            })
            .await?;
        if !out.success() {
            return Err(Error::Exec {
                name: container.to_string(),
                detail: format!("npm install failed: {}", out.stderr.trim()),
            });
        }
        Ok(())
    }
}

fn input_hash(base: &str, agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hasher.update([0]);
    hasher.update(agent.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// `merge(core, agent)`: union with core overriding; a package pinned by
/// both at different versions is a conflict.
fn merge_dependencies(
    core: &BTreeMap<String, String>,
    agent: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut merged = agent.clone();
    for (package, core_version) in core {
        if let Some(agent_version) = agent.get(package)
            && agent_version != core_version
        {
            return Err(Error::DepConflict {
                package: package.clone(),
                core_version: core_version.clone(),
                agent_version: agent_version.clone(),
            });
        }
        merged.insert(package.clone(), core_version.clone());
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_merge_union_with_core_precedence() {
        let merged = merge_dependencies(
            &deps(&[("express", "^4.18.0")]),
            &deps(&[("lodash", "^4.17.0"), ("express", "^4.18.0")]),
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["express"], "^4.18.0");
        assert_eq!(merged["lodash"], "^4.17.0");
    }

    #[test]
    fn test_merge_conflicting_versions_fail() {
        let err = merge_dependencies(
            &deps(&[("express", "^4.18.0")]),
            &deps(&[("express", "^5.0.0")]),
        )
        .unwrap_err();
        assert_eq!(err.code(), "dep_conflict");
    }

    #[test]
    fn test_input_hash_sensitive_to_both_inputs() {
        let a = input_hash("{}", r#"{"dependencies":{}}"#);
        assert_eq!(a, input_hash("{}", r#"{"dependencies":{}}"#));
        assert_ne!(a, input_hash("{} ", r#"{"dependencies":{}}"#));
        assert_ne!(a, input_hash("{}", r#"{"dependencies":{"x":"1"}}"#));
    }
}
