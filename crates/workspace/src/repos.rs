//! Enabled repositories (`.ploinky/enabled_repos.json`) and the active
//! profile file (`.ploinky/profile`).
//!
//! Cloning is out of scope here: enabling a repo records its name (and URL
//! for unknown names); the repo contents are expected under
//! `.ploinky/repos/<name>/<agent>/manifest.json`.

use std::fs;

use serde::{Deserialize, Serialize};

use ploinky_common::fsio;
use ploinky_manifest::Profile;

use crate::{Error, Result, WorkspacePaths};

/// Repo names with well-known URLs; `enable repo <name>` accepts these
/// without an explicit URL.
pub const PREDEFINED_REPOS: &[(&str, &str)] = &[
    ("basic", "https://github.com/PloinkyRepos/Basic.git"),
    ("cloud", "https://github.com/PloinkyRepos/Cloud.git"),
    ("vibe", "https://github.com/PloinkyRepos/Vibe.git"),
    ("security", "https://github.com/PloinkyRepos/Security.git"),
    ("demo", "https://github.com/PloinkyRepos/Demo.git"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnabledRepos {
    pub repos: Vec<RepoRef>,
}

impl EnabledRepos {
    pub fn load(paths: &WorkspacePaths) -> Result<Self> {
        let path = paths.enabled_repos();
        fsio::load_json_or_default(&path).map_err(|e| Error::Registry {
            path,
            detail: e.to_string(),
        })
    }

    pub fn save(&self, paths: &WorkspacePaths) -> Result<()> {
        let path = paths.enabled_repos();
        fsio::atomic_write_json(&path, self).map_err(|e| Error::Registry {
            path,
            detail: e.to_string(),
        })
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.repos.iter().any(|r| r.name == name)
    }

    /// Enable a repo. Unknown names require a URL; predefined names get
    /// theirs filled in.
    pub fn enable(&mut self, name: &str, url: Option<String>) -> Result<&RepoRef> {
        if let Some(idx) = self.repos.iter().position(|r| r.name == name) {
            return Ok(&self.repos[idx]);
        }
        let url = url.or_else(|| {
            PREDEFINED_REPOS
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, u)| (*u).to_string())
        });
        if url.is_none() {
            return Err(Error::Message {
                message: format!(
                    "repo '{name}' is not predefined; pass a URL: enable repo {name} <url>"
                ),
            });
        }
        self.repos.push(RepoRef {
            name: name.to_string(),
            url,
        });
        let idx = self.repos.len() - 1;
        Ok(&self.repos[idx])
    }

    pub fn disable(&mut self, name: &str) -> bool {
        let before = self.repos.len();
        self.repos.retain(|r| r.name != name);
        self.repos.len() != before
    }
}

/// Locate an agent by `name` or `repo/name` across the enabled repos.
/// Returns `(repo, agent, manifest_path)`.
pub fn find_agent(
    paths: &WorkspacePaths,
    repos: &EnabledRepos,
    spec: &str,
) -> Result<(String, String, std::path::PathBuf)> {
    let (wanted_repo, agent) = match spec.split_once('/') {
        Some((repo, agent)) => (Some(repo), agent),
        None => (None, spec),
    };
    let mut matches = Vec::new();
    for repo in &repos.repos {
        if let Some(wanted) = wanted_repo
            && repo.name != wanted
        {
            continue;
        }
        let manifest = paths.repo_dir(&repo.name).join(agent).join("manifest.json");
        if manifest.is_file() {
            matches.push((repo.name.clone(), agent.to_string(), manifest));
        }
    }
    match matches.len() {
        0 => Err(Error::Message {
            message: format!("agent '{spec}' not found in any enabled repo"),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::Message {
            message: format!(
                "agent '{agent}' exists in multiple repos ({}); qualify as <repo>/{agent}",
                matches
                    .iter()
                    .map(|(r, ..)| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }),
    }
}

/// Read the active profile from `.ploinky/profile` (default when absent).
pub fn active_profile(paths: &WorkspacePaths) -> Result<Profile> {
    let path = paths.profile();
    if !path.exists() {
        return Ok(Profile::Default);
    }
    let text = fs::read_to_string(&path)?;
    Ok(text.trim().parse()?)
}

/// Persist the active profile as a single line.
pub fn set_active_profile(paths: &WorkspacePaths, profile: Profile) -> Result<()> {
    fsio::atomic_write(&paths.profile(), format!("{profile}\n").as_bytes())
        .map_err(|e| Error::Message { message: e.to_string() })
}
