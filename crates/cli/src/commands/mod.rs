pub mod agent;
pub mod client;
pub mod lifecycle;
pub mod logs_cmd;
pub mod profile;
pub mod repo;
pub mod vars;
pub mod web;

use anyhow::Context;

use ploinky_workspace::WorkspacePaths;

/// The workspace rooted at the current directory.
pub fn workspace() -> anyhow::Result<WorkspacePaths> {
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    Ok(WorkspacePaths::new(cwd))
}
