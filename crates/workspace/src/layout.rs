//! Host-side workspace layout.
//!
//! `<cwd>/agents/<a>/` holds per-agent working state (cached node_modules),
//! `<cwd>/code/<a>` and `<cwd>/skills/<a>` are relative symlinks into the
//! enabled repo. Everything here is idempotent.

use std::{fs, path::Path};

use tracing::debug;

use crate::{Result, WorkspacePaths};

/// Create the workspace skeleton: `.ploinky/`, `agents/`, `code/`, `skills/`.
pub fn init_workspace(paths: &WorkspacePaths) -> Result<()> {
    for dir in [
        paths.dot_ploinky(),
        paths.running_dir(),
        paths.logs_dir(),
        paths.repos_dir(),
        paths.root().join("agents"),
        paths.root().join("code"),
        paths.root().join("skills"),
    ] {
        fs::create_dir_all(&dir)?;
    }
    Ok(())
}

/// Create the `code/<agent>` and `skills/<agent>` symlinks pointing into the
/// repo. Dangling or stale links are replaced; correct links are left alone.
pub fn create_agent_symlinks(paths: &WorkspacePaths, alias: &str, repo: &str, agent: &str) -> Result<()> {
    fs::create_dir_all(paths.agent_work_dir(alias))?;
    // Materialise the repo-side targets so fresh links are never dangling.
    for sub in ["code", "skills"] {
        fs::create_dir_all(paths.repo_dir(repo).join(agent).join(sub))?;
    }
    let links = [
        (
            paths.code_link(alias),
            format!("../.ploinky/repos/{repo}/{agent}/code"),
        ),
        (
            paths.skills_link(alias),
            format!("../.ploinky/repos/{repo}/{agent}/skills"),
        ),
    ];
    for (link, target) in links {
        replace_symlink(&link, Path::new(&target))?;
    }
    Ok(())
}

#[cfg(unix)]
fn replace_symlink(link: &Path, target: &Path) -> Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) => {
            if meta.file_type().is_symlink()
                && fs::read_link(link).map(|t| t == target).unwrap_or(false)
            {
                return Ok(());
            }
            debug!(link = %link.display(), "replacing stale symlink");
            if meta.is_dir() && !meta.file_type().is_symlink() {
                fs::remove_dir_all(link)?;
            } else {
                fs::remove_file(link)?;
            }
        },
        Err(_) => {},
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// A problem found by [`verify_workspace_structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutIssue {
    pub path: String,
    pub detail: String,
}

/// Report missing directories and broken symlinks without fixing anything.
pub fn verify_workspace_structure(paths: &WorkspacePaths) -> Vec<LayoutIssue> {
    let mut issues = Vec::new();
    for dir in [
        paths.dot_ploinky(),
        paths.root().join("agents"),
        paths.root().join("code"),
        paths.root().join("skills"),
    ] {
        if !dir.is_dir() {
            issues.push(LayoutIssue {
                path: dir.display().to_string(),
                detail: "missing directory".to_string(),
            });
        }
    }
    for links_dir in [paths.root().join("code"), paths.root().join("skills")] {
        let Ok(entries) = fs::read_dir(&links_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_link = fs::symlink_metadata(&path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if is_link && !path.exists() {
                issues.push(LayoutIssue {
                    path: path.display().to_string(),
                    detail: "broken symlink".to_string(),
                });
            }
        }
    }
    issues
}

/// Remove an agent's symlinks. `agents/<a>/` is kept so cached
/// `node_modules` survive a disable/enable cycle.
pub fn teardown_agent(paths: &WorkspacePaths, alias: &str) -> Result<()> {
    for link in [paths.code_link(alias), paths.skills_link(alias)] {
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&link)?,
            _ => {},
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, WorkspacePaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        init_workspace(&paths).unwrap();
        (dir, paths)
    }

    #[test]
    fn test_init_is_idempotent() {
        let (_dir, paths) = setup();
        init_workspace(&paths).unwrap();
        assert!(paths.dot_ploinky().is_dir());
        assert!(paths.root().join("agents").is_dir());
    }

    #[test]
    fn test_symlinks_created_and_replaced() {
        let (_dir, paths) = setup();
        // Materialise the repo-side dirs so links are not dangling.
        let repo_code = paths.repo_dir("demo").join("worker/code");
        fs::create_dir_all(&repo_code).unwrap();
        fs::create_dir_all(paths.repo_dir("demo").join("worker/skills")).unwrap();

        create_agent_symlinks(&paths, "worker", "demo", "worker").unwrap();
        assert!(paths.code_link("worker").exists());

        // Re-running with the same target is a no-op.
        create_agent_symlinks(&paths, "worker", "demo", "worker").unwrap();

        // A dangling link to a different target is replaced.
        fs::remove_file(paths.code_link("worker")).unwrap();
        std::os::unix::fs::symlink("../nowhere", paths.code_link("worker")).unwrap();
        create_agent_symlinks(&paths, "worker", "demo", "worker").unwrap();
        assert_eq!(
            fs::read_link(paths.code_link("worker")).unwrap(),
            Path::new("../.ploinky/repos/demo/worker/code")
        );
    }

    #[test]
    fn test_verify_reports_broken_symlink() {
        let (_dir, paths) = setup();
        std::os::unix::fs::symlink("../gone", paths.code_link("ghost")).unwrap();
        let issues = verify_workspace_structure(&paths);
        assert!(issues.iter().any(|i| i.detail == "broken symlink"));
    }

    #[test]
    fn test_teardown_keeps_agent_dir() {
        let (_dir, paths) = setup();
        fs::create_dir_all(paths.repo_dir("r").join("a/code")).unwrap();
        fs::create_dir_all(paths.repo_dir("r").join("a/skills")).unwrap();
        create_agent_symlinks(&paths, "a", "r", "a").unwrap();
        fs::create_dir_all(paths.agent_work_dir("a").join("node_modules")).unwrap();

        teardown_agent(&paths, "a").unwrap();
        assert!(!paths.code_link("a").exists());
        assert!(paths.agent_work_dir("a").join("node_modules").is_dir());
    }
}
