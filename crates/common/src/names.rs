//! Deterministic container naming.
//!
//! Every materialised agent gets exactly one container name derived from
//! the repo, the agent, and the project directory, so repeated runs in the
//! same workspace reconcile against the same container and two workspaces
//! never collide.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Lowercase a name and replace every character outside `[a-z0-9]` with `_`.
///
/// Container runtimes restrict name alphabets; this keeps the readable parts
/// of repo/agent/directory names while staying valid for both runtimes.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect()
}

/// First 8 hex chars of the sha256 of `input`.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in &digest[..4] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Deterministic container name for an agent materialised in `project_path`:
/// `ploinky_{repo}_{agent}_{basename(project_path)}_{first8(sha256(project_path))}`
/// with each component sanitised.
pub fn container_name(repo: &str, agent: &str, project_path: &Path) -> String {
    let base = project_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!(
        "ploinky_{}_{}_{}_{}",
        sanitize(repo),
        sanitize(agent),
        sanitize(&base),
        short_hash(&project_path.to_string_lossy()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("My-Repo"), "my_repo");
        assert_eq!(sanitize("agent.v2"), "agent_v2");
        assert_eq!(sanitize("plain123"), "plain123");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_short_hash_is_stable_and_8_chars() {
        let a = short_hash("/home/user/project");
        let b = short_hash("/home/user/project");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, short_hash("/home/user/other"));
    }

    #[test]
    fn test_container_name_formula() {
        let name = container_name("testRepo", "testAgent", Path::new("/tmp/demo"));
        let hash = short_hash("/tmp/demo");
        assert_eq!(name, format!("ploinky_testrepo_testagent_demo_{hash}"));
    }

    #[test]
    fn test_container_name_distinguishes_project_paths() {
        let a = container_name("r", "a", Path::new("/one/ws"));
        let b = container_name("r", "a", Path::new("/two/ws"));
        assert_ne!(a, b);
    }
}
