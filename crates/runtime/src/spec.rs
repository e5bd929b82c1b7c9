//! The computed container spec and its hash.
//!
//! The spec hash decides reuse vs recreate: a record whose stored hash
//! matches the freshly computed spec keeps its container.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use {
    ploinky_manifest::ResolvedEnvVar,
    ploinky_workspace::{Bind, PortBinding},
};

/// Everything handed to the runtime's `create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub binds: Vec<Bind>,
    pub env: Vec<ResolvedEnvVar>,
    pub ports: Vec<PortBinding>,
    pub workdir: Option<String>,
    pub entrypoint: Option<String>,
    pub command: Vec<String>,
}

impl ContainerSpec {
    /// Containers are supervised by the monitor, never by the runtime.
    pub const RESTART_POLICY: &'static str = "no";

    /// Hash of the canonical JSON encoding. Field order is fixed by the
    /// struct declaration, so equal specs hash equally.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "node:20".into(),
            binds: vec![Bind {
                source: "/ws/code/a".into(),
                target: "/code".into(),
                ro: false,
            }],
            env: vec![ResolvedEnvVar {
                name: "AGENT_NAME".into(),
                value: "a".into(),
            }],
            ports: vec![PortBinding {
                container_port: 7000,
                host_port: 32001,
                host_ip: "127.0.0.1".into(),
            }],
            workdir: Some("/ws/agents/a".into()),
            entrypoint: None,
            command: vec!["node".into(), "/Agent/server.js".into()],
        }
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(spec().hash(), spec().hash());
        assert_eq!(spec().hash().len(), 64);
    }

    #[test]
    fn test_hash_changes_with_spec() {
        let mut changed = spec();
        changed.env[0].value = "b".into();
        assert_ne!(spec().hash(), changed.hash());

        let mut reordered = spec();
        reordered.command.reverse();
        assert_ne!(spec().hash(), reordered.hash());
    }
}
