//! Manifest schema. The manifest is immutable at read time: [`Manifest::load`]
//! parses and validates in one step, so downstream code never sees a
//! half-checked manifest.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    env::EnvShape,
    error::{Error, Result},
};

/// A published port declaration.
///
/// Accepted input shapes: `7000` (container only), `"8080:7000"`
/// (host:container), `"127.0.0.1:8080:7000"` (hostIp:host:container).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortSpecRepr", into = "String")]
pub struct PortSpec {
    pub container: u16,
    pub host: Option<u16>,
    pub host_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortSpecRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortSpecRepr> for PortSpec {
    type Error = Error;

    fn try_from(repr: PortSpecRepr) -> Result<Self> {
        let text = match repr {
            PortSpecRepr::Number(container) => {
                return Ok(Self {
                    container,
                    host: None,
                    host_ip: None,
                });
            },
            PortSpecRepr::Text(s) => s,
        };
        let invalid = || Error::PortSpec { spec: text.clone() };
        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [container] => Ok(Self {
                container: container.parse().map_err(|_| invalid())?,
                host: None,
                host_ip: None,
            }),
            [host, container] => Ok(Self {
                container: container.parse().map_err(|_| invalid())?,
                host: Some(host.parse().map_err(|_| invalid())?),
                host_ip: None,
            }),
            [ip, host, container] => Ok(Self {
                container: container.parse().map_err(|_| invalid())?,
                host: Some(host.parse().map_err(|_| invalid())?),
                host_ip: Some((*ip).to_string()),
            }),
            _ => Err(invalid()),
        }
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        match (spec.host_ip, spec.host) {
            (Some(ip), Some(host)) => format!("{ip}:{host}:{}", spec.container),
            (None, Some(host)) => format!("{host}:{}", spec.container),
            _ => spec.container.to_string(),
        }
    }
}

/// A liveness or readiness probe executed inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    pub script: String,
    /// Seconds between probe executions.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Hard per-execution timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ProbeSpec>,
}

/// A hook value as it appears in the manifest. Only single command strings
/// are valid; anything else is rejected with `hook_shape` at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookSpec {
    Command(String),
    Invalid(serde_json::Value),
}

impl HookSpec {
    fn validate(&self, hook: &str) -> Result<()> {
        match self {
            Self::Command(_) => Ok(()),
            Self::Invalid(_) => Err(Error::HookShape {
                hook: hook.to_string(),
            }),
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Command(cmd) => Some(cmd),
            Self::Invalid(_) => None,
        }
    }
}

/// Mount mode overrides for a profile (`code` and `skills` mounts).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<crate::profile::MountMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<crate::profile::MountMode>,
}

/// One profile block in the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub env: EnvShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preinstall: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postinstall: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosthook_aftercreation: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosthook_postinstall: Option<HookSpec>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<MountsConfig>,
}

/// An agent manifest as checked into a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Container image URI.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    /// Entry command run inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Optional interactive entry command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    /// Host path → container path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, String>,
    /// Exported env name → literal or `$VAR` reference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expose: BTreeMap<String, String>,
    /// Dependency lines: `name [global|devel repo] [as alias]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthConfig>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Manifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let manifest: Self = serde_json::from_str(&data).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check constraints serde cannot express: profile names come from the
    /// closed set and hooks are single command strings.
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in &self.profiles {
            if name.parse::<crate::profile::Profile>().is_err() {
                return Err(Error::UnknownProfile {
                    name: name.clone(),
                    valid: crate::profile::Profile::ALL
                        .iter()
                        .map(|p| p.to_string())
                        .collect(),
                });
            }
            for (hook_name, hook) in [
                ("preinstall", &profile.preinstall),
                ("install", &profile.install),
                ("postinstall", &profile.postinstall),
                ("hosthook_aftercreation", &profile.hosthook_aftercreation),
                ("hosthook_postinstall", &profile.hosthook_postinstall),
            ] {
                if let Some(hook) = hook {
                    hook.validate(hook_name)?;
                }
            }
        }
        Ok(())
    }

    pub fn profile(&self, profile: crate::profile::Profile) -> Option<&ProfileConfig> {
        self.profiles.get(profile.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_shapes() {
        let m: Manifest = serde_json::from_str(
            r#"{"image":"img","ports":[7000,"8080:7000","127.0.0.1:9090:7000"]}"#,
        )
        .unwrap();
        assert_eq!(m.ports[0], PortSpec {
            container: 7000,
            host: None,
            host_ip: None
        });
        assert_eq!(m.ports[1].host, Some(8080));
        assert_eq!(m.ports[2].host_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_invalid_port_spec() {
        let err = serde_json::from_str::<Manifest>(r#"{"image":"img","ports":["x:y"]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_hook_must_be_single_string() {
        let m: Manifest = serde_json::from_str(
            r#"{"image":"img","profiles":{"default":{"install":["a","b"]}}}"#,
        )
        .unwrap();
        let err = m.validate().unwrap_err();
        assert_eq!(err.code(), "hook_shape");
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let m: Manifest =
            serde_json::from_str(r#"{"image":"img","profiles":{"staging":{}}}"#).unwrap();
        let err = m.validate().unwrap_err();
        assert_eq!(err.code(), "profile_unknown");
        assert!(err.to_string().contains("default, dev, qa, prod"));
    }

    #[test]
    fn test_probe_defaults() {
        let m: Manifest = serde_json::from_str(
            r#"{"image":"img","health":{"liveness":{"script":"curl -f localhost:7000/up"}}}"#,
        )
        .unwrap();
        let probe = m.health.unwrap().liveness.unwrap();
        assert_eq!(probe.interval, 10);
        assert_eq!(probe.timeout, 5);
        assert_eq!(probe.failure_threshold, 3);
        assert_eq!(probe.success_threshold, 1);
    }

    #[test]
    fn test_load_reports_manifest_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Manifest::load(&path).unwrap_err();
        assert_eq!(err.code(), "manifest_parse");
    }
}
