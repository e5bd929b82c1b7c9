//! Profile merging.
//!
//! The merge always starts from `default` and applies the active profile on
//! top: env and mounts deep-merge, hooks are replaced field by field (never
//! concatenated), secrets concatenate. Applying the merge twice equals
//! applying it once.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    env::EnvVarSpec,
    error::{Error, Result},
    schema::{Manifest, ProfileConfig},
};

/// The closed set of recognised profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Default,
    Dev,
    Qa,
    Prod,
}

impl Profile {
    pub const ALL: [Self; 4] = [Self::Default, Self::Dev, Self::Qa, Self::Prod];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Dev => "dev",
            Self::Qa => "qa",
            Self::Prod => "prod",
        }
    }

    /// qa and prod default their mounts to read-only.
    fn default_mount_mode(self) -> MountMode {
        match self {
            Self::Default | Self::Dev => MountMode::Rw,
            Self::Qa | Self::Prod => MountMode::Ro,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "dev" => Ok(Self::Dev),
            "qa" => Ok(Self::Qa),
            "prod" => Ok(Self::Prod),
            other => Err(Error::UnknownProfile {
                name: other.to_string(),
                valid: Self::ALL.iter().map(|p| p.to_string()).collect(),
            }),
        }
    }
}

/// Mount access mode for the `/code` and skills mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Rw,
    Ro,
}

impl MountMode {
    pub fn read_only(self) -> bool {
        matches!(self, Self::Ro)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountModes {
    pub code: MountMode,
    pub skills: MountMode,
}

/// Lifecycle hook commands after merging. Host hooks run on the host with
/// the injected `PLOINKY_*` environment; the rest run inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleHooks {
    pub preinstall: Option<String>,
    pub install: Option<String>,
    pub postinstall: Option<String>,
    pub hosthook_aftercreation: Option<String>,
    pub hosthook_postinstall: Option<String>,
}

/// The result of merging `default` with the active profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveProfile {
    pub profile: Profile,
    pub env: Vec<EnvVarSpec>,
    pub hooks: LifecycleHooks,
    pub secrets: Vec<String>,
    pub mounts: MountModes,
}

/// Merge the manifest's `default` profile with the active profile.
pub fn effective(manifest: &Manifest, profile: Profile) -> Result<EffectiveProfile> {
    let empty = ProfileConfig::default();
    let base = manifest.profile(Profile::Default).unwrap_or(&empty);
    let active = if profile == Profile::Default {
        None
    } else {
        manifest.profile(profile)
    };

    // Env: base order is kept; active entries override by name, new names append.
    let mut env = base.env.normalize()?;
    if let Some(active) = active {
        for spec in active.env.normalize()? {
            match env.iter_mut().find(|e| e.name == spec.name) {
                Some(existing) => *existing = spec,
                None => env.push(spec),
            }
        }
    }

    let hooks = LifecycleHooks {
        preinstall: pick_hook(active, base, |p| &p.preinstall),
        install: pick_hook(active, base, |p| &p.install),
        postinstall: pick_hook(active, base, |p| &p.postinstall),
        hosthook_aftercreation: pick_hook(active, base, |p| &p.hosthook_aftercreation),
        hosthook_postinstall: pick_hook(active, base, |p| &p.hosthook_postinstall),
    };

    // Secrets concatenate, deduplicated in first-seen order.
    let mut secrets: Vec<String> = Vec::new();
    for name in base
        .secrets
        .iter()
        .chain(active.map(|a| a.secrets.iter()).unwrap_or_default())
    {
        if !secrets.contains(name) {
            secrets.push(name.clone());
        }
    }

    let fallback = profile.default_mount_mode();
    let mounts = MountModes {
        code: pick_mount(active, base, fallback, |m| m.code),
        skills: pick_mount(active, base, fallback, |m| m.skills),
    };

    Ok(EffectiveProfile {
        profile,
        env,
        hooks,
        secrets,
        mounts,
    })
}

/// Active profile's hook wins outright when present; hooks never concatenate.
fn pick_hook<F>(active: Option<&ProfileConfig>, base: &ProfileConfig, field: F) -> Option<String>
where
    F: Fn(&ProfileConfig) -> &Option<crate::schema::HookSpec>,
{
    active
        .and_then(|p| field(p).as_ref())
        .or_else(|| field(base).as_ref())
        .and_then(|h| h.command().map(str::to_string))
}

/// Explicit setting (active first, then default) beats the profile fallback.
fn pick_mount<F>(
    active: Option<&ProfileConfig>,
    base: &ProfileConfig,
    fallback: MountMode,
    field: F,
) -> MountMode
where
    F: Fn(&crate::schema::MountsConfig) -> Option<MountMode>,
{
    active
        .and_then(|p| p.mounts.as_ref())
        .and_then(&field)
        .or_else(|| base.mounts.as_ref().and_then(&field))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> Manifest {
        let m: Manifest = serde_json::from_str(json).unwrap();
        m.validate().unwrap();
        m
    }

    const MERGE_FIXTURE: &str = r#"{
        "image": "img",
        "profiles": {
            "default": {
                "env": ["SHARED", "BASE_ONLY"],
                "install": "npm run build",
                "hosthook_postinstall": "./notify.sh",
                "secrets": ["TOKEN_A"]
            },
            "prod": {
                "env": {"SHARED": {"varName": "PROD_SHARED", "required": true}},
                "install": "npm run build --prod",
                "secrets": ["TOKEN_A", "TOKEN_B"]
            }
        }
    }"#;

    #[test]
    fn test_env_deep_merge_overrides_by_name() {
        let eff = effective(&manifest(MERGE_FIXTURE), Profile::Prod).unwrap();
        assert_eq!(eff.env.len(), 2);
        assert_eq!(eff.env[0].name, "SHARED");
        assert_eq!(eff.env[0].source, "PROD_SHARED");
        assert!(eff.env[0].required);
        assert_eq!(eff.env[1].name, "BASE_ONLY");
    }

    #[test]
    fn test_hooks_override_never_concatenate() {
        let eff = effective(&manifest(MERGE_FIXTURE), Profile::Prod).unwrap();
        assert_eq!(eff.hooks.install.as_deref(), Some("npm run build --prod"));
        // prod does not set hosthook_postinstall, so default's applies.
        assert_eq!(eff.hooks.hosthook_postinstall.as_deref(), Some("./notify.sh"));
    }

    #[test]
    fn test_secrets_concatenate_dedup() {
        let eff = effective(&manifest(MERGE_FIXTURE), Profile::Prod).unwrap();
        assert_eq!(eff.secrets, vec!["TOKEN_A", "TOKEN_B"]);
    }

    #[test]
    fn test_mount_defaults_per_profile() {
        let m = manifest(r#"{"image":"img","profiles":{"default":{}}}"#);
        assert_eq!(
            effective(&m, Profile::Default).unwrap().mounts,
            MountModes {
                code: MountMode::Rw,
                skills: MountMode::Rw
            }
        );
        assert_eq!(
            effective(&m, Profile::Prod).unwrap().mounts,
            MountModes {
                code: MountMode::Ro,
                skills: MountMode::Ro
            }
        );
        assert_eq!(effective(&m, Profile::Dev).unwrap().mounts.code, MountMode::Rw);
    }

    #[test]
    fn test_explicit_mount_overrides_profile_default() {
        let m = manifest(
            r#"{"image":"img","profiles":{"prod":{"mounts":{"code":"rw"}}}}"#,
        );
        let eff = effective(&m, Profile::Prod).unwrap();
        assert_eq!(eff.mounts.code, MountMode::Rw);
        assert_eq!(eff.mounts.skills, MountMode::Ro);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let m = manifest(MERGE_FIXTURE);
        let once = effective(&m, Profile::Prod).unwrap();
        let twice = effective(&m, Profile::Prod).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unknown_profile_name() {
        let err = "staging".parse::<Profile>().unwrap_err();
        assert_eq!(err.code(), "profile_unknown");
    }
}
