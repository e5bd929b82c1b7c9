//! Agent manifest parsing and profile resolution.
//!
//! A manifest describes one containerised agent: its image, entry commands,
//! published ports, volumes, and a set of profiles. Profiles carry
//! environment declarations (three accepted input shapes), lifecycle hooks,
//! secret names, and mount modes; [`effective`] merges the `default` profile
//! with the active one.

pub mod env;
pub mod error;
pub mod profile;
pub mod schema;

pub use {
    env::{EnvVarSpec, ResolvedEnvVar, resolve_env},
    error::{Error, Result},
    profile::{EffectiveProfile, LifecycleHooks, MountMode, MountModes, Profile, effective},
    schema::{HealthConfig, Manifest, PortSpec, ProbeSpec},
};
