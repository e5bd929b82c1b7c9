//! Container lifecycle: the runtime adapter over docker/podman, the agent
//! service manager, the dependency installer, lifecycle hooks, health
//! probing, and the restart monitor with its circuit breaker.

pub mod adapter;
pub mod error;
pub mod health;
pub mod hooks;
pub mod install;
pub mod monitor;
pub mod service;
pub mod spec;

pub use {
    adapter::{CliRuntime, ContainerRuntime, ContainerState, ExecOptions, ExecOutput, RuntimeKind},
    error::{Error, Result},
    health::{HealthEvent, HealthProber, ProbeKind},
    monitor::{ContainerMonitor, MonitorEvent},
    service::AgentServiceManager,
    spec::ContainerSpec,
};
