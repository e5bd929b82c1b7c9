//! Health probing.
//!
//! Two logical probes per agent (liveness, readiness), each a script run
//! inside the container on an interval with a hard timeout. Threshold
//! counting is a pure state machine; the async driver runs in its own task
//! so a panicking or hanging probe never touches the router event loop.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use ploinky_manifest::{HealthConfig, ProbeSpec};

use crate::adapter::{ContainerRuntime, ExecOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Liveness,
    Readiness,
}

/// Threshold transitions reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTransition {
    None,
    BecameFailing,
    BecamePassing,
}

/// Consecutive-count state for one probe.
#[derive(Debug, Clone)]
pub struct ProbeState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    passing: bool,
}

impl ProbeState {
    /// Probes start passing; a fresh agent is not restarted for warming up
    /// slower than the first interval.
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            passing: true,
        }
    }

    pub fn passing(&self) -> bool {
        self.passing
    }

    /// Feed one probe execution result through the thresholds.
    pub fn observe(&mut self, ok: bool, spec: &ProbeSpec) -> ProbeTransition {
        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if !self.passing && self.consecutive_successes >= spec.success_threshold {
                self.passing = true;
                return ProbeTransition::BecamePassing;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.passing && self.consecutive_failures >= spec.failure_threshold {
                self.passing = false;
                return ProbeTransition::BecameFailing;
            }
        }
        ProbeTransition::None
    }
}

impl Default for ProbeState {
    fn default() -> Self {
        Self::new()
    }
}

/// A probe threshold crossing for one container.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub container_name: String,
    pub kind: ProbeKind,
    pub transition: ProbeTransition,
}

/// Spawns and owns the probe tasks for agents with a `health` block.
pub struct HealthProber {
    runtime: Arc<dyn ContainerRuntime>,
    events: mpsc::UnboundedSender<HealthEvent>,
}

impl HealthProber {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Self {
        Self { runtime, events }
    }

    /// Start the probe tasks for one container. Returns the task handles so
    /// the caller can abort them when the agent goes away.
    pub fn spawn(&self, container_name: &str, health: &HealthConfig) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let probes = [
            (ProbeKind::Liveness, health.liveness.clone()),
            (ProbeKind::Readiness, health.readiness.clone()),
        ];
        for (kind, spec) in probes {
            let Some(spec) = spec else { continue };
            let runtime = Arc::clone(&self.runtime);
            let events = self.events.clone();
            let name = container_name.to_string();
            handles.push(tokio::spawn(async move {
                probe_loop(runtime, name, kind, spec, events).await;
            }));
        }
        handles
    }
}

async fn probe_loop(
    runtime: Arc<dyn ContainerRuntime>,
    container_name: String,
    kind: ProbeKind,
    spec: ProbeSpec,
    events: mpsc::UnboundedSender<HealthEvent>,
) {
    let mut state = ProbeState::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(spec.interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let ok = execute_probe(runtime.as_ref(), &container_name, &spec).await;
        let transition = state.observe(ok, &spec);
        if transition != ProbeTransition::None {
            debug!(container = %container_name, kind = ?kind, transition = ?transition, "probe transition");
            if events
                .send(HealthEvent {
                    container_name: container_name.clone(),
                    kind,
                    transition,
                })
                .is_err()
            {
                return;
            }
        }
    }
}

/// One probe execution: timeout and every exec failure count as a failed run.
async fn execute_probe(
    runtime: &dyn ContainerRuntime,
    container_name: &str,
    spec: &ProbeSpec,
) -> bool {
    let result = runtime
        .exec(container_name, &spec.script, ExecOptions {
            workdir: None,
            env: Vec::new(),
            timeout: Some(Duration::from_secs(spec.timeout.max(1))),
        })
        .await;
    match result {
        Ok(out) => out.success(),
        Err(e) => {
            warn!(container = %container_name, error = %e, "probe execution failed");
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(failure: u32, success: u32) -> ProbeSpec {
        ProbeSpec {
            script: "true".into(),
            interval: 1,
            timeout: 1,
            failure_threshold: failure,
            success_threshold: success,
        }
    }

    #[test]
    fn test_failing_after_threshold() {
        let spec = spec(3, 1);
        let mut state = ProbeState::new();
        assert_eq!(state.observe(false, &spec), ProbeTransition::None);
        assert_eq!(state.observe(false, &spec), ProbeTransition::None);
        assert_eq!(state.observe(false, &spec), ProbeTransition::BecameFailing);
        assert!(!state.passing());
        // Further failures do not re-fire.
        assert_eq!(state.observe(false, &spec), ProbeTransition::None);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let spec = spec(3, 1);
        let mut state = ProbeState::new();
        state.observe(false, &spec);
        state.observe(false, &spec);
        assert_eq!(state.observe(true, &spec), ProbeTransition::None);
        assert_eq!(state.observe(false, &spec), ProbeTransition::None);
        assert_eq!(state.observe(false, &spec), ProbeTransition::None);
        assert_eq!(state.observe(false, &spec), ProbeTransition::BecameFailing);
    }

    #[test]
    fn test_recovery_after_success_threshold() {
        let spec = spec(1, 2);
        let mut state = ProbeState::new();
        assert_eq!(state.observe(false, &spec), ProbeTransition::BecameFailing);
        assert_eq!(state.observe(true, &spec), ProbeTransition::None);
        assert_eq!(state.observe(true, &spec), ProbeTransition::BecamePassing);
        assert!(state.passing());
    }
}
