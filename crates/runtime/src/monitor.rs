//! Container monitor: periodic reconciliation with exponential backoff and
//! a per-container circuit breaker.
//!
//! Tick and restart scheduling for one container are serialised: an entry is
//! `Idle`, `PendingRestart`, or `Restarting`, and only the monitor task
//! writes transitions. The decision logic is pure ([`on_tick`]) so the
//! breaker arithmetic is testable without a runtime.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ploinky_workspace::{AgentsRegistry, RecordStatus, WorkspacePaths};

use crate::{
    adapter::{ContainerRuntime, ContainerState},
    error::Result,
};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const INITIAL_BACKOFF_MS: u64 = 1_000;
pub const MAX_BACKOFF_MS: u64 = 30_000;
pub const BACKOFF_MULTIPLIER: u64 = 2;
pub const RESTART_WINDOW_MS: u64 = 60_000;
pub const MAX_RESTARTS_IN_WINDOW: usize = 5;
/// Running this long resets the backoff and clears the breaker.
pub const STABLE_RUNNING_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Idle,
    PendingRestart,
    Restarting,
}

/// Per-container supervision state.
#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub state: TargetState,
    pub backoff_ms: u64,
    pub restart_history: Vec<Instant>,
    pub breaker_tripped: bool,
    pub running_since: Option<Instant>,
    pub last_seen_running: Option<Instant>,
    pub restart_due: Option<Instant>,
}

impl MonitorEntry {
    pub fn new() -> Self {
        Self {
            state: TargetState::Idle,
            backoff_ms: INITIAL_BACKOFF_MS,
            restart_history: Vec::new(),
            breaker_tripped: false,
            running_since: None,
            last_seen_running: None,
            restart_due: None,
        }
    }

    /// Manual intervention: clears the breaker and resets the backoff.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for MonitorEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// What the state of a container looked like on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Running,
    Exited,
    Missing,
}

/// Decision produced by one tick for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    None,
    /// Start the container after the given delay.
    ScheduleRestart(Duration),
    /// The pending restart timer elapsed; restart now.
    RestartNow,
    /// Too many restarts inside the window; breaker is now tripped.
    BreakerTripped,
}

/// Pure tick logic for a single container.
pub fn on_tick(entry: &mut MonitorEntry, observed: Observed, now: Instant) -> TickAction {
    if observed == Observed::Running {
        entry.last_seen_running = Some(now);
        let since = *entry.running_since.get_or_insert(now);
        if now.duration_since(since) >= Duration::from_secs(STABLE_RUNNING_SECS) {
            entry.backoff_ms = INITIAL_BACKOFF_MS;
            entry.breaker_tripped = false;
            entry.restart_history.clear();
        }
        entry.state = TargetState::Idle;
        entry.restart_due = None;
        return TickAction::None;
    }

    entry.running_since = None;
    if entry.breaker_tripped {
        return TickAction::None;
    }

    match entry.state {
        TargetState::Restarting => TickAction::None,
        TargetState::PendingRestart => {
            if entry.restart_due.map(|due| now >= due).unwrap_or(true) {
                entry.state = TargetState::Restarting;
                entry.restart_due = None;
                TickAction::RestartNow
            } else {
                TickAction::None
            }
        },
        TargetState::Idle => {
            let window = Duration::from_millis(RESTART_WINDOW_MS);
            entry
                .restart_history
                .retain(|t| now.duration_since(*t) <= window);
            if entry.restart_history.len() >= MAX_RESTARTS_IN_WINDOW {
                entry.breaker_tripped = true;
                return TickAction::BreakerTripped;
            }
            let delay = Duration::from_millis(entry.backoff_ms.min(MAX_BACKOFF_MS));
            entry.backoff_ms = (entry.backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            entry.restart_history.push(now);
            entry.state = TargetState::PendingRestart;
            entry.restart_due = Some(now + delay);
            TickAction::ScheduleRestart(delay)
        },
    }
}

/// Events surfaced to the router for logging and status.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    RestartScheduled {
        container_name: String,
        delay: Duration,
    },
    Restarted {
        container_name: String,
    },
    RestartFailed {
        container_name: String,
        detail: String,
    },
    /// `container_circuit_breaker_tripped`
    BreakerTripped {
        container_name: String,
    },
}

/// The monitor task state. Runs inside the router process.
pub struct ContainerMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    paths: WorkspacePaths,
    entries: HashMap<String, MonitorEntry>,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl ContainerMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        paths: WorkspacePaths,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            runtime,
            paths,
            entries: HashMap::new(),
            events,
        }
    }

    /// Reset one container's supervision state (manual intervention after a
    /// breaker trip).
    pub fn reset_entry(&mut self, container_name: &str) {
        if let Some(entry) = self.entries.get_mut(container_name) {
            entry.reset();
        }
    }

    /// Run the reconciliation loop until the events receiver is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "monitor tick failed");
            }
            if self.events.is_closed() {
                return;
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        let registry = AgentsRegistry::load(&self.paths)?;
        let running = self.runtime.ps().await.unwrap_or_default();
        let now = Instant::now();

        // Drop entries whose record disappeared; pick up renames atomically
        // by keying purely on the registry's current container names.
        self.entries
            .retain(|name, _| registry.records.contains_key(name));

        let names: Vec<String> = registry.records.keys().cloned().collect();
        for name in names {
            let record_failed = registry
                .get(&name)
                .map(|r| r.status == RecordStatus::Failed)
                .unwrap_or(false);
            let entry = self.entries.entry(name.clone()).or_default();
            if record_failed && entry.breaker_tripped {
                continue;
            }

            let observed = if running.contains(&name) {
                Observed::Running
            } else {
                match self.runtime.inspect(&name).await? {
                    Some(ContainerState::Running) => Observed::Running,
                    Some(_) => Observed::Exited,
                    None => Observed::Missing,
                }
            };

            match on_tick(entry, observed, now) {
                TickAction::None => {},
                TickAction::ScheduleRestart(delay) => {
                    debug!(container = %name, delay_ms = delay.as_millis() as u64, "restart scheduled");
                    let _ = self.events.send(MonitorEvent::RestartScheduled {
                        container_name: name.clone(),
                        delay,
                    });
                },
                TickAction::RestartNow => {
                    self.restart(&name, observed).await;
                },
                TickAction::BreakerTripped => {
                    warn!(container = %name, "container_circuit_breaker_tripped");
                    self.mark_failed(&name);
                    let _ = self.events.send(MonitorEvent::BreakerTripped {
                        container_name: name.clone(),
                    });
                },
            }
        }
        Ok(())
    }

    async fn restart(&mut self, name: &str, observed: Observed) {
        // A missing container means the manifest-driven spec is needed to
        // recreate it; the monitor only restarts exited containers. Missing
        // ones count as a failed restart so the breaker still engages.
        let result = if observed == Observed::Missing {
            Err(crate::error::Error::Missing {
                name: name.to_string(),
            })
        } else {
            self.runtime.start(name).await
        };
        let tripped = {
            let entry = self.entries.entry(name.to_string()).or_default();
            entry.state = TargetState::Idle;
            match &result {
                Ok(()) => {
                    entry.running_since = Some(Instant::now());
                    false
                },
                Err(e) if e.code() == "container_missing" || e.code() == "manifest_parse" => {
                    entry.breaker_tripped = true;
                    true
                },
                Err(_) => false,
            }
        };
        match result {
            Ok(()) => {
                info!(container = %name, "container restarted");
                let _ = self.events.send(MonitorEvent::Restarted {
                    container_name: name.to_string(),
                });
            },
            Err(e) => {
                warn!(container = %name, error = %e, "container restart failed");
                if tripped {
                    self.mark_failed(name);
                    let _ = self.events.send(MonitorEvent::BreakerTripped {
                        container_name: name.to_string(),
                    });
                } else {
                    let _ = self.events.send(MonitorEvent::RestartFailed {
                        container_name: name.to_string(),
                        detail: e.to_string(),
                    });
                }
            },
        }
    }

    fn mark_failed(&self, name: &str) {
        let Ok(mut registry) = AgentsRegistry::load(&self.paths) else {
            return;
        };
        if let Some(record) = registry.get_mut(name) {
            record.status = RecordStatus::Failed;
            let _ = registry.save();
        }
    }
}
