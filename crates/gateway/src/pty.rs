//! PTY session broker backing the browser terminal and chat tabs.
//!
//! Tabs are keyed by (session id, tab id). Caps: at most 20 live tabs
//! across all sessions, at most 3 per session, and at least one second
//! between connects on the same tab id. Output flows to the browser as an
//! SSE stream of JSON frames with a periodic keep-alive comment; input and
//! resize arrive as POSTs.

use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use {
    portable_pty::{CommandBuilder, PtySize, native_pty_system},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use crate::error::{Error, Result};

pub const MAX_GLOBAL_TABS: usize = 20;
pub const MAX_TABS_PER_SESSION: usize = 3;
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KILL_GRACE: Duration = Duration::from_secs(2);

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// What to launch inside the PTY.
#[derive(Debug, Clone)]
pub enum PtyCommand {
    /// A local shell (token-gated terminal).
    Shell(String),
    /// `exec` into a named container through the runtime binary.
    ContainerExec {
        runtime_binary: String,
        container: String,
        command: String,
    },
}

impl PtyCommand {
    fn build(&self) -> CommandBuilder {
        match self {
            Self::Shell(shell) => {
                let mut cmd = CommandBuilder::new(shell);
                cmd.env("TERM", "xterm-256color");
                cmd
            },
            Self::ContainerExec {
                runtime_binary,
                container,
                command,
            } => {
                let mut cmd = CommandBuilder::new(runtime_binary);
                cmd.args(["exec", "-it", container, "sh", "-lc", command]);
                cmd.env("TERM", "xterm-256color");
                cmd
            },
        }
    }
}

/// Why a tab was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// 503 — the global cap is reached.
    GlobalCapacity,
    /// 429 `Retry-After: 5` — the session already holds its 3 tabs.
    SessionCapacity,
    /// 429 `Retry-After: 1` — reconnecting faster than the debounce.
    Reconnect,
}

struct PtyTab {
    writer: Box<dyn Write + Send>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    created_at: Instant,
}

struct Tables {
    tabs: HashMap<(String, String), PtyTab>,
    /// Connect timestamps survive disposal so the reconnect debounce holds
    /// across a disconnect/reconnect cycle.
    recent_connects: HashMap<(String, String), Instant>,
}

/// Bounded pool of live PTY tabs. Only the router process mutates it.
pub struct PtyBroker {
    tables: StdMutex<Tables>,
}

impl Default for PtyBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyBroker {
    pub fn new() -> Self {
        Self {
            tables: StdMutex::new(Tables {
                tabs: HashMap::new(),
                recent_connects: HashMap::new(),
            }),
        }
    }

    pub fn live_tabs(&self) -> usize {
        self.lock().tabs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admission control for a new connect on (session, tab). Pure
    /// bookkeeping: no PTY is allocated here.
    pub fn admit(&self, session: &str, tab: &str, now: Instant) -> std::result::Result<(), Refusal> {
        let tables = self.lock();
        let key = (session.to_string(), tab.to_string());
        if let Some(last) = tables.recent_connects.get(&key)
            && now.duration_since(*last) < MIN_RECONNECT_INTERVAL
        {
            return Err(Refusal::Reconnect);
        }
        let replacing = tables.tabs.contains_key(&key);
        if !replacing && tables.tabs.len() >= MAX_GLOBAL_TABS {
            return Err(Refusal::GlobalCapacity);
        }
        let in_session = tables.tabs.keys().filter(|(s, _)| s == session).count();
        if !replacing && in_session >= MAX_TABS_PER_SESSION {
            return Err(Refusal::SessionCapacity);
        }
        Ok(())
    }

    /// Allocate a PTY for (session, tab), replacing any previous tab under
    /// the same key, and return its output stream.
    pub fn open(
        &self,
        session: &str,
        tab: &str,
        command: &PtyCommand,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Message {
                message: format!("failed to open pty: {e}"),
            })?;

        let child = pair
            .slave
            .spawn_command(command.build())
            .map_err(|e| Error::Message {
                message: format!("failed to spawn pty command: {e}"),
            })?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().map_err(|e| Error::Message {
            message: format!("failed to clone pty reader: {e}"),
        })?;
        let writer = pair.master.take_writer().map_err(|e| Error::Message {
            message: format!("failed to take pty writer: {e}"),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    },
                }
            }
        });

        let key = (session.to_string(), tab.to_string());
        let now = Instant::now();
        let previous = {
            let mut tables = self.lock();
            tables.recent_connects.insert(key.clone(), now);
            tables.tabs.insert(key, PtyTab {
                writer,
                master: pair.master,
                child,
                created_at: now,
            })
        };
        if let Some(previous) = previous {
            dispose_tab(previous);
        }
        debug!(session, tab, "pty tab allocated");
        Ok(rx)
    }

    /// Pipe raw input bytes into the tab's stdin.
    pub fn write(&self, session: &str, tab: &str, data: &[u8]) -> Result<()> {
        let mut tables = self.lock();
        let key = (session.to_string(), tab.to_string());
        let tab = tables.tabs.get_mut(&key).ok_or_else(|| Error::Message {
            message: "no such tab".to_string(),
        })?;
        tab.writer.write_all(data).map_err(|e| Error::Message {
            message: format!("pty write failed: {e}"),
        })
    }

    pub fn resize(&self, session: &str, tab: &str, cols: u16, rows: u16) -> Result<()> {
        let mut tables = self.lock();
        let key = (session.to_string(), tab.to_string());
        let tab = tables.tabs.get_mut(&key).ok_or_else(|| Error::Message {
            message: "no such tab".to_string(),
        })?;
        tab.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Message {
                message: format!("pty resize failed: {e}"),
            })
    }

    /// Remove and dispose one tab (client disconnect).
    pub fn dispose(&self, session: &str, tab: &str) {
        let removed = {
            let mut tables = self.lock();
            tables
                .tabs
                .remove(&(session.to_string(), tab.to_string()))
        };
        if let Some(tab_entry) = removed {
            debug!(session, tab, "pty tab disposed");
            dispose_tab(tab_entry);
        }
    }

    /// Dispose every tab (graceful shutdown).
    pub fn dispose_all(&self) {
        let tabs: Vec<PtyTab> = {
            let mut tables = self.lock();
            tables.recent_connects.clear();
            tables.tabs.drain().map(|(_, tab)| tab).collect()
        };
        for tab in tabs {
            dispose_tab(tab);
        }
    }
}

/// Drop the writer and master, then SIGKILL the child after a grace period
/// if it is still alive.
fn dispose_tab(tab: PtyTab) {
    let PtyTab {
        writer,
        master,
        mut child,
        created_at,
    } = tab;
    drop(writer);
    drop(master);
    std::thread::spawn(move || {
        std::thread::sleep(KILL_GRACE);
        match child.try_wait() {
            Ok(Some(_)) => {},
            _ => {
                warn!(age_secs = created_at.elapsed().as_secs(), "killing lingering pty child");
                let _ = child.kill();
            },
        }
    });
}

/// Dispose the tab when the SSE stream is dropped (client disconnect).
pub struct DisposeOnDrop {
    pub broker: Arc<crate::state::GatewayState>,
    pub session: String,
    pub tab: String,
}

impl Drop for DisposeOnDrop {
    fn drop(&mut self) {
        self.broker.pty.dispose(&self.session, &self.tab);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_fake_tabs(entries: &[(&str, &str)]) -> PtyBroker {
        // Admission only reads the key sets, so fake tabs suffice; a real
        // PTY per test would exhaust test-runner ptys.
        let broker = PtyBroker::new();
        {
            let mut tables = broker.lock();
            for (session, tab) in entries {
                let pair = native_pty_system()
                    .openpty(PtySize {
                        rows: 4,
                        cols: 4,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .unwrap();
                let mut cmd = CommandBuilder::new("sh");
                cmd.args(["-c", "sleep 30"]);
                let child = pair.slave.spawn_command(cmd).unwrap();
                let writer = pair.master.take_writer().unwrap();
                tables.tabs.insert(((*session).to_string(), (*tab).to_string()), PtyTab {
                    writer,
                    master: pair.master,
                    child,
                    created_at: Instant::now(),
                });
            }
        }
        broker
    }

    #[test]
    fn test_session_cap_and_release() {
        let broker = broker_with_fake_tabs(&[("s1", "t1"), ("s1", "t2"), ("s1", "t3")]);
        let now = Instant::now();
        assert_eq!(
            broker.admit("s1", "t4", now),
            Err(Refusal::SessionCapacity)
        );
        // Another session is unaffected.
        assert_eq!(broker.admit("s2", "t1", now), Ok(()));

        broker.dispose("s1", "t2");
        assert_eq!(broker.admit("s1", "t4", now), Ok(()));
        broker.dispose_all();
    }

    #[test]
    fn test_global_cap() {
        let entries: Vec<(String, String)> = (0..MAX_GLOBAL_TABS)
            .map(|i| (format!("s{}", i / 2), format!("t{i}")))
            .collect();
        let refs: Vec<(&str, &str)> = entries
            .iter()
            .map(|(s, t)| (s.as_str(), t.as_str()))
            .collect();
        let broker = broker_with_fake_tabs(&refs);
        assert_eq!(broker.live_tabs(), MAX_GLOBAL_TABS);
        assert_eq!(
            broker.admit("fresh", "t0", Instant::now()),
            Err(Refusal::GlobalCapacity)
        );
        broker.dispose_all();
        assert_eq!(broker.live_tabs(), 0);
    }

    #[test]
    fn test_reconnect_debounce() {
        let broker = PtyBroker::new();
        let now = Instant::now();
        {
            let mut tables = broker.lock();
            tables
                .recent_connects
                .insert(("s1".to_string(), "t1".to_string()), now);
        }
        assert_eq!(
            broker.admit("s1", "t1", now + Duration::from_millis(200)),
            Err(Refusal::Reconnect)
        );
        assert_eq!(
            broker.admit("s1", "t1", now + MIN_RECONNECT_INTERVAL),
            Ok(())
        );
    }

    #[test]
    fn test_open_write_read_roundtrip() {
        let broker = PtyBroker::new();
        let mut rx = broker
            .open("s1", "t1", &PtyCommand::Shell("sh".to_string()))
            .unwrap();
        broker.write("s1", "t1", b"printf 'marker-%s' ok; exit\n").unwrap();
        let mut collected = String::new();
        while let Some(chunk) = rx.blocking_recv() {
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.contains("marker-ok") {
                break;
            }
        }
        assert!(collected.contains("marker-ok"));
        broker.dispose("s1", "t1");
    }
}
