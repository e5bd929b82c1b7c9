//! Lifecycle event and crash logging.
//!
//! One JSON record per line in `.ploinky/logs/router.log`. Writes never
//! fail the caller: when stdout/stderr or the log file are broken the
//! record is dropped silently and the server keeps serving.

use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tracing::debug;

/// Append-only JSON-lines event log shared across the router.
#[derive(Clone)]
pub struct LifecycleLog {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl LifecycleLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append an event record with an ISO-8601 timestamp.
    pub fn event(&self, event: &str, fields: serde_json::Value) {
        let mut record = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "event": event,
        });
        if let (Some(obj), Some(extra)) = (record.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.append_line(&record);
    }

    /// Append a structured crash record (uncaught panic, fatal error).
    pub fn crash(&self, detail: &str) {
        self.event("crash", serde_json::json!({ "detail": detail }));
    }

    fn append_line(&self, record: &serde_json::Value) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&*self.path)
        else {
            return;
        };
        let _ = writeln!(file, "{record}");
    }

    /// The last `n` records, oldest first. Unparseable lines are skipped.
    pub fn last(&self, n: usize) -> Vec<serde_json::Value> {
        let Ok(text) = std::fs::read_to_string(&*self.path) else {
            return Vec::new();
        };
        let records: Vec<serde_json::Value> = text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = records.len().saturating_sub(n);
        records.into_iter().skip(skip).collect()
    }
}

/// Install a panic hook that writes a crash record before unwinding.
pub fn install_crash_hook(log: LifecycleLog) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log.crash(&info.to_string());
        debug!("panic recorded in lifecycle log");
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = LifecycleLog::new(dir.path().join("router.log"));
        log.event("router_started", serde_json::json!({ "port": 21080 }));
        log.event("agent_ready", serde_json::json!({ "agent": "web" }));

        let records = log.last(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["event"], "router_started");
        assert_eq!(records[0]["port"], 21080);
        assert!(records[0]["ts"].is_string());
        assert_eq!(records[1]["agent"], "web");
    }

    #[test]
    fn test_last_limits_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let log = LifecycleLog::new(dir.path().join("router.log"));
        for i in 0..5 {
            log.event("tick", serde_json::json!({ "i": i }));
        }
        let records = log.last(2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["i"], 3);
        assert_eq!(records[1]["i"], 4);
    }

    #[test]
    fn test_broken_path_is_silent() {
        let log = LifecycleLog::new(PathBuf::from("/proc/definitely/not/writable.log"));
        log.event("ignored", serde_json::json!({}));
        assert!(log.last(1).is_empty());
    }
}
