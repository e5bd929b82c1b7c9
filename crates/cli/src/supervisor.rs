//! Router process supervision: spawn, PID file, graceful stop.

use std::{fs, path::PathBuf, process::Stdio, time::Duration};

use {
    anyhow::{Context, bail},
    nix::sys::signal::{Signal, kill},
    nix::unistd::Pid,
    tracing::debug,
};

use ploinky_workspace::WorkspacePaths;

/// PID file path, honouring `PLOINKY_ROUTER_PID_FILE`.
pub fn pid_file(paths: &WorkspacePaths) -> PathBuf {
    std::env::var("PLOINKY_ROUTER_PID_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| paths.router_pid())
}

pub fn read_pid(paths: &WorkspacePaths) -> Option<i32> {
    let text = fs::read_to_string(pid_file(paths)).ok()?;
    text.trim().parse().ok()
}

pub fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// The router pid when one is running; stale files are silently replaced
/// by the next spawn.
pub fn running_router(paths: &WorkspacePaths) -> Option<i32> {
    read_pid(paths).filter(|pid| is_alive(*pid))
}

/// Spawn `ploinky router --port <port>` detached, logging into the router
/// log file, and record its pid.
pub fn spawn_router(paths: &WorkspacePaths, port: u16) -> anyhow::Result<i32> {
    if let Some(pid) = running_router(paths) {
        bail!("router already running (pid {pid}); run stop first");
    }

    let exe = std::env::current_exe().context("cannot locate the ploinky binary")?;
    fs::create_dir_all(paths.logs_dir())?;
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.router_log())
        .context("cannot open router log")?;

    let child = std::process::Command::new(exe)
        .args(["router", "--port", &port.to_string()])
        .current_dir(paths.root())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .spawn()
        .context("failed to spawn router")?;

    let pid = child.id() as i32;
    let file = pid_file(paths);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&file, format!("{pid}\n"))?;
    debug!(pid, file = %file.display(), "router spawned");
    Ok(pid)
}

/// SIGTERM the router and wait for it to exit; escalate to SIGKILL after
/// the grace window. No-op when nothing is running.
pub fn stop_router(paths: &WorkspacePaths) -> anyhow::Result<bool> {
    let Some(pid) = running_router(paths) else {
        let _ = fs::remove_file(pid_file(paths));
        return Ok(false);
    };
    let target = Pid::from_raw(pid);
    let _ = kill(target, Signal::SIGTERM);
    for _ in 0..100 {
        if !is_alive(pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if is_alive(pid) {
        let _ = kill(target, Signal::SIGKILL);
    }
    let _ = fs::remove_file(pid_file(paths));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_pid_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        fs::create_dir_all(paths.running_dir()).unwrap();
        // A pid that cannot exist.
        fs::write(paths.router_pid(), "999999999\n").unwrap();
        assert_eq!(read_pid(&paths), Some(999_999_999));
        assert_eq!(running_router(&paths), None);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn test_stop_without_router_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        assert!(!stop_router(&paths).unwrap());
    }
}
