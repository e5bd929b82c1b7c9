//! Host-port allocation.
//!
//! Allocation happens under a cross-process file lock so two CLI runs (or a
//! CLI run racing the router's reconciliation) never hand out the same port.
//! Within the lock, the kernel picks a free ephemeral port and the registry
//! is consulted for ports already recorded but currently unbound.

use std::{fs, net::TcpListener};

use fd_lock::RwLock as FileLock;

use crate::{AgentsRegistry, Error, Result, WorkspacePaths};

const ALLOC_ATTEMPTS: usize = 16;

/// Cross-process lock serialising port allocation and the registry write
/// that records the result.
pub struct PortAllocator {
    lock: FileLock<fs::File>,
}

impl PortAllocator {
    pub fn open(paths: &WorkspacePaths) -> Result<Self> {
        fs::create_dir_all(paths.running_dir())?;
        let path = paths.running_dir().join("ports.lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Ok(Self {
            lock: FileLock::new(file),
        })
    }

    /// Run `f` while holding the allocation lock. Allocate every port the
    /// reconciliation needs and persist the registry inside the closure.
    pub fn with_lock<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock.write().map_err(|e| Error::PortAllocation {
            detail: format!("failed to take port allocation lock: {e}"),
        })?;
        f()
    }
}

/// Pick a free ephemeral port on loopback that no registry record claims.
/// Call with the allocation lock held.
pub fn allocate_host_port(registry: &AgentsRegistry) -> Result<u16> {
    let claimed = registry.claimed_host_ports();
    for _ in 0..ALLOC_ATTEMPTS {
        let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| Error::PortAllocation {
            detail: e.to_string(),
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::PortAllocation {
                detail: e.to_string(),
            })?
            .port();
        drop(listener);
        if !claimed.contains(&port) {
            return Ok(port);
        }
    }
    Err(Error::PortAllocation {
        detail: format!("no free port found after {ALLOC_ATTEMPTS} attempts"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, WorkspacePaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        fs::create_dir_all(paths.dot_ploinky()).unwrap();
        (dir, paths)
    }

    #[test]
    fn test_allocate_returns_ephemeral_port() {
        let (_dir, paths) = setup();
        let registry = AgentsRegistry::load(&paths).unwrap();
        let port = allocate_host_port(&registry).unwrap();
        assert!(port > 1024);
    }

    #[test]
    fn test_with_lock_runs_closure_and_releases() {
        let (_dir, paths) = setup();
        let mut alloc = PortAllocator::open(&paths).unwrap();
        let value = alloc.with_lock(|| Ok(7)).unwrap();
        assert_eq!(value, 7);
        // Lock can be retaken after release.
        let again = alloc.with_lock(|| Ok(8)).unwrap();
        assert_eq!(again, 8);
    }
}
