use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use parking_lot::{Mutex, RawRwLock, RwLock};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use tracing::{trace, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ResourcePath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub released: u64,
    pub tracked_paths: usize,
}

impl LockStats {
    pub fn held(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

struct LockTable {
    locks: Mutex<HashMap<ResourcePath, Arc<RwLock<()>>>>,
    timeout: Option<Duration>,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Per-resource reader/writer locks, created on demand and dropped once unused.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    /// `timeout` bounds every acquisition; `None` waits indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        LockManager {
            table: Arc::new(LockTable {
                locks: Mutex::new(HashMap::new()),
                timeout,
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    pub fn acquire(&self, path: &ResourcePath, mode: LockMode) -> Result<ResourceLock> {
        let lock = {
            let mut locks = self.table.locks.lock();
            locks
                .entry(path.clone())
                .or_insert_with(|| Arc::new(RwLock::new(())))
                .clone()
        };

        let held = match (mode, self.table.timeout) {
            (LockMode::Read, Some(timeout)) => lock.try_read_arc_for(timeout).map(Held::Read),
            (LockMode::Write, Some(timeout)) => lock.try_write_arc_for(timeout).map(Held::Write),
            (LockMode::Read, None) => Some(Held::Read(lock.read_arc())),
            (LockMode::Write, None) => Some(Held::Write(lock.write_arc())),
        };
        drop(lock);

        let Some(held) = held else {
            self.table.prune(path);
            warn!(%path, %mode, "lock acquisition timed out");
            return Err(Error::new(
                ErrorKind::LockFailure,
                format!("Timed out waiting for {} lock on {}", mode, path),
            ));
        };

        self.table.acquired.fetch_add(1, Ordering::Relaxed);
        trace!(%path, %mode, "lock acquired");
        Ok(ResourceLock {
            path: path.clone(),
            mode,
            held: Some(held),
            table: self.table.clone(),
        })
    }

    pub fn read(&self, path: &ResourcePath) -> Result<ResourceLock> {
        self.acquire(path, LockMode::Read)
    }

    pub fn write(&self, path: &ResourcePath) -> Result<ResourceLock> {
        self.acquire(path, LockMode::Write)
    }

    pub fn stats(&self) -> LockStats {
        let released = self.table.released.load(Ordering::Acquire);
        LockStats {
            acquired: self.table.acquired.load(Ordering::Acquire),
            released,
            tracked_paths: self.table.locks.lock().len(),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new(None)
    }
}

impl LockTable {
    fn prune(&self, path: &ResourcePath) {
        let mut locks = self.locks.lock();
        if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(path);
        }
    }
}

enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A held lock on one resource. Released exactly once, when dropped.
pub struct ResourceLock {
    path: ResourcePath,
    mode: LockMode,
    held: Option<Held>,
    table: Arc<LockTable>,
}

impl ResourceLock {
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn release(self) {}
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            drop(held);
            self.table.released.fetch_add(1, Ordering::Release);
            self.table.prune(&self.path);
            trace!(path = %self.path, mode = %self.mode, "lock released");
        }
    }
}
