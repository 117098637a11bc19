//! Per-logical-path mutual exclusion
//!
//! Multi-step sequences (copy-up, whiteout-then-unlink) are not atomic at
//! the branch level, so each runs under the lock of its normalized logical
//! path. Two concurrent mutations of the same path serialize; the loser
//! re-resolves under the lock and observes the winner's result.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lock table keyed by normalized logical path
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

/// Guard holding one logical path's lock
pub struct PathGuard {
    lock: Arc<Mutex<()>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the lock for a logical path, blocking until available.
    pub fn lock(&self, logical: &Path) -> PathGuard {
        let lock = self
            .locks
            .entry(logical.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PathGuard { lock }
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl PathGuard {
    /// Hold the guard for the duration of `f`.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _held: MutexGuard<'_, ()> = self.lock.lock();
        f()
    }
}
