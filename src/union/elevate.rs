//! Scoped privilege elevation
//!
//! Whiteout creation must succeed even when the calling user cannot write
//! the entry being hidden, so the single marker-creation call runs under
//! superuser credentials. The scope is explicit: acquired immediately
//! before the privileged call, restored on drop. When the process has no
//! saved root identity the scope degrades to a no-op and markers stay
//! owned by the mounting user.

use nix::unistd::{setegid, seteuid, Gid, Uid};
use tracing::warn;

/// RAII guard restoring the previous effective identity on drop.
pub struct ElevatedScope {
    restore: Option<(Uid, Gid)>,
}

impl ElevatedScope {
    /// Switch the effective identity to root for the duration of the scope.
    pub fn acquire() -> Self {
        let euid = Uid::effective();
        let egid = Gid::effective();
        if euid.is_root() {
            return Self { restore: None };
        }

        // Only a process whose real or saved uid is root may raise its
        // effective uid back to root.
        match seteuid(Uid::from_raw(0)) {
            Ok(()) => {
                if let Err(e) = setegid(Gid::from_raw(0)) {
                    warn!("elevated uid but not gid: {}", e);
                }
                Self {
                    restore: Some((euid, egid)),
                }
            }
            Err(_) => Self { restore: None },
        }
    }

    /// Whether the scope actually runs with root credentials.
    pub fn is_root(&self) -> bool {
        Uid::effective().is_root()
    }
}

impl Drop for ElevatedScope {
    fn drop(&mut self) {
        if let Some((euid, egid)) = self.restore.take() {
            if let Err(e) = setegid(egid) {
                warn!("failed to restore effective gid: {}", e);
            }
            if let Err(e) = seteuid(euid) {
                warn!("failed to restore effective uid: {}", e);
            }
        }
    }
}
