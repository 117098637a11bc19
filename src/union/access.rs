//! Access control gate
//!
//! Authorizes create/remove/access operations against the resolved,
//! override-aware attribute view and the caller's identity, before any
//! mutation happens. User-facing names in the reserved marker namespace
//! are rejected here so no tool can forge or clobber union state.

use crate::error::{Error, Result};
use crate::union::attr::FileAttributes;
use crate::union::branch::{is_reserved_name, Branches};
use crate::union::locks::PathLocks;
use crate::union::meta::OverrideManager;
use crate::union::resolve::{Origin, PathResolver};
use std::path::Path;
use std::sync::Arc;

/// Identity an operation runs as
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    /// Identity of the current process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::Uid::effective().as_raw(),
            gid: nix::unistd::Gid::effective().as_raw(),
        }
    }
}

/// Checks operations against merged attributes and caller identity
pub struct AccessGate {
    resolver: PathResolver,
    overrides: OverrideManager,
}

impl AccessGate {
    pub fn new(branches: Arc<Branches>, locks: Arc<PathLocks>) -> Self {
        Self {
            resolver: PathResolver::new(branches.clone()),
            overrides: OverrideManager::new(branches, locks),
        }
    }

    /// May the caller access an existing entry with the given mask
    /// (`libc::R_OK` / `W_OK` / `X_OK` bits)?
    pub fn can_access(&self, logical: &Path, caller: &Caller, mask: u32) -> Result<()> {
        let (_, attrs) = self.overrides.get_attributes(logical)?;
        check_mask(&attrs, caller, mask, logical)
    }

    /// May the caller create a new entry at the logical path?
    ///
    /// Rejects reserved marker names outright, then requires write and
    /// search permission on the merged view of the parent directory.
    pub fn can_create(&self, logical: &Path, caller: &Caller) -> Result<()> {
        if let Some(name) = logical.file_name().and_then(|n| n.to_str()) {
            if is_reserved_name(name) {
                return Err(Error::PermissionDenied(logical.to_path_buf()));
            }
        }
        let logical = Branches::normalize(logical)?;
        let (parent, _) = Branches::parent_and_name(&logical)?;
        let (_, parent_attrs) = self.overrides.get_attributes(parent)?;
        check_mask(
            &parent_attrs,
            caller,
            (libc::W_OK | libc::X_OK) as u32,
            &logical,
        )
    }

    /// May the caller remove the entry at the logical path?
    pub fn can_remove(&self, logical: &Path, caller: &Caller) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let (parent, _) = Branches::parent_and_name(&logical)?;
        let (_, parent_attrs) = self.overrides.get_attributes(parent)?;
        check_mask(
            &parent_attrs,
            caller,
            (libc::W_OK | libc::X_OK) as u32,
            &logical,
        )?;

        // Sticky parent: only the entry's owner, the directory's owner or
        // root may remove.
        if parent_attrs.mode & 0o1000 != 0 && caller.uid != 0 {
            let (_, attrs) = self.overrides.get_attributes(&logical)?;
            if caller.uid != attrs.uid && caller.uid != parent_attrs.uid {
                return Err(Error::PermissionDenied(logical));
            }
        }
        Ok(())
    }

    /// Resolve-or-fail helper for gate users needing existence + origin.
    pub fn resolve_origin(&self, logical: &Path) -> Result<Origin> {
        Ok(self.resolver.resolve(logical)?.origin)
    }
}

/// Classic owner/group/other permission-bit check.
fn check_mask(attrs: &FileAttributes, caller: &Caller, mask: u32, logical: &Path) -> Result<()> {
    if caller.uid == 0 {
        return Ok(());
    }

    let shift = if caller.uid == attrs.uid {
        6
    } else if caller.gid == attrs.gid {
        3
    } else {
        0
    };
    let granted = (attrs.mode >> shift) & 0o7;

    let mut needed = 0;
    if mask & libc::R_OK as u32 != 0 {
        needed |= 0o4;
    }
    if mask & libc::W_OK as u32 != 0 {
        needed |= 0o2;
    }
    if mask & libc::X_OK as u32 != 0 {
        needed |= 0o1;
    }

    if granted & needed == needed {
        Ok(())
    } else {
        Err(Error::PermissionDenied(logical.to_path_buf()))
    }
}
