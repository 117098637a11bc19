//! Metadata-override records
//!
//! Attribute-only changes to read-only entries never trigger copy-up.
//! They are recorded in a `.me.<name>` file next to the would-be writable
//! copy, holding only the fields that differ from the read-only original.
//! The record is JSON with every field optional, so readers tolerate
//! fields added by later versions.

use crate::error::{Error, Result};
use crate::union::attr::{AttrChanges, FileAttributes, TimeChange, Timestamp};
use crate::union::branch::Branches;
use crate::union::locks::PathLocks;
use crate::union::resolve::{Origin, PathResolver, Resolution};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// On-disk attribute-delta record. Absent fields mean "read-only
/// original is authoritative".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<Timestamp>,
}

impl OverrideRecord {
    pub fn is_empty(&self) -> bool {
        *self == OverrideRecord::default()
    }

    /// Apply the recorded deltas on top of the read-only attributes.
    pub fn apply_to(&self, attrs: &mut FileAttributes) {
        if let Some(mode) = self.mode {
            attrs.mode = mode & 0o7777;
        }
        if let Some(uid) = self.uid {
            attrs.uid = uid;
        }
        if let Some(gid) = self.gid {
            attrs.gid = gid;
        }
        if let Some(atime) = self.atime {
            attrs.atime = atime.to_system_time();
        }
        if let Some(mtime) = self.mtime {
            attrs.mtime = mtime.to_system_time();
        }
    }

    /// Fold a setattr delta into the record.
    pub fn merge(&mut self, changes: &AttrChanges) {
        if let Some(mode) = changes.mode {
            self.mode = Some(mode & 0o7777);
        }
        if let Some(uid) = changes.uid {
            self.uid = Some(uid);
        }
        if let Some(gid) = changes.gid {
            self.gid = Some(gid);
        }
        if let Some(atime) = changes.atime {
            self.atime = Some(Timestamp::from_system_time(atime.resolve()));
        }
        if let Some(mtime) = changes.mtime {
            self.mtime = Some(Timestamp::from_system_time(mtime.resolve()));
        }
    }

    /// Drop every field that now equals the read-only original, keeping
    /// the record minimal.
    pub fn prune_against(&mut self, original: &FileAttributes) {
        if self.mode == Some(original.mode) {
            self.mode = None;
        }
        if self.uid == Some(original.uid) {
            self.uid = None;
        }
        if self.gid == Some(original.gid) {
            self.gid = None;
        }
        if self.atime == Some(Timestamp::from_system_time(original.atime)) {
            self.atime = None;
        }
        if self.mtime == Some(Timestamp::from_system_time(original.mtime)) {
            self.mtime = None;
        }
    }
}

/// Records attribute deltas for read-only entries
pub struct OverrideManager {
    branches: Arc<Branches>,
    resolver: PathResolver,
    locks: Arc<PathLocks>,
}

impl OverrideManager {
    pub fn new(branches: Arc<Branches>, locks: Arc<PathLocks>) -> Self {
        Self {
            resolver: PathResolver::new(branches.clone()),
            branches,
            locks,
        }
    }

    /// Load the override record for a logical path, if any.
    pub fn load(&self, logical: &Path) -> Result<Option<OverrideRecord>> {
        let logical = Branches::normalize(logical)?;
        if logical == Path::new("/") {
            return Ok(None);
        }
        let me = self.branches.override_path(&logical)?;
        let bytes = match std::fs::read(&me) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::from_branch_io(e, &logical)),
        };
        let record = serde_json::from_slice(&bytes).map_err(|e| Error::Inconsistent {
            path: logical.clone(),
            detail: format!("unreadable override record: {}", e),
        })?;
        Ok(Some(record))
    }

    /// Persist a record, or delete it when it carries no deltas.
    fn store(&self, logical: &Path, record: &OverrideRecord) -> Result<()> {
        if record.is_empty() {
            return self.remove(logical);
        }
        self.resolver.find_path(logical)?;
        let me = self.branches.override_path(logical)?;
        let bytes = serde_json::to_vec(record).map_err(|e| Error::Inconsistent {
            path: logical.to_path_buf(),
            detail: format!("unserializable override record: {}", e),
        })?;

        // Write-then-rename so a reader never sees a torn record. The
        // temporary lives in the hidden `.cp.` namespace.
        let (parent, name) = Branches::parent_and_name(logical)?;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let tmp = self
            .branches
            .rw_path(parent)?
            .join(format!(".cp.me.{}.{}", name, nanos));
        std::fs::write(&tmp, &bytes).map_err(|e| Error::from_branch_io(e, logical))?;
        std::fs::rename(&tmp, &me).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::from_branch_io(e, logical)
        })?;
        debug!(path = %logical.display(), "override record updated");
        Ok(())
    }

    /// Delete the record for a logical path, if present.
    pub fn remove(&self, logical: &Path) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let me = self.branches.override_path(&logical)?;
        match std::fs::remove_file(&me) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_branch_io(e, &logical)),
        }
    }

    /// Override-aware attribute view of a logical path.
    pub fn get_attributes(&self, logical: &Path) -> Result<(Origin, FileAttributes)> {
        let resolution = self.resolver.resolve(logical)?;
        self.attributes_for(logical, &resolution)
    }

    /// Attribute view for an already resolved location.
    pub fn attributes_for(
        &self,
        logical: &Path,
        resolution: &Resolution,
    ) -> Result<(Origin, FileAttributes)> {
        match resolution.origin {
            Origin::Rw | Origin::Both => {
                let rw = resolution.rw_path.as_deref().ok_or_else(|| {
                    Error::Inconsistent {
                        path: logical.to_path_buf(),
                        detail: "writable origin without a writable path".to_string(),
                    }
                })?;
                let meta = rw
                    .symlink_metadata()
                    .map_err(|e| Error::from_branch_io(e, logical))?;
                Ok((resolution.origin, FileAttributes::from_metadata(&meta)))
            }
            Origin::Ro => {
                let ro = resolution.ro_path.as_deref().ok_or_else(|| {
                    Error::Inconsistent {
                        path: logical.to_path_buf(),
                        detail: "read-only origin without a read-only path".to_string(),
                    }
                })?;
                let meta = ro
                    .symlink_metadata()
                    .map_err(|e| Error::from_branch_io(e, logical))?;
                let mut attrs = FileAttributes::from_metadata(&meta);
                if let Some(record) = self.load(logical)? {
                    record.apply_to(&mut attrs);
                }
                Ok((Origin::Ro, attrs))
            }
            Origin::None => Err(Error::NotFound(logical.to_path_buf())),
        }
    }

    /// Apply a setattr delta.
    ///
    /// Writable origins take the change directly. Read-only origins do not
    /// copy up; the delta lands in the override record, pruned of fields
    /// that equal the read-only original.
    pub fn set_attributes(&self, logical: &Path, changes: &AttrChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let logical = Branches::normalize(logical)?;
        let resolution = self.resolver.resolve(&logical)?;

        match resolution.origin {
            Origin::Rw | Origin::Both => {
                let rw = resolution.rw_path.as_deref().ok_or_else(|| {
                    Error::Inconsistent {
                        path: logical.clone(),
                        detail: "writable origin without a writable path".to_string(),
                    }
                })?;
                apply_changes_direct(rw, changes, &logical)
            }
            Origin::Ro => {
                let ro = resolution.ro_path.as_deref().ok_or_else(|| {
                    Error::Inconsistent {
                        path: logical.clone(),
                        detail: "read-only origin without a read-only path".to_string(),
                    }
                })?;
                let meta = ro
                    .symlink_metadata()
                    .map_err(|e| Error::from_branch_io(e, &logical))?;
                let original = FileAttributes::from_metadata(&meta);

                // Load-merge-store is a read-modify-write of the record;
                // concurrent deltas for the same path must serialize.
                let guard = self.locks.lock(&logical);
                guard.run(|| {
                    let mut record = self.load(&logical)?.unwrap_or_default();
                    record.merge(changes);
                    record.prune_against(&original);
                    self.store(&logical, &record)
                })
            }
            Origin::None => Err(Error::NotFound(logical)),
        }
    }
}

/// Apply a delta straight to a writable-branch entry.
pub fn apply_changes_direct(
    concrete: &Path,
    changes: &AttrChanges,
    logical: &Path,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = changes.mode {
        std::fs::set_permissions(concrete, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| Error::from_branch_io(e, logical))?;
    }
    if changes.uid.is_some() || changes.gid.is_some() {
        nix::unistd::chown(
            concrete,
            changes.uid.map(nix::unistd::Uid::from_raw),
            changes.gid.map(nix::unistd::Gid::from_raw),
        )
        .map_err(|e| Error::from_branch_io(e.into(), logical))?;
    }
    if changes.atime.is_some() || changes.mtime.is_some() {
        set_file_times(
            concrete,
            changes.atime.map(TimeChange::resolve),
            changes.mtime.map(TimeChange::resolve),
            logical,
        )?;
    }
    Ok(())
}

/// Set atime/mtime, omitting whichever side is unchanged.
pub fn set_file_times(
    concrete: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
    logical: &Path,
) -> Result<()> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    fn spec(t: Option<SystemTime>) -> TimeSpec {
        match t {
            Some(t) => {
                let ts = Timestamp::from_system_time(t);
                TimeSpec::new(ts.secs, ts.nanos as i64)
            }
            None => TimeSpec::new(0, libc::UTIME_OMIT),
        }
    }

    utimensat(
        None,
        concrete,
        &spec(atime),
        &spec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|e| Error::from_branch_io(e.into(), logical))
}
