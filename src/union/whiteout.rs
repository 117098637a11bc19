//! Whiteout tombstones
//!
//! A whiteout is a zero-length, minimally-permissioned marker named
//! `.wh.<name>` on the writable branch, hiding the same-named read-only
//! entry. Creating one "deletes" read-only content without touching it;
//! removing one revives the name.
//!
//! Deleting a writable file that shadows a read-only entry is a two-step
//! sequence that no single branch primitive makes atomic. The marker is
//! created first and rolled back if the unlink fails, so an interruption
//! can never make a deleted read-only entry reappear; at worst a masked
//! writable entry survives until the deletion is retried.

use crate::error::{Error, Result};
use crate::union::branch::{Branches, WHITEOUT_PREFIX};
use crate::union::dir::MergeView;
use crate::union::elevate::ElevatedScope;
use crate::union::locks::PathLocks;
use crate::union::resolve::PathResolver;
use nix::unistd::{chown, Gid, Uid};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mode of whiteout markers: readable by the owner only.
const WHITEOUT_MODE: u32 = 0o400;

/// Creates, queries and removes whiteout markers
pub struct WhiteoutManager {
    branches: Arc<Branches>,
    resolver: PathResolver,
    merge: MergeView,
    locks: Arc<PathLocks>,
}

impl WhiteoutManager {
    pub fn new(branches: Arc<Branches>, locks: Arc<PathLocks>) -> Self {
        Self {
            resolver: PathResolver::new(branches.clone()),
            merge: MergeView::new(branches.clone()),
            branches,
            locks,
        }
    }

    /// Create the whiteout masking a logical path.
    ///
    /// Idempotent; an existing marker is success. The marker is created
    /// under superuser credentials so masking succeeds even when the
    /// caller cannot write the entry being hidden.
    pub fn create_whiteout(&self, logical: &Path) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        self.resolver.find_path(&logical)?;
        let wh = self.branches.whiteout_path(&logical)?;

        let scope = ElevatedScope::acquire();
        let created = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(WHITEOUT_MODE)
            .open(&wh);
        match created {
            Ok(_) => {
                if scope.is_root() {
                    if let Err(e) = chown(&wh, Some(Uid::from_raw(0)), Some(Gid::from_raw(0))) {
                        warn!(marker = %wh.display(), "failed to chown whiteout to root: {}", e);
                    }
                }
                debug!(path = %logical.display(), "whiteout created");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::from_branch_io(e, &logical)),
        }
    }

    /// Pure existence check, no side effects.
    pub fn find_whiteout(&self, logical: &Path) -> Result<bool> {
        let logical = Branches::normalize(logical)?;
        self.resolver.whiteout_exists(&logical)
    }

    /// Remove the marker masking a logical path, if present.
    ///
    /// Every successful create-type operation calls this: creating a name
    /// always revives it.
    pub fn unlink_whiteout(&self, logical: &Path) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let wh = self.branches.whiteout_path(&logical)?;
        match std::fs::remove_file(&wh) {
            Ok(()) => {
                debug!(path = %logical.display(), "whiteout removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_branch_io(e, &logical)),
        }
    }

    /// Remove a writable-branch file, masking any read-only counterpart.
    ///
    /// Runs under the logical path's lock. The marker goes down first;
    /// if the unlink then fails the marker is rolled back.
    pub fn unlink_rw_file(
        &self,
        logical: &Path,
        rw_path: &Path,
        assume_has_ro: bool,
    ) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let guard = self.locks.lock(&logical);
        guard.run(|| {
            let has_ro = assume_has_ro || {
                let ro = self.branches.ro_path(&logical)?;
                ro.symlink_metadata().is_ok()
            };

            if has_ro {
                self.create_whiteout(&logical)?;
            }

            match std::fs::remove_file(rw_path) {
                Ok(()) => Ok(()),
                Err(e) => {
                    if has_ro {
                        if let Err(rollback) = self.unlink_whiteout(&logical) {
                            warn!(
                                path = %logical.display(),
                                "failed to roll back whiteout after unlink failure: {}",
                                rollback
                            );
                        }
                    }
                    Err(Error::from_branch_io(e, &logical))
                }
            }
        })
    }

    /// Populate a freshly created writable directory with whiteouts for
    /// every child of the same-named read-only directory, so the merged
    /// listing of the new directory starts empty.
    pub fn hide_directory_contents(&self, logical: &Path) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let ro_dir = self.branches.ro_path(&logical)?;
        let rw_dir = self.branches.rw_path(&logical)?;

        let iter = match std::fs::read_dir(&ro_dir) {
            Ok(iter) => iter,
            // No read-only counterpart, nothing to hide.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::from_branch_io(e, &logical)),
        };

        let scope = ElevatedScope::acquire();
        for entry in iter {
            let entry = entry.map_err(|e| Error::from_branch_io(e, &logical))?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let wh = rw_dir.join(format!("{}{}", WHITEOUT_PREFIX, name));
            if wh.as_os_str().len() > libc::PATH_MAX as usize {
                return Err(Error::NameTooLong(logical.join(name)));
            }
            let created = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(WHITEOUT_MODE)
                .open(&wh);
            match created {
                Ok(_) => {
                    if scope.is_root() {
                        if let Err(e) = chown(&wh, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
                        {
                            warn!(marker = %wh.display(), "failed to chown whiteout: {}", e);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::from_branch_io(e, &logical)),
            }
        }
        debug!(path = %logical.display(), "read-only contents hidden");
        Ok(())
    }

    /// Whether the merged view of a directory has zero visible entries.
    pub fn is_empty_dir(&self, logical: &Path) -> Result<bool> {
        self.merge.is_empty(logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::union::resolve::Origin;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (
        tempfile::TempDir,
        tempfile::TempDir,
        WhiteoutManager,
        PathResolver,
    ) {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();
        let branches =
            Arc::new(Branches::new(rw.path().to_path_buf(), ro.path().to_path_buf()).unwrap());
        let manager = WhiteoutManager::new(branches.clone(), Arc::new(PathLocks::new()));
        let resolver = PathResolver::new(branches);
        (rw, ro, manager, resolver)
    }

    #[test]
    fn test_whiteout_masks_and_is_idempotent() {
        let (rw, ro, manager, resolver) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        manager.create_whiteout(Path::new("/f")).unwrap();
        manager.create_whiteout(Path::new("/f")).unwrap();

        assert!(manager.find_whiteout(Path::new("/f")).unwrap());
        let res = resolver.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::None);

        // Exactly one marker, zero bytes.
        let marker = rw.path().join(".wh.f");
        assert_eq!(marker.metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_whiteout_in_nested_ro_directory() {
        let (rw, ro, manager, _) = setup();
        fs::create_dir_all(ro.path().join("a/b")).unwrap();
        fs::write(ro.path().join("a/b/f"), b"ro").unwrap();

        manager.create_whiteout(Path::new("/a/b/f")).unwrap();

        // Parent chain was materialized on the writable branch.
        assert!(rw.path().join("a/b/.wh.f").exists());
    }

    #[test]
    fn test_unlink_whiteout_revives() {
        let (_rw, ro, manager, resolver) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        manager.create_whiteout(Path::new("/f")).unwrap();
        manager.unlink_whiteout(Path::new("/f")).unwrap();
        // Absent marker is fine too.
        manager.unlink_whiteout(Path::new("/f")).unwrap();

        let res = resolver.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::Ro);
    }

    #[test]
    fn test_unlink_rw_file_masks_ro_counterpart() {
        let (rw, ro, manager, resolver) = setup();
        fs::write(rw.path().join("f"), b"rw").unwrap();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        manager
            .unlink_rw_file(Path::new("/f"), &rw.path().join("f"), false)
            .unwrap();

        assert!(!rw.path().join("f").exists());
        let res = resolver.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::None);
    }

    #[test]
    fn test_unlink_rw_file_without_ro_leaves_no_marker() {
        let (rw, _ro, manager, _) = setup();
        fs::write(rw.path().join("f"), b"rw").unwrap();

        manager
            .unlink_rw_file(Path::new("/f"), &rw.path().join("f"), false)
            .unwrap();

        assert!(!rw.path().join(".wh.f").exists());
    }

    #[test]
    fn test_unlink_rw_file_rolls_back_marker_on_failure() {
        let (rw, ro, manager, _) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();
        // The writable entry is already gone: unlink will fail.
        manager
            .unlink_rw_file(Path::new("/f"), &rw.path().join("f"), false)
            .unwrap_err();

        assert!(!rw.path().join(".wh.f").exists());
    }

    #[test]
    fn test_hide_directory_contents() {
        let (rw, ro, manager, _) = setup();
        fs::create_dir(ro.path().join("d")).unwrap();
        fs::write(ro.path().join("d/x"), b"").unwrap();
        fs::write(ro.path().join("d/y"), b"").unwrap();
        fs::create_dir(rw.path().join("d")).unwrap();

        manager.hide_directory_contents(Path::new("/d")).unwrap();

        assert!(rw.path().join("d/.wh.x").exists());
        assert!(rw.path().join("d/.wh.y").exists());
        assert!(manager.is_empty_dir(Path::new("/d")).unwrap());
    }

    #[test]
    fn test_is_empty_dir() {
        let (rw, ro, manager, _) = setup();
        fs::create_dir(rw.path().join("d")).unwrap();
        assert!(manager.is_empty_dir(Path::new("/d")).unwrap());

        fs::create_dir(ro.path().join("d")).unwrap();
        fs::write(ro.path().join("d/f"), b"").unwrap();
        assert!(!manager.is_empty_dir(Path::new("/d")).unwrap());
    }
}
