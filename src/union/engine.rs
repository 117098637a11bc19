//! Union engine
//!
//! Composes the resolver, whiteout manager, override manager, copy-up
//! engine, merge view and access gate into the logical operations the
//! dispatch layer calls. Every operation resolves first, routes by origin,
//! and applies the revival law: successfully creating a name clears any
//! whiteout that masked it.

use crate::error::{Error, Result};
use crate::union::access::{AccessGate, Caller};
use crate::union::attr::{AttrChanges, FileAttributes, FileKind};
use crate::union::branch::Branches;
use crate::union::copyup::CopyUpEngine;
use crate::union::dir::{MergeView, MergedEntry};
use crate::union::locks::PathLocks;
use crate::union::meta::OverrideManager;
use crate::union::resolve::{Origin, PathResolver, Resolution};
use crate::union::whiteout::WhiteoutManager;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The union of one read-write and one read-only branch
pub struct Union {
    branches: Arc<Branches>,
    resolver: PathResolver,
    whiteouts: WhiteoutManager,
    overrides: OverrideManager,
    copyup: CopyUpEngine,
    merge: MergeView,
    gate: AccessGate,
    locks: Arc<PathLocks>,
}

impl Union {
    pub fn new(rw_root: PathBuf, ro_root: PathBuf) -> Result<Self> {
        let branches = Arc::new(Branches::new(rw_root, ro_root)?);
        let locks = Arc::new(PathLocks::new());
        Ok(Self {
            resolver: PathResolver::new(branches.clone()),
            whiteouts: WhiteoutManager::new(branches.clone(), locks.clone()),
            overrides: OverrideManager::new(branches.clone(), locks.clone()),
            copyup: CopyUpEngine::new(branches.clone(), locks.clone()),
            merge: MergeView::new(branches.clone()),
            gate: AccessGate::new(branches.clone(), locks.clone()),
            branches,
            locks,
        })
    }

    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    /// Resolve a logical path to its origin and concrete location.
    pub fn resolve(&self, logical: &Path) -> Result<Resolution> {
        self.resolver.resolve(logical)
    }

    /// Override-aware attribute view.
    pub fn get_attributes(&self, logical: &Path) -> Result<(Origin, FileAttributes)> {
        self.overrides.get_attributes(logical)
    }

    /// Apply an attribute delta. Mode/ownership changes and explicit
    /// timestamps require the caller to own the entry; setting timestamps
    /// to the current time requires write access.
    pub fn set_attributes(
        &self,
        logical: &Path,
        caller: &Caller,
        changes: &AttrChanges,
    ) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let (_, attrs) = self.overrides.get_attributes(&logical)?;

        if changes.mode.is_some() || changes.uid.is_some() || changes.gid.is_some() {
            if caller.uid != 0 && caller.uid != attrs.uid {
                return Err(Error::PermissionDenied(logical));
            }
        } else if caller.uid != 0 && caller.uid != attrs.uid {
            if changes.has_explicit_times() {
                return Err(Error::PermissionDenied(logical));
            }
            self.gate
                .can_access(&logical, caller, libc::W_OK as u32)?;
        }

        debug!(path = %logical.display(), "setattr");
        self.overrides.set_attributes(&logical, changes)
    }

    /// Concrete path for a read-type operation.
    pub fn open_read(&self, logical: &Path, caller: &Caller) -> Result<PathBuf> {
        self.gate.can_access(logical, caller, libc::R_OK as u32)?;
        let resolution = self.resolver.resolve(logical)?;
        resolution
            .concrete()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NotFound(logical.to_path_buf()))
    }

    /// Concrete writable path for a write-type operation, copying up a
    /// read-only-origin entry first.
    pub fn prepare_write(&self, logical: &Path, caller: &Caller) -> Result<PathBuf> {
        self.gate.can_access(logical, caller, libc::W_OK as u32)?;
        self.copyup.copy_up(logical)
    }

    /// Create a regular file. The name must not exist; a whiteout-masked
    /// name is revived.
    pub fn create_file(&self, logical: &Path, caller: &Caller, mode: u32) -> Result<PathBuf> {
        let logical = self.prepare_create(logical, caller)?;
        let rw = self.resolver.find_path(&logical)?;

        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&rw)
            .map_err(|e| Error::from_branch_io(e, &logical))?;

        self.whiteouts.unlink_whiteout(&logical)?;
        debug!(path = %logical.display(), "file created");
        Ok(rw)
    }

    /// Create a directory. A same-named read-only directory is shadowed:
    /// its children get whiteouts so the new directory starts empty.
    pub fn mkdir(&self, logical: &Path, caller: &Caller, mode: u32) -> Result<()> {
        let logical = self.prepare_create(logical, caller)?;
        let rw = self.resolver.find_path(&logical)?;

        std::fs::create_dir(&rw).map_err(|e| Error::from_branch_io(e, &logical))?;
        std::fs::set_permissions(&rw, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| Error::from_branch_io(e, &logical))?;

        if let Err(e) = self.whiteouts.hide_directory_contents(&logical) {
            // Roll the new directory back rather than leak stale
            // read-only children through it.
            let _ = std::fs::remove_dir_all(&rw);
            return Err(e);
        }

        self.whiteouts.unlink_whiteout(&logical)?;
        debug!(path = %logical.display(), "directory created");
        Ok(())
    }

    /// Create a FIFO or device node.
    pub fn mknod(
        &self,
        logical: &Path,
        caller: &Caller,
        kind: FileKind,
        mode: u32,
        rdev: u64,
    ) -> Result<()> {
        let logical = self.prepare_create(logical, caller)?;
        let rw = self.resolver.find_path(&logical)?;
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777);

        match kind {
            FileKind::Fifo => nix::unistd::mkfifo(&rw, perm)
                .map_err(|e| Error::from_branch_io(e.into(), &logical))?,
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Socket => {
                let sflag = match kind {
                    FileKind::CharDevice => nix::sys::stat::SFlag::S_IFCHR,
                    FileKind::BlockDevice => nix::sys::stat::SFlag::S_IFBLK,
                    _ => nix::sys::stat::SFlag::S_IFSOCK,
                };
                nix::sys::stat::mknod(&rw, sflag, perm, rdev)
                    .map_err(|e| Error::from_branch_io(e.into(), &logical))?
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "mknod cannot create {:?}",
                    kind
                )))
            }
        }

        self.whiteouts.unlink_whiteout(&logical)?;
        debug!(path = %logical.display(), "node created");
        Ok(())
    }

    /// Create a symbolic link.
    pub fn symlink(&self, logical: &Path, caller: &Caller, target: &Path) -> Result<()> {
        let logical = self.prepare_create(logical, caller)?;
        let rw = self.resolver.find_path(&logical)?;

        std::os::unix::fs::symlink(target, &rw)
            .map_err(|e| Error::from_branch_io(e, &logical))?;

        self.whiteouts.unlink_whiteout(&logical)?;
        debug!(path = %logical.display(), "symlink created");
        Ok(())
    }

    /// Create a hard link. Read-only-origin sources fall back to a
    /// symbolic link onto the concrete read-only path.
    pub fn link(&self, source: &Path, dest: &Path, caller: &Caller) -> Result<()> {
        let dest = self.prepare_create(dest, caller)?;
        let rw = self.resolver.find_path(&dest)?;

        self.copyup.hard_link(source, &rw, &dest)?;

        self.whiteouts.unlink_whiteout(&dest)?;
        debug!(source = %source.display(), dest = %dest.display(), "link created");
        Ok(())
    }

    /// Remove a non-directory entry.
    pub fn unlink(&self, logical: &Path, caller: &Caller) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let resolution = self.resolver.resolve(&logical)?;
        self.gate.can_remove(&logical, caller)?;

        match resolution.origin {
            Origin::None => return Err(Error::NotFound(logical)),
            Origin::Both => {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EISDIR)))
            }
            Origin::Rw => {
                let rw = resolution.rw_path.ok_or_else(|| Error::Inconsistent {
                    path: logical.clone(),
                    detail: "writable origin without a writable path".to_string(),
                })?;
                let meta = rw
                    .symlink_metadata()
                    .map_err(|e| Error::from_branch_io(e, &logical))?;
                if meta.is_dir() {
                    return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EISDIR)));
                }
                self.whiteouts.unlink_rw_file(&logical, &rw, false)?;
            }
            Origin::Ro => {
                let ro = resolution.ro_path.ok_or_else(|| Error::Inconsistent {
                    path: logical.clone(),
                    detail: "read-only origin without a read-only path".to_string(),
                })?;
                let meta = ro
                    .symlink_metadata()
                    .map_err(|e| Error::from_branch_io(e, &logical))?;
                if meta.is_dir() {
                    return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EISDIR)));
                }
                // The read-only entry stays; the whiteout hides it.
                let guard = self.locks.lock(&logical);
                guard.run(|| {
                    self.whiteouts.create_whiteout(&logical)?;
                    self.overrides.remove(&logical)
                })?;
            }
        }

        debug!(path = %logical.display(), "unlinked");
        Ok(())
    }

    /// Remove a directory whose merged view is empty.
    pub fn rmdir(&self, logical: &Path, caller: &Caller) -> Result<()> {
        let logical = Branches::normalize(logical)?;
        let resolution = self.resolver.resolve(&logical)?;
        self.gate.can_remove(&logical, caller)?;

        let (_, attrs) = self.overrides.attributes_for(&logical, &resolution)?;
        if attrs.kind != FileKind::Directory {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOTDIR)));
        }
        if !self.whiteouts.is_empty_dir(&logical)? {
            return Err(Error::NotEmpty(logical));
        }

        let guard = self.locks.lock(&logical);
        guard.run(|| {
            match resolution.origin {
                Origin::None => Err(Error::NotFound(logical.clone())),
                Origin::Ro => {
                    self.whiteouts.create_whiteout(&logical)?;
                    self.overrides.remove(&logical)
                }
                Origin::Rw | Origin::Both => {
                    let rw = resolution.rw_path.clone().ok_or_else(|| {
                        Error::Inconsistent {
                            path: logical.clone(),
                            detail: "writable origin without a writable path".to_string(),
                        }
                    })?;
                    if resolution.origin == Origin::Both {
                        // Mask the read-only side before the writable one
                        // goes away, mirroring the unlink ordering.
                        self.whiteouts.create_whiteout(&logical)?;
                    }
                    // The merged view is empty; anything left inside the
                    // writable directory is marker state.
                    if let Err(e) = std::fs::remove_dir_all(&rw) {
                        if resolution.origin == Origin::Both {
                            let _ = self.whiteouts.unlink_whiteout(&logical);
                        }
                        return Err(Error::from_branch_io(e, &logical));
                    }
                    self.overrides.remove(&logical)
                }
            }
        })?;

        debug!(path = %logical.display(), "directory removed");
        Ok(())
    }

    /// Merged directory listing.
    pub fn read_dir(&self, logical: &Path, caller: &Caller) -> Result<Vec<MergedEntry>> {
        self.gate
            .can_access(logical, caller, (libc::R_OK | libc::X_OK) as u32)?;
        let resolution = self.resolver.resolve(logical)?;
        let (_, attrs) = self.overrides.attributes_for(logical, &resolution)?;
        if attrs.kind != FileKind::Directory {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOTDIR)));
        }
        self.merge.read_dir(logical)
    }

    /// Target of a symbolic link.
    pub fn read_link(&self, logical: &Path) -> Result<PathBuf> {
        let resolution = self.resolver.resolve(logical)?;
        let concrete = resolution
            .concrete()
            .ok_or_else(|| Error::NotFound(logical.to_path_buf()))?;
        std::fs::read_link(concrete).map_err(|e| Error::from_branch_io(e, logical))
    }

    /// Access check against the merged view.
    pub fn check_access(&self, logical: &Path, caller: &Caller, mask: u32) -> Result<()> {
        self.gate.can_access(logical, caller, mask)
    }

    /// Existence-and-gate preamble shared by the create-type operations.
    fn prepare_create(&self, logical: &Path, caller: &Caller) -> Result<PathBuf> {
        self.gate.can_create(logical, caller)?;
        let logical = Branches::normalize(logical)?;
        match self.resolver.resolve(&logical) {
            Ok(resolution) if resolution.exists() => Err(Error::AlreadyExists(logical)),
            // Masked name: creation revives it.
            Ok(_) => Ok(logical),
            Err(Error::NotFound(_)) => Ok(logical),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::union::attr::TimeChange;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Union) {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();
        let union = Union::new(rw.path().to_path_buf(), ro.path().to_path_buf()).unwrap();
        (rw, ro, union)
    }

    fn caller() -> Caller {
        Caller::current()
    }

    #[test]
    fn test_delete_ro_then_delete_again() {
        let (rw, ro, union) = setup();
        fs::write(ro.path().join("x"), b"ro").unwrap();

        union.unlink(Path::new("/x"), &caller()).unwrap();
        assert!(rw.path().join(".wh.x").exists());
        let res = union.resolve(Path::new("/x")).unwrap();
        assert_eq!(res.origin, Origin::None);

        let err = union.unlink(Path::new("/x"), &caller()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_create_revives_masked_name() {
        let (rw, ro, union) = setup();
        fs::write(ro.path().join("x"), b"ro").unwrap();
        union.unlink(Path::new("/x"), &caller()).unwrap();

        union.create_file(Path::new("/x"), &caller(), 0o644).unwrap();

        assert!(!rw.path().join(".wh.x").exists());
        let res = union.resolve(Path::new("/x")).unwrap();
        assert_eq!(res.origin, Origin::Rw);
    }

    #[test]
    fn test_create_existing_fails() {
        let (_rw, ro, union) = setup();
        fs::write(ro.path().join("x"), b"ro").unwrap();

        let err = union
            .create_file(Path::new("/x"), &caller(), 0o644)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_mkdir_shadows_ro_directory() {
        let (rw, ro, union) = setup();
        fs::create_dir(ro.path().join("d")).unwrap();
        fs::write(ro.path().join("d/stale"), b"").unwrap();
        union.unlink(Path::new("/d/stale"), &caller()).unwrap();
        fs::write(ro.path().join("d/other"), b"").unwrap();

        // Delete the directory view, then recreate the name.
        union.unlink(Path::new("/d/other"), &caller()).unwrap();
        union.rmdir(Path::new("/d"), &caller()).unwrap();
        union.mkdir(Path::new("/d"), &caller(), 0o755).unwrap();

        // The recreated directory must not leak read-only children.
        assert!(union.read_dir(Path::new("/d"), &caller()).unwrap().is_empty());
        assert!(rw.path().join("d/.wh.stale").exists());
        assert!(rw.path().join("d/.wh.other").exists());
    }

    #[test]
    fn test_rmdir_requires_empty_merged_view() {
        let (_rw, ro, union) = setup();
        fs::create_dir(ro.path().join("d")).unwrap();
        fs::write(ro.path().join("d/f"), b"").unwrap();

        let err = union.rmdir(Path::new("/d"), &caller()).unwrap_err();
        assert!(matches!(err, Error::NotEmpty(_)));

        union.unlink(Path::new("/d/f"), &caller()).unwrap();
        union.rmdir(Path::new("/d"), &caller()).unwrap();
        let res = union.resolve(Path::new("/d")).unwrap();
        assert_eq!(res.origin, Origin::None);
    }

    #[test]
    fn test_merge_listing_property() {
        let (rw, ro, union) = setup();
        fs::write(rw.path().join("a"), b"").unwrap();
        fs::write(rw.path().join(".wh.b"), b"").unwrap();
        fs::write(ro.path().join("b"), b"").unwrap();
        fs::write(ro.path().join("c"), b"").unwrap();

        let names: Vec<_> = union
            .read_dir(Path::new("/"), &caller())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_end_to_end_override_then_copy_up() {
        let (rw, ro, union) = setup();
        fs::create_dir(ro.path().join("docs")).unwrap();
        fs::write(ro.path().join("docs/readme.txt"), b"v1").unwrap();
        fs::set_permissions(
            ro.path().join("docs/readme.txt"),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let logical = Path::new("/docs/readme.txt");
        let res = union.resolve(logical).unwrap();
        assert_eq!(res.origin, Origin::Ro);

        union
            .set_attributes(
                logical,
                &caller(),
                &AttrChanges {
                    mode: Some(0o600),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(rw.path().join("docs/.me.readme.txt").exists());

        let (origin, attrs) = union.get_attributes(logical).unwrap();
        assert_eq!(origin, Origin::Ro);
        assert_eq!(attrs.mode, 0o600);

        // A content write forces copy-up carrying the merged view.
        let writable = union.prepare_write(logical, &caller()).unwrap();
        fs::write(&writable, b"v2").unwrap();

        assert_eq!(writable, rw.path().join("docs/readme.txt"));
        assert_eq!(
            writable.metadata().unwrap().permissions().mode() & 0o7777,
            0o600
        );
        assert_eq!(fs::read(&writable).unwrap(), b"v2");
        assert!(!rw.path().join("docs/.me.readme.txt").exists());
        assert_eq!(fs::read(ro.path().join("docs/readme.txt")).unwrap(), b"v1");
    }

    #[test]
    fn test_symlink_and_read_link() {
        let (_rw, _ro, union) = setup();
        union
            .symlink(Path::new("/l"), &caller(), Path::new("/target"))
            .unwrap();
        assert_eq!(
            union.read_link(Path::new("/l")).unwrap(),
            PathBuf::from("/target")
        );
    }

    #[test]
    fn test_link_to_ro_weakens_to_symlink() {
        let (rw, ro, union) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        union
            .link(Path::new("/f"), Path::new("/l"), &caller())
            .unwrap();

        assert!(rw
            .path()
            .join("l")
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_reserved_creation_rejected_end_to_end() {
        let (_rw, _ro, union) = setup();
        let err = union
            .create_file(Path::new("/.wh.sneaky"), &caller(), 0o644)
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_unlink_ro_directory_is_eisdir() {
        let (rw, ro, union) = setup();
        fs::create_dir(ro.path().join("d")).unwrap();
        fs::write(ro.path().join("d/f"), b"").unwrap();

        let err = union.unlink(Path::new("/d"), &caller()).unwrap_err();
        assert_eq!(err.errno(), libc::EISDIR);

        // No whiteout was left behind; the directory is still visible.
        assert!(!rw.path().join(".wh.d").exists());
        let res = union.resolve(Path::new("/d")).unwrap();
        assert_eq!(res.origin, Origin::Ro);
    }

    #[test]
    fn test_explicit_times_require_ownership() {
        let (rw, _ro, union) = setup();
        fs::write(rw.path().join("f"), b"x").unwrap();
        fs::set_permissions(rw.path().join("f"), fs::Permissions::from_mode(0o666)).unwrap();

        let other = Caller {
            uid: 65533,
            gid: 65533,
        };
        let then =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);

        // Write access alone does not allow an explicit timestamp.
        let err = union
            .set_attributes(
                Path::new("/f"),
                &other,
                &AttrChanges {
                    mtime: Some(TimeChange::Set(then)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // Set-to-now is fine for any writer.
        union
            .set_attributes(
                Path::new("/f"),
                &other,
                &AttrChanges {
                    mtime: Some(TimeChange::Now),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_unlink_rw_with_ro_counterpart_masks() {
        let (rw, ro, union) = setup();
        fs::write(ro.path().join("f"), b"old").unwrap();
        let writable = union.prepare_write(Path::new("/f"), &caller()).unwrap();
        fs::write(&writable, b"new").unwrap();

        union.unlink(Path::new("/f"), &caller()).unwrap();

        assert!(!rw.path().join("f").exists());
        assert!(rw.path().join(".wh.f").exists());
        let res = union.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::None);
    }
}
