//! Lazy copy-up of read-only entries
//!
//! A content or structural mutation aimed at a read-only-origin entry first
//! duplicates it into the writable branch. The copy is written to a hidden
//! `.cp.` temporary and renamed into place, so no partially written file is
//! ever observable; on any failure the read-only original is untouched and
//! the temporary is removed. The sequence runs under the logical path's
//! lock: a concurrent loser re-resolves and returns the winner's copy.

use crate::error::{Error, Result};
use crate::union::attr::{FileAttributes, FileKind};
use crate::union::branch::{Branches, COPYUP_PREFIX};
use crate::union::elevate::ElevatedScope;
use crate::union::locks::PathLocks;
use crate::union::meta::{set_file_times, OverrideManager};
use crate::union::resolve::{Origin, PathResolver};
use crate::union::whiteout::WhiteoutManager;
use nix::unistd::{chown, Gid, Uid};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Duplicates read-only entries into the writable branch on demand
pub struct CopyUpEngine {
    branches: Arc<Branches>,
    resolver: PathResolver,
    overrides: OverrideManager,
    whiteouts: WhiteoutManager,
    locks: Arc<PathLocks>,
}

impl CopyUpEngine {
    pub fn new(branches: Arc<Branches>, locks: Arc<PathLocks>) -> Self {
        Self {
            resolver: PathResolver::new(branches.clone()),
            overrides: OverrideManager::new(branches.clone(), locks.clone()),
            whiteouts: WhiteoutManager::new(branches.clone(), locks.clone()),
            branches,
            locks,
        }
    }

    /// Ensure the logical path has a writable copy, returning its concrete
    /// writable path. A path already writable is returned as-is.
    pub fn copy_up(&self, logical: &Path) -> Result<PathBuf> {
        let logical = Branches::normalize(logical)?;
        let guard = self.locks.lock(&logical);
        guard.run(|| self.copy_up_locked(&logical))
    }

    fn copy_up_locked(&self, logical: &Path) -> Result<PathBuf> {
        // Re-resolve under the lock: a concurrent copy-up may have won.
        let resolution = self.resolver.resolve(logical)?;
        let ro = match resolution.origin {
            Origin::Rw | Origin::Both => {
                return resolution.rw_path.clone().ok_or_else(|| Error::Inconsistent {
                    path: logical.to_path_buf(),
                    detail: "writable origin without a writable path".to_string(),
                })
            }
            Origin::None => return Err(Error::NotFound(logical.to_path_buf())),
            Origin::Ro => resolution.ro_path.clone().ok_or_else(|| Error::Inconsistent {
                path: logical.to_path_buf(),
                detail: "read-only origin without a read-only path".to_string(),
            })?,
        };

        let rw = self.resolver.find_path(logical)?;

        // The merged, override-aware view is what the copy must expose.
        let (_, attrs) = self.overrides.attributes_for(logical, &resolution)?;

        match attrs.kind {
            FileKind::RegularFile => self.copy_up_file(logical, &ro, &rw, &attrs)?,
            FileKind::Directory => {
                std::fs::create_dir(&rw).map_err(|e| Error::from_branch_io(e, logical))?;
                apply_attrs(&rw, &attrs, logical);
            }
            FileKind::Symlink => {
                let target =
                    std::fs::read_link(&ro).map_err(|e| Error::from_branch_io(e, logical))?;
                let tmp = self.temp_path(logical)?;
                std::os::unix::fs::symlink(&target, &tmp)
                    .map_err(|e| Error::from_branch_io(e, logical))?;
                if let Err(e) = std::fs::rename(&tmp, &rw) {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(Error::from_branch_io(e, logical));
                }
            }
            FileKind::Fifo => {
                nix::unistd::mkfifo(&rw, nix::sys::stat::Mode::from_bits_truncate(attrs.mode))
                    .map_err(|e| Error::from_branch_io(e.into(), logical))?;
                apply_attrs(&rw, &attrs, logical);
            }
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Socket => {
                let kind = match attrs.kind {
                    FileKind::CharDevice => nix::sys::stat::SFlag::S_IFCHR,
                    FileKind::BlockDevice => nix::sys::stat::SFlag::S_IFBLK,
                    _ => nix::sys::stat::SFlag::S_IFSOCK,
                };
                let _scope = ElevatedScope::acquire();
                nix::sys::stat::mknod(
                    &rw,
                    kind,
                    nix::sys::stat::Mode::from_bits_truncate(attrs.mode),
                    attrs.rdev,
                )
                .map_err(|e| Error::from_branch_io(e.into(), logical))?;
                apply_attrs(&rw, &attrs, logical);
            }
        }

        // The deltas are folded into the real copy now.
        self.overrides.remove(logical)?;
        // A stale whiteout would re-mask the fresh copy.
        self.whiteouts.unlink_whiteout(logical)?;

        debug!(path = %logical.display(), "copied up");
        Ok(rw)
    }

    fn copy_up_file(
        &self,
        logical: &Path,
        ro: &Path,
        rw: &Path,
        attrs: &FileAttributes,
    ) -> Result<()> {
        let tmp = self.temp_path(logical)?;
        let result = (|| -> Result<()> {
            let mut src =
                std::fs::File::open(ro).map_err(|e| Error::from_branch_io(e, logical))?;
            let mut dst = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(|e| Error::from_branch_io(e, logical))?;
            std::io::copy(&mut src, &mut dst)
                .map_err(|e| Error::from_branch_io(e, logical))?;
            dst.sync_all()
                .map_err(|e| Error::from_branch_io(e, logical))?;
            drop(dst);

            apply_attrs(&tmp, attrs, logical);
            std::fs::rename(&tmp, rw).map_err(|e| Error::from_branch_io(e, logical))
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// Unique hidden temporary next to the copy-up target.
    fn temp_path(&self, logical: &Path) -> Result<PathBuf> {
        let (parent, name) = Branches::parent_and_name(logical)?;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .branches
            .rw_path(parent)?
            .join(format!("{}{}.{}{}", COPYUP_PREFIX, name, nanos, seq));
        if tmp.as_os_str().len() > libc::PATH_MAX as usize {
            return Err(Error::NameTooLong(logical.to_path_buf()));
        }
        Ok(tmp)
    }

    /// Hard-link a logical source to a writable destination path.
    ///
    /// A read-only-origin source cannot share storage identity with a
    /// writable entry, so the destination falls back to a symbolic link at
    /// the concrete read-only path. The two names then do not track future
    /// read-only-side divergence identically; this is the documented
    /// weakening, not a defect.
    pub fn hard_link(&self, source: &Path, dest_rw: &Path, dest_logical: &Path) -> Result<()> {
        let source = Branches::normalize(source)?;
        let resolution = self.resolver.resolve(&source)?;
        match resolution.origin {
            Origin::Rw | Origin::Both => {
                let rw_from = resolution.rw_path.ok_or_else(|| Error::Inconsistent {
                    path: source.clone(),
                    detail: "writable origin without a writable path".to_string(),
                })?;
                std::fs::hard_link(&rw_from, dest_rw)
                    .map_err(|e| Error::from_branch_io(e, dest_logical))
            }
            Origin::Ro => {
                let ro_from = resolution.ro_path.ok_or_else(|| Error::Inconsistent {
                    path: source.clone(),
                    detail: "read-only origin without a read-only path".to_string(),
                })?;
                warn!(
                    source = %source.display(),
                    dest = %dest_logical.display(),
                    "hard link to read-only entry: falling back to symlink"
                );
                std::os::unix::fs::symlink(&ro_from, dest_rw)
                    .map_err(|e| Error::from_branch_io(e, dest_logical))
            }
            Origin::None => Err(Error::NotFound(source)),
        }
    }
}

/// Best-effort duplication of mode, ownership and timestamps.
///
/// Mode and timestamps always apply; ownership needs root and is skipped
/// (with a warning) on unprivileged mounts.
fn apply_attrs(concrete: &Path, attrs: &FileAttributes, logical: &Path) {
    if attrs.kind != FileKind::Symlink {
        if let Err(e) = std::fs::set_permissions(
            concrete,
            std::fs::Permissions::from_mode(attrs.mode & 0o7777),
        ) {
            warn!(path = %logical.display(), "copy-up: failed to set mode: {}", e);
        }
    }

    let scope = ElevatedScope::acquire();
    if scope.is_root() {
        if let Err(e) = chown(
            concrete,
            Some(Uid::from_raw(attrs.uid)),
            Some(Gid::from_raw(attrs.gid)),
        ) {
            warn!(path = %logical.display(), "copy-up: failed to set ownership: {}", e);
        }
    }
    drop(scope);

    if let Err(e) = set_file_times(concrete, Some(attrs.atime), Some(attrs.mtime), logical) {
        warn!(path = %logical.display(), "copy-up: failed to set times: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::union::attr::AttrChanges;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (
        tempfile::TempDir,
        tempfile::TempDir,
        CopyUpEngine,
        OverrideManager,
    ) {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();
        let branches =
            Arc::new(Branches::new(rw.path().to_path_buf(), ro.path().to_path_buf()).unwrap());
        let locks = Arc::new(PathLocks::new());
        let engine = CopyUpEngine::new(branches.clone(), locks.clone());
        let overrides = OverrideManager::new(branches, locks);
        (rw, ro, engine, overrides)
    }

    #[test]
    fn test_copy_up_duplicates_content_and_mode() {
        let (rw, ro, engine, _) = setup();
        fs::write(ro.path().join("f"), b"content").unwrap();
        fs::set_permissions(ro.path().join("f"), fs::Permissions::from_mode(0o640)).unwrap();

        let copied = engine.copy_up(Path::new("/f")).unwrap();
        assert_eq!(copied, rw.path().join("f"));
        assert_eq!(fs::read(&copied).unwrap(), b"content");
        assert_eq!(copied.metadata().unwrap().permissions().mode() & 0o7777, 0o640);

        // Original untouched.
        assert_eq!(fs::read(ro.path().join("f")).unwrap(), b"content");
    }

    #[test]
    fn test_copy_up_in_nested_directory() {
        let (rw, ro, engine, _) = setup();
        fs::create_dir_all(ro.path().join("a/b")).unwrap();
        fs::write(ro.path().join("a/b/f"), b"deep").unwrap();

        engine.copy_up(Path::new("/a/b/f")).unwrap();
        assert_eq!(fs::read(rw.path().join("a/b/f")).unwrap(), b"deep");
    }

    #[test]
    fn test_copy_up_folds_override_record() {
        let (rw, ro, engine, overrides) = setup();
        fs::write(ro.path().join("f"), b"content").unwrap();
        fs::set_permissions(ro.path().join("f"), fs::Permissions::from_mode(0o644)).unwrap();

        overrides
            .set_attributes(
                Path::new("/f"),
                &AttrChanges {
                    mode: Some(0o600),
                    ..Default::default()
                },
            )
            .unwrap();

        let copied = engine.copy_up(Path::new("/f")).unwrap();

        // Copy carries the override-merged view; the record is gone.
        assert_eq!(copied.metadata().unwrap().permissions().mode() & 0o7777, 0o600);
        assert!(!rw.path().join(".me.f").exists());
    }

    #[test]
    fn test_copy_up_of_rw_entry_is_identity() {
        let (rw, _ro, engine, _) = setup();
        fs::write(rw.path().join("f"), b"rw").unwrap();

        let path = engine.copy_up(Path::new("/f")).unwrap();
        assert_eq!(path, rw.path().join("f"));
        assert_eq!(fs::read(&path).unwrap(), b"rw");
    }

    #[test]
    fn test_copy_up_symlink() {
        let (rw, ro, engine, _) = setup();
        std::os::unix::fs::symlink("target", ro.path().join("l")).unwrap();

        engine.copy_up(Path::new("/l")).unwrap();
        assert_eq!(
            fs::read_link(rw.path().join("l")).unwrap(),
            PathBuf::from("target")
        );
    }

    #[test]
    fn test_copy_up_masked_path_is_not_found() {
        let (rw, ro, engine, _) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();
        fs::write(rw.path().join(".wh.f"), b"").unwrap();

        let err = engine.copy_up(Path::new("/f")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_concurrent_copy_up_converges() {
        let (rw, ro, engine, _) = setup();
        fs::write(ro.path().join("f"), vec![7u8; 64 * 1024]).unwrap();
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || engine.copy_up(Path::new("/f")).unwrap())
            })
            .collect();
        let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one writable copy with the right content, all callers
        // observing it, and zero leaked temporaries.
        assert!(paths.iter().all(|p| p == &rw.path().join("f")));
        assert_eq!(fs::read(rw.path().join("f")).unwrap(), vec![7u8; 64 * 1024]);
        let leftovers: Vec<_> = fs::read_dir(rw.path())
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|n| n.starts_with(".cp."))
            .collect();
        assert!(leftovers.is_empty(), "leaked temporaries: {:?}", leftovers);
    }

    #[test]
    fn test_hard_link_ro_falls_back_to_symlink() {
        let (rw, ro, engine, _) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        engine
            .hard_link(Path::new("/f"), &rw.path().join("l"), Path::new("/l"))
            .unwrap();

        let meta = rw.path().join("l").symlink_metadata().unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(rw.path().join("l")).unwrap(), ro.path().join("f"));
    }

    #[test]
    fn test_hard_link_rw_is_real_link() {
        let (rw, _ro, engine, _) = setup();
        fs::write(rw.path().join("f"), b"rw").unwrap();

        engine
            .hard_link(Path::new("/f"), &rw.path().join("l"), Path::new("/l"))
            .unwrap();

        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            rw.path().join("f").metadata().unwrap().ino(),
            rw.path().join("l").metadata().unwrap().ino()
        );
    }
}
