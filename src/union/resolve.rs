//! Logical path resolution
//!
//! Maps a logical path to its authoritative origin and concrete branch
//! location. Precedence: a real entry on the writable branch always wins;
//! a whiteout marker hides any read-only entry of the same name; otherwise
//! the read-only branch is authoritative. Directories present on both
//! branches resolve to [`Origin::Both`] and require merging.

use crate::error::{Error, Result};
use crate::union::branch::{is_reserved_name, Branches};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Which branch holds authoritative data for a logical path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Writable branch holds the entry
    Rw,
    /// Read-only branch holds the entry
    Ro,
    /// Directory present on both branches; listings must merge
    Both,
    /// A whiteout masks the name; the logical path does not exist
    None,
}

/// Resolved location of a logical path
#[derive(Debug, Clone)]
pub struct Resolution {
    pub origin: Origin,
    pub rw_path: Option<PathBuf>,
    pub ro_path: Option<PathBuf>,
}

impl Resolution {
    /// The concrete path a pass-through operation should target,
    /// writable branch preferred.
    pub fn concrete(&self) -> Option<&Path> {
        self.rw_path
            .as_deref()
            .or(self.ro_path.as_deref())
    }

    pub fn exists(&self) -> bool {
        self.origin != Origin::None
    }
}

/// Resolves logical paths against the two branches
pub struct PathResolver {
    branches: Arc<Branches>,
}

impl PathResolver {
    pub fn new(branches: Arc<Branches>) -> Self {
        Self { branches }
    }

    /// Resolve a logical path to its origin and concrete location(s).
    ///
    /// Returns `NotFound` when neither branch holds the entry and no
    /// whiteout masks it; a masked name resolves to [`Origin::None`].
    pub fn resolve(&self, logical: &Path) -> Result<Resolution> {
        // Marker names never exist in the logical namespace; to a caller
        // looking one up they are simply absent, not malformed.
        if has_reserved_component(logical) {
            return Err(Error::NotFound(logical.to_path_buf()));
        }
        let logical = Branches::normalize(logical)?;

        // The union root is the merge of both branch roots.
        if logical == Path::new("/") {
            return Ok(Resolution {
                origin: Origin::Both,
                rw_path: Some(self.branches.rw_root().to_path_buf()),
                ro_path: Some(self.branches.ro_root().to_path_buf()),
            });
        }

        let rw = self.branches.rw_path(&logical)?;
        let ro = self.branches.ro_path(&logical)?;
        let rw_meta = probe(&rw, &logical)?;
        let masked = self.whiteout_exists(&logical)?;

        if let Some(rw_meta) = rw_meta {
            // Two same-named directories merge, unless the read-only side
            // is still masked (mid-mkdir shadowing state).
            if rw_meta.is_dir() && !masked {
                if let Some(ro_meta) = probe(&ro, &logical)? {
                    if ro_meta.is_dir() {
                        trace!(path = %logical.display(), "resolved: both");
                        return Ok(Resolution {
                            origin: Origin::Both,
                            rw_path: Some(rw),
                            ro_path: Some(ro),
                        });
                    }
                }
            }
            trace!(path = %logical.display(), "resolved: rw");
            return Ok(Resolution {
                origin: Origin::Rw,
                rw_path: Some(rw),
                ro_path: None,
            });
        }

        if masked {
            trace!(path = %logical.display(), "resolved: whiteout");
            return Ok(Resolution {
                origin: Origin::None,
                rw_path: None,
                ro_path: None,
            });
        }

        if probe(&ro, &logical)?.is_some() {
            trace!(path = %logical.display(), "resolved: ro");
            return Ok(Resolution {
                origin: Origin::Ro,
                rw_path: None,
                ro_path: Some(ro),
            });
        }

        Err(Error::NotFound(logical))
    }

    /// Ensure every ancestor directory of `logical` exists on the writable
    /// branch, mirroring the merged structure (mkdir-all semantics).
    /// Idempotent. Returns the concrete writable path of `logical` itself,
    /// which is not created.
    pub fn find_path(&self, logical: &Path) -> Result<PathBuf> {
        let logical = Branches::normalize(logical)?;
        let (parent, _) = Branches::parent_and_name(&logical)?;

        let mut ancestor = PathBuf::from("/");
        for component in parent.components().skip(1) {
            ancestor.push(component);
            let rw = self.branches.rw_path(&ancestor)?;
            match probe(&rw, &ancestor)? {
                Some(meta) if meta.is_dir() => continue,
                Some(_) => {
                    // A non-directory occupies the ancestor slot.
                    return Err(Error::Io(std::io::Error::from_raw_os_error(
                        libc::ENOTDIR,
                    )));
                }
                None => {
                    std::fs::create_dir(&rw)
                        .map_err(|e| Error::from_branch_io(e, &ancestor))?;
                    // Mirror the read-only directory's mode when it exists.
                    let ro = self.branches.ro_path(&ancestor)?;
                    if let Some(ro_meta) = probe(&ro, &ancestor)? {
                        if ro_meta.is_dir() {
                            std::fs::set_permissions(&rw, ro_meta.permissions())
                                .map_err(|e| Error::from_branch_io(e, &ancestor))?;
                        }
                    }
                }
            }
        }

        self.branches.rw_path(&logical)
    }

    /// Pure whiteout existence check, shared with the merge view.
    pub fn whiteout_exists(&self, logical: &Path) -> Result<bool> {
        if logical == Path::new("/") {
            return Ok(false);
        }
        let wh = self.branches.whiteout_path(logical)?;
        Ok(wh.symlink_metadata().is_ok())
    }
}

fn has_reserved_component(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => name.to_str().map_or(false, is_reserved_name),
        _ => false,
    })
}

/// lstat that treats only NotFound as absence.
fn probe(concrete: &Path, logical: &Path) -> Result<Option<std::fs::Metadata>> {
    match concrete.symlink_metadata() {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::from_branch_io(e, logical)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, PathResolver) {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();
        let branches =
            Arc::new(Branches::new(rw.path().to_path_buf(), ro.path().to_path_buf()).unwrap());
        let resolver = PathResolver::new(branches);
        (rw, ro, resolver)
    }

    #[test]
    fn test_rw_wins() {
        let (rw, ro, resolver) = setup();
        fs::write(rw.path().join("f"), b"rw").unwrap();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        let res = resolver.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::Rw);
        assert_eq!(fs::read(res.concrete().unwrap()).unwrap(), b"rw");
    }

    #[test]
    fn test_ro_fallback() {
        let (_rw, ro, resolver) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();

        let res = resolver.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::Ro);
    }

    #[test]
    fn test_whiteout_masks_ro() {
        let (rw, ro, resolver) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();
        fs::write(rw.path().join(".wh.f"), b"").unwrap();

        let res = resolver.resolve(Path::new("/f")).unwrap();
        assert_eq!(res.origin, Origin::None);
        assert!(!res.exists());
    }

    #[test]
    fn test_both_directories() {
        let (rw, ro, resolver) = setup();
        fs::create_dir(rw.path().join("d")).unwrap();
        fs::create_dir(ro.path().join("d")).unwrap();

        let res = resolver.resolve(Path::new("/d")).unwrap();
        assert_eq!(res.origin, Origin::Both);
        assert!(res.rw_path.is_some() && res.ro_path.is_some());
    }

    #[test]
    fn test_reserved_names_resolve_as_absent() {
        let (rw, ro, resolver) = setup();
        fs::write(ro.path().join("f"), b"ro").unwrap();
        fs::write(rw.path().join(".wh.f"), b"").unwrap();

        // The marker itself is never part of the namespace, even though a
        // file by that name exists on the writable branch.
        for name in ["/.wh.f", "/.me.f", "/.cp.f.1"] {
            let err = resolver.resolve(Path::new(name)).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)), "{}", name);
        }
    }

    #[test]
    fn test_absent_is_not_found() {
        let (_rw, _ro, resolver) = setup();
        let err = resolver.resolve(Path::new("/missing")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_find_path_mirrors_and_is_idempotent() {
        let (rw, ro, resolver) = setup();
        fs::create_dir_all(ro.path().join("a/b")).unwrap();

        let target = resolver.find_path(Path::new("/a/b/c")).unwrap();
        assert_eq!(target, rw.path().join("a/b/c"));
        assert!(rw.path().join("a/b").is_dir());

        // Second call is a no-op yielding the same structure.
        let again = resolver.find_path(Path::new("/a/b/c")).unwrap();
        assert_eq!(target, again);
    }

    #[test]
    fn test_find_path_through_file_fails() {
        let (rw, _ro, resolver) = setup();
        fs::write(rw.path().join("a"), b"file").unwrap();
        let err = resolver.find_path(Path::new("/a/b")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
    }
}
