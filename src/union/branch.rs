//! Branch registry and concrete path composition
//!
//! Holds the two branch roots (read-write, read-only), fixed for the life
//! of the mounted union, and composes concrete branch paths and marker
//! paths from logical paths. All length checks against the platform path
//! limit happen here.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Prefix of whiteout tombstone markers on the writable branch.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix of metadata-override records on the writable branch.
pub const OVERRIDE_PREFIX: &str = ".me.";

/// Prefix of in-flight copy-up temporaries on the writable branch.
pub const COPYUP_PREFIX: &str = ".cp.";

/// Whether a directory-entry name belongs to the reserved marker namespace.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX)
        || name.starts_with(OVERRIDE_PREFIX)
        || name.starts_with(COPYUP_PREFIX)
}

/// The two branch roots composing the union. Set once, never mutated.
#[derive(Debug)]
pub struct Branches {
    rw_root: PathBuf,
    ro_root: PathBuf,
}

impl Branches {
    /// Validate and register the branch roots.
    ///
    /// Both must be existing directories; the read-write root must be
    /// writable by the mounting process.
    pub fn new(rw_root: PathBuf, ro_root: PathBuf) -> Result<Self> {
        for (root, label) in [(&rw_root, "read-write"), (&ro_root, "read-only")] {
            let meta = std::fs::metadata(root)
                .map_err(|e| Error::Config(format!("{} branch {}: {}", label, root.display(), e)))?;
            if !meta.is_dir() {
                return Err(Error::Config(format!(
                    "{} branch {} is not a directory",
                    label,
                    root.display()
                )));
            }
        }

        let probe = rw_root.join(".duofs-write-probe");
        std::fs::File::create(&probe)
            .and_then(|_| std::fs::remove_file(&probe))
            .map_err(|e| {
                Error::Config(format!(
                    "read-write branch {} is not writable: {}",
                    rw_root.display(),
                    e
                ))
            })?;

        Ok(Self { rw_root, ro_root })
    }

    pub fn rw_root(&self) -> &Path {
        &self.rw_root
    }

    pub fn ro_root(&self) -> &Path {
        &self.ro_root
    }

    /// Normalize a logical path.
    ///
    /// Logical paths begin with '/', carry no trailing '/', no '.' or '..'
    /// components, and no component in the reserved marker namespace.
    pub fn normalize(logical: &Path) -> Result<PathBuf> {
        if !logical.has_root() {
            return Err(Error::InvalidArgument(format!(
                "logical path must be absolute: {}",
                logical.display()
            )));
        }

        let mut normalized = PathBuf::from("/");
        for component in logical.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "logical path is not valid UTF-8: {}",
                            logical.display()
                        ))
                    })?;
                    if is_reserved_name(name) {
                        return Err(Error::InvalidArgument(format!(
                            "reserved name in logical path: {}",
                            name
                        )));
                    }
                    normalized.push(name);
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "'.' and '..' are not allowed in logical paths: {}",
                        logical.display()
                    )))
                }
            }
        }

        Ok(normalized)
    }

    /// Split a logical path into its parent and final segment.
    ///
    /// The union root itself has no final segment and cannot be the target
    /// of whiteout or override operations.
    pub fn parent_and_name(logical: &Path) -> Result<(&Path, &str)> {
        let parent = logical.parent().ok_or_else(|| {
            Error::InvalidArgument("union root has no parent".to_string())
        })?;
        let name = logical
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no final segment: {}", logical.display()))
            })?;
        Ok((parent, name))
    }

    /// Concrete path of a logical path on the read-write branch.
    pub fn rw_path(&self, logical: &Path) -> Result<PathBuf> {
        Self::join_checked(&self.rw_root, logical, 0)
    }

    /// Concrete path of a logical path on the read-only branch.
    pub fn ro_path(&self, logical: &Path) -> Result<PathBuf> {
        Self::join_checked(&self.ro_root, logical, 0)
    }

    /// Concrete path of the whiteout marker masking a logical path.
    pub fn whiteout_path(&self, logical: &Path) -> Result<PathBuf> {
        self.marker_path(logical, WHITEOUT_PREFIX)
    }

    /// Concrete path of the metadata-override record for a logical path.
    pub fn override_path(&self, logical: &Path) -> Result<PathBuf> {
        self.marker_path(logical, OVERRIDE_PREFIX)
    }

    /// Marker path: `<rw-root>/<parent>/<prefix><name>`.
    pub fn marker_path(&self, logical: &Path, prefix: &str) -> Result<PathBuf> {
        let (parent, name) = Self::parent_and_name(logical)?;
        let dir = Self::join_checked(&self.rw_root, parent, prefix.len() + name.len() + 1)?;
        Ok(dir.join(format!("{}{}", prefix, name)))
    }

    fn join_checked(root: &Path, logical: &Path, extra: usize) -> Result<PathBuf> {
        let relative = logical.strip_prefix("/").unwrap_or(logical);
        let joined = root.join(relative);
        if joined.as_os_str().len() + extra > libc::PATH_MAX as usize {
            return Err(Error::NameTooLong(logical.to_path_buf()));
        }
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn branches() -> (tempfile::TempDir, tempfile::TempDir, Branches) {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();
        let b = Branches::new(rw.path().to_path_buf(), ro.path().to_path_buf()).unwrap();
        (rw, ro, b)
    }

    #[test]
    fn test_normalize() {
        let p = Branches::normalize(Path::new("/docs/readme.txt")).unwrap();
        assert_eq!(p, PathBuf::from("/docs/readme.txt"));

        let p = Branches::normalize(Path::new("/docs/")).unwrap();
        assert_eq!(p, PathBuf::from("/docs"));

        assert!(Branches::normalize(Path::new("docs")).is_err());
        assert!(Branches::normalize(Path::new("/a/../b")).is_err());
    }

    #[test]
    fn test_normalize_rejects_reserved() {
        for bad in ["/.wh.x", "/dir/.me.y", "/dir/.cp.z"] {
            let err = Branches::normalize(Path::new(bad)).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{}", bad);
        }
    }

    #[test]
    fn test_marker_paths() {
        let (_rw, _ro, b) = branches();
        let wh = b.whiteout_path(Path::new("/docs/readme.txt")).unwrap();
        assert!(wh.ends_with("docs/.wh.readme.txt"));
        let me = b.override_path(Path::new("/docs/readme.txt")).unwrap();
        assert!(me.ends_with("docs/.me.readme.txt"));
    }

    #[test]
    fn test_root_has_no_marker() {
        let (_rw, _ro, b) = branches();
        assert!(b.whiteout_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_name_too_long() {
        let (_rw, _ro, b) = branches();
        let long = format!("/{}", "x".repeat(libc::PATH_MAX as usize));
        let err = b.rw_path(Path::new(&long)).unwrap_err();
        assert!(matches!(err, Error::NameTooLong(_)));
    }

    #[test]
    fn test_rejects_missing_branch() {
        let rw = tempdir().unwrap();
        let err = Branches::new(rw.path().to_path_buf(), PathBuf::from("/no/such/dir"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name(".wh.foo"));
        assert!(is_reserved_name(".me.foo"));
        assert!(is_reserved_name(".cp.foo.123"));
        assert!(!is_reserved_name("foo"));
        assert!(!is_reserved_name(".whatever"));
    }
}
