//! Inode and handle bookkeeping for the FUSE layer
//!
//! FUSE speaks inode numbers; the union core speaks logical paths. The
//! tables here map between the two and track open file handles. No
//! branch-merging logic lives at this level.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maps FUSE inode numbers to logical union paths
pub struct InodeTable {
    next_ino: AtomicU64,
    paths: RwLock<HashMap<u64, PathBuf>>,
    inos: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(2), // 1 is reserved for the root
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };
        table.paths.write().insert(1, PathBuf::from("/"));
        table.inos.write().insert(PathBuf::from("/"), 1);
        table
    }

    /// Logical path of an inode.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.read().get(&ino).cloned()
    }

    /// Inode for a logical path, allocating one on first sight.
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(ino) = self.inos.read().get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        self.paths.write().insert(ino, path.to_path_buf());
        self.inos.write().insert(path.to_path_buf(), ino);
        ino
    }

    /// Logical path of a directory entry.
    pub fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        let parent = self.path_of(parent)?;
        Some(parent.join(name))
    }

    /// Drop the mapping for a removed or renamed path.
    pub fn forget_path(&self, path: &Path) {
        if let Some(ino) = self.inos.write().remove(path) {
            self.paths.write().remove(&ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Open file handles backed by concrete branch files
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<File>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, Arc::new(file));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.handles.read().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<File>> {
        self.handles.write().remove(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ino_is_stable_per_path() {
        let table = InodeTable::new();
        let a = table.ino_for(Path::new("/x"));
        let b = table.ino_for(Path::new("/x"));
        assert_eq!(a, b);
        assert_ne!(a, 1);
        assert_eq!(table.path_of(a).unwrap(), PathBuf::from("/x"));
    }

    #[test]
    fn test_root_is_ino_one() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(1).unwrap(), PathBuf::from("/"));
        assert_eq!(table.ino_for(Path::new("/")), 1);
    }

    #[test]
    fn test_forget_path() {
        let table = InodeTable::new();
        let ino = table.ino_for(Path::new("/gone"));
        table.forget_path(Path::new("/gone"));
        assert!(table.path_of(ino).is_none());
    }

    #[test]
    fn test_child_path() {
        let table = InodeTable::new();
        let child = table
            .child_path(1, std::ffi::OsStr::new("file"))
            .unwrap();
        assert_eq!(child, PathBuf::from("/file"));
    }
}
