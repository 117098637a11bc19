//! Attribute view shared by the resolver, override manager and copy-up
//!
//! [`FileAttributes`] is the merged, override-aware view handed to callers;
//! [`AttrChanges`] is the delta a setattr request carries. Only fields an
//! override record may carry (mode, ownership, timestamps) appear in the
//! delta; size changes are content mutations and go through copy-up.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File type of a union entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    #[cfg(unix)]
    pub fn from_file_type(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

/// Merged attribute view of a union entry
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub kind: FileKind,
    /// Permission bits only (no type bits)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttributes {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            kind: FileKind::from_file_type(meta.file_type()),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            nlink: meta.nlink() as u32,
            rdev: meta.rdev(),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime: UNIX_EPOCH + Duration::new(meta.ctime() as u64, meta.ctime_nsec() as u32),
        }
    }
}

/// Serializable wall-clock timestamp for override records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                Self {
                    secs: -(d.as_secs() as i64),
                    nanos: d.subsec_nanos(),
                }
            }
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nanos)
        } else {
            UNIX_EPOCH - Duration::new((-self.secs) as u64, self.nanos)
        }
    }
}

/// Timestamp change carried by a setattr request.
///
/// The two forms carry different permission rules: setting to the current
/// time needs write access, an explicit time needs ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeChange {
    Now,
    Set(SystemTime),
}

impl TimeChange {
    pub fn resolve(self) -> SystemTime {
        match self {
            TimeChange::Now => SystemTime::now(),
            TimeChange::Set(t) => t,
        }
    }

    pub fn is_explicit(self) -> bool {
        matches!(self, TimeChange::Set(_))
    }
}

/// Attribute delta carried by a setattr request
#[derive(Debug, Clone, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<TimeChange>,
    pub mtime: Option<TimeChange>,
}

impl AttrChanges {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }

    /// Whether the delta carries an explicit (non-"now") timestamp.
    pub fn has_explicit_times(&self) -> bool {
        self.atime.map_or(false, TimeChange::is_explicit)
            || self.mtime.map_or(false, TimeChange::is_explicit)
    }

    /// Apply this delta on top of a base attribute view.
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
            attrs.atime = atime.resolve();
        }
        if let Some(mtime) = self.mtime {
            attrs.mtime = mtime.resolve();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = SystemTime::now();
        let ts = Timestamp::from_system_time(now);
        let back = ts.to_system_time();
        let drift = now
            .duration_since(back)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_micros(1));
    }

    #[test]
    fn test_apply_changes() {
        let mut attrs = FileAttributes {
            kind: FileKind::RegularFile,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            size: 10,
            nlink: 1,
            rdev: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        };
        let changes = AttrChanges {
            mode: Some(0o600),
            gid: Some(2000),
            ..Default::default()
        };
        changes.apply_to(&mut attrs);
        assert_eq!(attrs.mode, 0o600);
        assert_eq!(attrs.uid, 1000);
        assert_eq!(attrs.gid, 2000);
    }

    #[test]
    fn test_explicit_time_detection() {
        let none = AttrChanges::default();
        assert!(!none.has_explicit_times());

        let now = AttrChanges {
            mtime: Some(TimeChange::Now),
            ..Default::default()
        };
        assert!(!now.has_explicit_times());

        let set = AttrChanges {
            atime: Some(TimeChange::Set(UNIX_EPOCH)),
            ..Default::default()
        };
        assert!(set.has_explicit_times());
    }
}
