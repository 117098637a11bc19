//! FUSE dispatch for the union engine
//!
//! Translates inode-based FUSE requests into the logical-path operations
//! of [`Union`]. Byte-level I/O runs against the concrete branch file the
//! engine resolved; everything union-specific stays in the core.

use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

use super::inode::{HandleTable, InodeTable};
use crate::error::{Error, Result};
use crate::union::{AttrChanges, Caller, FileAttributes, FileKind, TimeChange, Union};

const TTL: Duration = Duration::from_secs(1);

/// Union FUSE filesystem
pub struct UnionFs {
    union: Union,
    inodes: InodeTable,
    handles: HandleTable,
}

impl UnionFs {
    pub fn new(union: Union) -> Self {
        Self {
            union,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    fn caller(req: &Request<'_>) -> Caller {
        Caller {
            uid: req.uid(),
            gid: req.gid(),
        }
    }

    fn attr_of(&self, logical: &Path) -> Result<FileAttr> {
        let (_, attrs) = self.union.get_attributes(logical)?;
        Ok(to_fuser_attr(self.inodes.ino_for(logical), &attrs))
    }
}

fn to_fuser_attr(ino: u64, attrs: &FileAttributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: (attrs.size + 511) / 512,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: attrs.ctime,
        kind: to_fuser_kind(attrs.kind),
        perm: attrs.mode as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev as u32,
        blksize: 4096,
        flags: 0,
    }
}

fn to_fuser_kind(kind: FileKind) -> fuser::FileType {
    match kind {
        FileKind::RegularFile => fuser::FileType::RegularFile,
        FileKind::Directory => fuser::FileType::Directory,
        FileKind::Symlink => fuser::FileType::Symlink,
        FileKind::Fifo => fuser::FileType::NamedPipe,
        FileKind::CharDevice => fuser::FileType::CharDevice,
        FileKind::BlockDevice => fuser::FileType::BlockDevice,
        FileKind::Socket => fuser::FileType::Socket,
    }
}

fn to_time_change(t: TimeOrNow) -> TimeChange {
    match t {
        TimeOrNow::SpecificTime(t) => TimeChange::Set(t),
        TimeOrNow::Now => TimeChange::Now,
    }
}

impl Filesystem for UnionFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let logical = match self.inodes.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.attr_of(&logical) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let logical = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.attr_of(&logical) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={})", ino);

        let logical = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        // Truncation is a content mutation: it forces copy-up.
        if let Some(size) = size {
            let concrete = match self.union.prepare_write(&logical, &caller) {
                Ok(path) => path,
                Err(e) => return reply.error(e.errno()),
            };
            let truncated = std::fs::OpenOptions::new()
                .write(true)
                .open(&concrete)
                .and_then(|f| f.set_len(size));
            if let Err(e) = truncated {
                return reply.error(Error::from_branch_io(e, &logical).errno());
            }
        }

        let changes = AttrChanges {
            mode,
            uid,
            gid,
            atime: atime.map(to_time_change),
            mtime: mtime.map(to_time_change),
        };
        if !changes.is_empty() {
            if let Err(e) = self.union.set_attributes(&logical, &caller, &changes) {
                return reply.error(e.errno());
            }
        }

        match self.attr_of(&logical) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let logical = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.union.read_link(&logical) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let logical = match self.inodes.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        let result = match mode & libc::S_IFMT {
            libc::S_IFREG => self
                .union
                .create_file(&logical, &caller, mode)
                .map(|_| ()),
            libc::S_IFIFO => self
                .union
                .mknod(&logical, &caller, FileKind::Fifo, mode, rdev as u64),
            libc::S_IFCHR => self.union.mknod(
                &logical,
                &caller,
                FileKind::CharDevice,
                mode,
                rdev as u64,
            ),
            libc::S_IFBLK => self.union.mknod(
                &logical,
                &caller,
                FileKind::BlockDevice,
                mode,
                rdev as u64,
            ),
            libc::S_IFSOCK => {
                self.union
                    .mknod(&logical, &caller, FileKind::Socket, mode, rdev as u64)
            }
            _ => Err(Error::InvalidArgument(format!("mknod mode {:o}", mode))),
        };

        match result.and_then(|()| self.attr_of(&logical)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let logical = match self.inodes.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        match self
            .union
            .mkdir(&logical, &caller, mode)
            .and_then(|()| self.attr_of(&logical))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let logical = match self.inodes.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.union.unlink(&logical, &Self::caller(req)) {
            Ok(()) => {
                self.inodes.forget_path(&logical);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let logical = match self.inodes.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.union.rmdir(&logical, &Self::caller(req)) {
            Ok(()) => {
                self.inodes.forget_path(&logical);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?})", parent, link_name);

        let logical = match self.inodes.child_path(parent, link_name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        match self
            .union
            .symlink(&logical, &caller, target)
            .and_then(|()| self.attr_of(&logical))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let source = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let dest = match self.inodes.child_path(newparent, newname) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        match self
            .union
            .link(&source, &dest, &caller)
            .and_then(|()| self.attr_of(&dest))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        let logical = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        let accmode = flags & libc::O_ACCMODE;
        let wants_write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;

        let concrete = if wants_write {
            self.union.prepare_write(&logical, &caller)
        } else {
            self.union.open_read(&logical, &caller)
        };
        let concrete = match concrete {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };

        let file = std::fs::OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(wants_write)
            .append(flags & libc::O_APPEND != 0)
            .truncate(wants_write && flags & libc::O_TRUNC != 0)
            .open(&concrete);
        match file {
            Ok(file) => reply.opened(self.handles.insert(file), 0),
            Err(e) => {
                error!("open failed for {}: {}", concrete.display(), e);
                reply.error(Error::from_branch_io(e, &logical).errno())
            }
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let logical = match self.inodes.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let caller = Self::caller(req);

        let concrete = match self.union.create_file(&logical, &caller, mode) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };

        let accmode = flags & libc::O_ACCMODE;
        let file = std::fs::OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(accmode != libc::O_RDONLY)
            .open(&concrete);
        let file = match file {
            Ok(file) => file,
            Err(e) => return reply.error(Error::from_branch_io(e, &logical).errno()),
        };

        match self.attr_of(&logical) {
            Ok(attr) => {
                let fh = self.handles.insert(file);
                reply.created(&TTL, &attr, 0, fh, 0)
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let file = match self.handles.get(fh) {
            Some(file) => file,
            None => return reply.error(libc::EBADF),
        };
        let mut buffer = vec![0u8; size as usize];
        match file.read_at(&mut buffer, offset as u64) {
            Ok(read) => {
                buffer.truncate(read);
                reply.data(&buffer)
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let file = match self.handles.get(fh) {
            Some(file) => file,
            None => return reply.error(libc::EBADF),
        };
        match file.write_at(data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(fh={})", fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let logical = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let merged = match self.union.read_dir(&logical, &Self::caller(req)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.errno()),
        };

        let mut entries: Vec<(u64, fuser::FileType, String)> = vec![
            (ino, fuser::FileType::Directory, ".".to_string()),
            (ino, fuser::FileType::Directory, "..".to_string()),
        ];
        for entry in merged {
            let child_ino = self.inodes.ino_for(&logical.join(&entry.name));
            entries.push((child_ino, to_fuser_kind(entry.kind), entry.name));
        }

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let logical = match self.inodes.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        if mask == libc::F_OK {
            return match self.union.resolve(&logical) {
                Ok(res) if res.exists() => reply.ok(),
                Ok(_) => reply.error(libc::ENOENT),
                Err(e) => reply.error(e.errno()),
            };
        }
        match self
            .union
            .check_access(&logical, &Self::caller(req), mask as u32)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        // Report the read-only branch, as the bulk of the tree lives there.
        match nix::sys::statvfs::statvfs(self.union.branches().ro_root()) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }
}
