//! `fuser` adapter over [`MorosFs`].
//!
//! The kernel addresses nodes by inode number while the engine resolves
//! paths, so the adapter hands out inode numbers on first sight of a path
//! and remembers them for the life of the mount. The root is always 1.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, O_ACCMODE, O_RDONLY};
use tracing::{debug, info, trace, warn};

use crate::entry::{Kind, MAX_NAME_LEN};
use crate::error::{FsError, Result};
use crate::fs::{MorosFs, Stat};
use crate::image::Image;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_write: bool,
    pub allow_other: bool,
}

impl MountOptions {
    pub fn to_mount_options(self) -> Vec<MountOption> {
        let mut options = vec![MountOption::FSName("moros".to_owned())];
        if !self.read_write {
            options.push(MountOption::RO);
        }
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn file_type(kind: Kind) -> FileType {
    match kind {
        Kind::Directory => FileType::Directory,
        Kind::File => FileType::RegularFile,
    }
}

fn os_name(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidName(name.to_string_lossy().into_owned()))
}

/// Logs a failed request and returns its errno.
fn errno(op: &str, err: &FsError) -> c_int {
    match err {
        FsError::NotFound(_) => trace!(op, %err, "request failed"),
        _ => warn!(op, %err, "request failed"),
    }
    err.to_errno()
}

pub struct MorosFuse<I: Image> {
    fs: MorosFs<I>,
    options: MountOptions,
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next_ino: u64,
}

impl<I: Image> MorosFuse<I> {
    pub fn new(fs: MorosFs<I>, options: MountOptions) -> Self {
        let mut adapter = Self {
            fs,
            options,
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        adapter.paths.insert(ROOT_INO, "/".to_owned());
        adapter.inodes.insert("/".to_owned(), ROOT_INO);
        adapter
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_owned());
        self.inodes.insert(path.to_owned(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Result<String> {
        self.paths
            .get(&ino)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    fn check_writable(&self) -> Result<()> {
        if self.options.read_write {
            Ok(())
        } else {
            Err(FsError::ReadOnly)
        }
    }

    fn attr(&self, ino: u64, stat: &Stat) -> FileAttr {
        let mtime = UNIX_EPOCH + Duration::from_secs(stat.mtime);
        let (perm, nlink) = match stat.kind {
            Kind::Directory => (0o755, 2),
            Kind::File => (0o644, 1),
        };
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.size.div_ceil(512),
            atime: UNIX_EPOCH,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: file_type(stat.kind),
            perm,
            nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: self.fs.geometry().block_size as u32,
            flags: 0,
        }
    }

    fn stat_path(&mut self, path: &str) -> Result<FileAttr> {
        let stat = self.fs.lookup(path)?;
        let ino = self.ino_for(path);
        Ok(self.attr(ino, &stat))
    }

    fn do_lookup(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = child_path(&self.path_of(parent)?, os_name(name)?);
        self.stat_path(&path)
    }

    fn do_getattr(&mut self, ino: u64) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        self.stat_path(&path)
    }

    /// Only the size matters here; timestamps are left as stored.
    fn do_setattr(&mut self, ino: u64, size: Option<u64>) -> Result<FileAttr> {
        let attr = self.do_getattr(ino)?;
        match size {
            Some(size) if size != attr.size => {
                self.check_writable()?;
                Err(FsError::Unsupported("truncate"))
            }
            _ => Ok(attr),
        }
    }

    fn do_open(&mut self, ino: u64, flags: i32) -> Result<()> {
        let path = self.path_of(ino)?;
        if self.fs.lookup(&path)?.kind == Kind::Directory {
            return Err(FsError::IsDirectory(path));
        }
        if flags & O_ACCMODE != O_RDONLY {
            self.check_writable()?;
        }
        Ok(())
    }

    fn do_opendir(&mut self, ino: u64) -> Result<()> {
        let path = self.path_of(ino)?;
        if self.fs.lookup(&path)?.kind != Kind::Directory {
            return Err(FsError::NotDirectory(path));
        }
        Ok(())
    }

    fn do_read(&mut self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let offset = u64::try_from(offset).map_err(|_| FsError::InvalidOffset(offset))?;
        let path = self.path_of(ino)?;
        self.fs.read(&path, offset, u64::from(size))
    }

    /// Directory listing with `.` and `..` first, as `(ino, kind, name)`.
    fn do_readdir(&mut self, ino: u64) -> Result<Vec<(u64, FileType, String)>> {
        let path = self.path_of(ino)?;
        let children = self.fs.list(&path)?;
        let parent = parent_path(&path).to_owned();
        let parent_ino = self.ino_for(&parent);

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_owned()));
        entries.push((parent_ino, FileType::Directory, "..".to_owned()));
        for child in children {
            let child_ino = self.ino_for(&child_path(&path, &child.entry.name));
            entries.push((child_ino, file_type(child.entry.kind), child.entry.name));
        }
        Ok(entries)
    }

    fn do_write(&mut self, ino: u64, offset: i64, data: &[u8]) -> Result<u32> {
        self.check_writable()?;
        let offset = u64::try_from(offset).map_err(|_| FsError::InvalidOffset(offset))?;
        let path = self.path_of(ino)?;
        let written = self.fs.write(&path, offset, data)?;
        u32::try_from(written).map_err(|_| FsError::FileTooLarge)
    }

    fn do_create(&mut self, parent: u64, name: &OsStr, kind: Kind) -> Result<FileAttr> {
        self.check_writable()?;
        let parent_path = self.path_of(parent)?;
        let name = os_name(name)?;
        self.fs.create(&parent_path, name, kind)?;
        self.stat_path(&child_path(&parent_path, name))
    }
}

impl<I: Image> Filesystem for MorosFuse<I> {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        info!(read_write = self.options.read_write, "moros: init");
        Ok(())
    }

    fn destroy(&mut self) {
        match self.fs.flush() {
            Ok(()) => info!("moros: destroy"),
            Err(err) => warn!(%err, "moros: flush on destroy failed"),
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!(parent, ?name, "lookup");
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno("lookup", &err)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!(ino, "getattr");
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(errno("getattr", &err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(ino, ?size, "setattr");
        match self.do_setattr(ino, size) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(errno("setattr", &err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!(ino, flags, "open");
        match self.do_open(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(errno("open", &err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!(ino, "opendir");
        match self.do_opendir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(errno("opendir", &err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!(ino, offset, size, "read");
        match self.do_read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno("read", &err)),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        debug!(ino, offset, "readdir");
        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno("readdir", &err));
                return;
            }
        };
        // offset is the number of entries already returned
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!(ino, offset, len = data.len(), "write");
        match self.do_write(ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno("write", &err)),
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        debug!(parent, ?name, "mkdir");
        match self.do_create(parent, name, Kind::Directory) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno("mkdir", &err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(parent, ?name, "create");
        match self.do_create(parent, name, Kind::File) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(err) => reply.error(errno("create", &err)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.fs.usage() {
            Ok(usage) => {
                let bsize = usage.block_size as u32;
                reply.statfs(
                    usage.block_count,
                    usage.free_blocks(),
                    usage.free_blocks(),
                    0,
                    0,
                    bsize,
                    MAX_NAME_LEN as u32,
                    bsize,
                );
            }
            Err(err) => reply.error(errno("statfs", &err)),
        }
    }
}

/// Mounts `fs` at `mountpoint` and serves requests until unmounted.
pub fn mount<I: Image>(fs: MorosFs<I>, mountpoint: &Path, options: MountOptions) -> std::io::Result<()> {
    info!(mountpoint = %mountpoint.display(), read_write = options.read_write, "mounting");
    fuser::mount2(MorosFuse::new(fs, options), mountpoint, &options.to_mount_options())
}
