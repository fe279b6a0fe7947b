//! Bridge from FUSE callbacks to the filesystem engine.
//!
//! The kernel side is inode-indexed while the engine resolves paths, so the
//! bridge keeps an inode-to-path map with `ino = node id + 1` (the FUSE root
//! inode 1 is engine node 0). File handles carry the node id.

use crate::error::{Error, Result};
use crate::fs::record::{NAME_MAX, NodeKind};
use crate::fs::{AppendFs, Stat};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long the kernel may cache entries and attributes.
const TTL: Duration = Duration::from_secs(1);

fn ino_of(node: u32) -> u64 {
    node as u64 + 1
}

fn node_of(ino: u64) -> u32 {
    (ino - 1) as u32
}

fn epoch(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn time_secs(time: TimeOrNow) -> u64 {
    let time = match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    };
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns the parent directory of `path`.
fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(at) => &path[..at],
    }
}

/// Adapter owning the engine and the inode-to-path translation.
pub struct Bridge {
    fs: AppendFs,
    paths: HashMap<u64, String>,
}

impl Bridge {
    pub fn new(fs: AppendFs) -> Self {
        let mut paths = HashMap::new();
        paths.insert(ino_of(0), "/".to_owned());
        Self { fs, paths }
    }

    fn path_of(&self, ino: u64) -> Result<String> {
        self.paths.get(&ino).cloned().ok_or(Error::NotFound)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String> {
        let dir = self.path_of(parent)?;
        let name = name.to_str().ok_or(Error::Invalid)?;
        if dir == "/" {
            Ok(format!("/{name}"))
        } else {
            Ok(format!("{dir}/{name}"))
        }
    }

    fn attr(&self, stat: &Stat) -> Result<FileAttr> {
        let status = self.fs.get_status()?;
        let (kind, default_mode) = match stat.kind {
            NodeKind::File => (FileType::RegularFile, 0o644),
            NodeKind::Dir => (FileType::Directory, 0o755),
            _ => (FileType::Symlink, 0o777),
        };
        let perm = if stat.mode != 0 { stat.mode } else { default_mode };
        let blocks = match stat.kind {
            // 512-byte units by definition.
            NodeKind::File => stat.size.div_ceil(512),
            _ => (status.block_size as u64).div_ceil(512),
        };
        Ok(FileAttr {
            ino: ino_of(stat.node),
            size: stat.size,
            blocks,
            atime: epoch(stat.atime),
            mtime: epoch(stat.mtime),
            ctime: epoch(stat.atime),
            crtime: UNIX_EPOCH,
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: status.block_size as u32,
            flags: 0,
        })
    }

    fn attr_at(&self, path: &str) -> Result<FileAttr> {
        let stat = self.fs.get_node(path)?;
        self.attr(&stat)
    }

    fn do_lookup(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        let attr = self.attr_at(&path)?;
        self.paths.insert(attr.ino, path);
        Ok(attr)
    }

    fn do_setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        if let Some(mode) = mode {
            self.fs.set_mode(&path, (mode & 0o7777) as u16)?;
        }
        if let Some(size) = size {
            self.fs.del_data(node_of(ino), size)?;
        }
        if atime.is_some() || mtime.is_some() {
            let stat = self.fs.get_node(&path)?;
            let atime = atime.map(time_secs).unwrap_or(stat.atime);
            let mtime = mtime.map(time_secs).unwrap_or(stat.mtime);
            self.fs.set_time(&path, atime, mtime)?;
        }
        self.attr_at(&path)
    }

    fn do_readdir(&mut self, ino: u64) -> Result<Vec<(u64, FileType, String)>> {
        let path = self.path_of(ino)?;
        let parent_ino = self
            .fs
            .get_node(parent_of(&path))
            .map(|stat| ino_of(stat.node))
            .unwrap_or(ino);
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (parent_ino, FileType::Directory, "..".to_owned()),
        ];
        self.fs.get_dir(&path, |entry| {
            let kind = match entry.kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::Link => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            entries.push((ino_of(entry.node), kind, entry.name.to_string()));
        })?;
        Ok(entries)
    }

    /// Opens a file. Writing without `O_APPEND` drops the existing content,
    /// so the rewrite reuses the node's own blocks.
    fn do_open(&mut self, ino: u64, flags: i32) -> Result<u64> {
        let path = self.path_of(ino)?;
        let stat = self.fs.get_node(&path)?;
        if stat.kind != NodeKind::File {
            return Err(Error::Invalid);
        }
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => {}
            libc::O_WRONLY | libc::O_RDWR => {
                if flags & libc::O_APPEND == 0 {
                    self.fs.del_data(stat.node, 0)?;
                }
            }
            _ => return Err(Error::NotSupported),
        }
        Ok(stat.node as u64)
    }

    fn do_create(&mut self, parent: u64, name: &OsStr) -> Result<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        self.fs.set_file(&path)?;
        let attr = self.attr_at(&path)?;
        self.paths.insert(attr.ino, path);
        Ok((attr, node_of(attr.ino) as u64))
    }

    fn do_mkdir(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        self.fs.set_dir(&path)?;
        let attr = self.attr_at(&path)?;
        self.paths.insert(attr.ino, path);
        Ok(attr)
    }

    fn do_symlink(&mut self, parent: u64, name: &OsStr, target: &Path) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        let target = target.to_str().ok_or(Error::Invalid)?;
        self.fs.set_link(&path, target)?;
        let attr = self.attr_at(&path)?;
        self.paths.insert(attr.ino, path);
        Ok(attr)
    }

    fn do_read(&mut self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        if fh == 0 {
            return Err(Error::Invalid);
        }
        let mut buf = vec![0u8; size as usize];
        let read = self.fs.get_data(fh as u32, &mut buf, offset.max(0) as u64)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn do_write(&mut self, fh: u64, offset: i64, data: &[u8]) -> Result<u32> {
        if fh == 0 {
            return Err(Error::Invalid);
        }
        self.fs.set_data(fh as u32, data, offset.max(0) as u64)?;
        Ok(data.len() as u32)
    }

    fn do_rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(newparent, newname)?;
        let moved = self.fs.get_node(&from)?;
        self.fs.move_node(&from, &to)?;
        self.paths.insert(ino_of(moved.node), to);
        Ok(())
    }

    fn do_unlink(&mut self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_path(parent, name)?;
        self.fs.del_node(&path)
    }
}

impl Filesystem for Bridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.path_of(ino).and_then(|path| self.attr_at(&path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
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
        match self.do_setattr(ino, mode, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.do_readdir(ino) {
            Ok(entries) => {
                for (i, (ino, kind, name)) in
                    entries.into_iter().enumerate().skip(offset.max(0) as usize)
                {
                    if reply.add(ino, (i + 1) as i64, kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.do_mkdir(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.do_create(parent, name) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.do_write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        match self.do_symlink(parent, name, link) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let target = self
            .path_of(ino)
            .and_then(|path| self.fs.get_link(&path));
        match target {
            Ok(payload) => reply.data(payload.name.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(Error::NotSupported.errno());
            return;
        }
        match self.do_rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.get_status() {
            Ok(status) => reply.statfs(
                status.total_blocks,
                status.free_blocks,
                status.free_blocks,
                0,
                0,
                status.block_size as u32,
                NAME_MAX as u32,
                status.block_size as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.path_of(ino).and_then(|path| self.fs.get_node(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    // Extended attributes are accepted and ignored.

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.size(0);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.size(0);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.ok();
    }
}
