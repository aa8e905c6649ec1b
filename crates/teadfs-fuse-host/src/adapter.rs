// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FUSE adapter
//!
//! Maps FUSE inode numbers onto paths below the mount root and delegates
//! regular-file semantics to the core. Directory operations act on the
//! lower tree directly; the daemon only ever sees regular files. Opens are
//! handed out with direct I/O so the kernel page cache never serves stale
//! plaintext for a file the daemon re-encrypted behind our back.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, EIO, ENOENT, ENOTDIR};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use teadfs_core::{FsError, OpenFile, TeadFs};
use teadfs_proto::Caller;
use tracing::debug;

const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

pub struct TeadFsFuse {
    fs: Arc<TeadFs>,
    paths: HashMap<u64, PathBuf>,
    inos: HashMap<PathBuf, u64>,
    next_ino: u64,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
}

fn caller_of(req: &Request<'_>) -> Caller {
    Caller::new(req.pid() as libc::pid_t, req.uid(), req.gid())
}

fn kind_of(meta: &Metadata) -> FileType {
    if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn time_of(seconds: i64, nanos: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::new(seconds as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

impl TeadFsFuse {
    pub fn new(fs: Arc<TeadFs>) -> Self {
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, PathBuf::new());
        inos.insert(PathBuf::new(), ROOT_INO);
        Self {
            fs,
            paths,
            inos,
            next_ino: ROOT_INO + 1,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn rel_of(&self, ino: u64) -> Option<&PathBuf> {
        self.paths.get(&ino)
    }

    fn ino_for(&mut self, rel: &Path) -> u64 {
        if let Some(ino) = self.inos.get(rel) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, rel.to_path_buf());
        self.inos.insert(rel.to_path_buf(), ino);
        ino
    }

    fn forget_path(&mut self, ino: u64) {
        if let Some(rel) = self.paths.remove(&ino) {
            self.inos.remove(&rel);
        }
    }

    /// Stacked attributes for `rel`: lower metadata with the apparent
    /// size for decrypt-classified files.
    fn attr_for(&self, ino: u64, rel: &Path, caller: &Caller) -> Result<FileAttr, FsError> {
        let meta = std::fs::symlink_metadata(self.fs.lower_path(rel))?;
        let size = if meta.is_file() {
            self.fs.apparent_size_of_path(rel, caller)?
        } else {
            meta.len()
        };
        Ok(FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: time_of(meta.atime(), meta.atime_nsec()),
            mtime: time_of(meta.mtime(), meta.mtime_nsec()),
            ctime: time_of(meta.ctime(), meta.ctime_nsec()),
            crtime: UNIX_EPOCH,
            kind: kind_of(&meta),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: 4096,
            flags: 0,
        })
    }

    fn store_handle(&mut self, open: OpenFile) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, open);
        fh
    }
}

impl Filesystem for TeadFsFuse {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_rel) = self.rel_of(parent).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let rel = parent_rel.join(name);
        if !self.fs.lower_path(&rel).exists() {
            reply.error(ENOENT);
            return;
        }
        let ino = self.ino_for(&rel);
        match self.attr_for(ino, &rel, &caller_of(req)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, _nlookup: u64) {
        if let Some(rel) = self.rel_of(ino).cloned() {
            if let Ok(meta) = std::fs::metadata(self.fs.lower_path(&rel)) {
                self.fs.evict(meta.ino(), &caller_of(req));
            }
        }
        self.forget_path(ino);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(rel) = self.rel_of(ino).cloned() else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_for(ino, &rel, &caller_of(req)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(rel) = self.rel_of(ino).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let caller = caller_of(req);
        let lower = self.fs.lower_path(&rel);

        if let Some(mode) = mode {
            if let Err(err) =
                std::fs::set_permissions(&lower, std::fs::Permissions::from_mode(mode))
            {
                reply.error(err.raw_os_error().unwrap_or(EIO));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            let Ok(path) = std::ffi::CString::new(lower.as_os_str().as_encoded_bytes()) else {
                reply.error(EINVAL);
                return;
            };
            let rc = unsafe {
                libc::chown(
                    path.as_ptr(),
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                )
            };
            if rc != 0 {
                reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(EIO));
                return;
            }
        }
        if let Some(new_size) = size {
            let result = match fh.and_then(|fh| self.handles.get(&fh)) {
                Some(open) => self.fs.truncate(open, new_size),
                None => self.fs.truncate_path(&rel, new_size, caller),
            };
            if let Err(err) = result {
                reply.error(err.errno());
                return;
            }
        }

        match self.attr_for(ino, &rel, &caller) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(rel) = self.rel_of(ino).cloned() else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.open(&rel, flags, caller_of(req)) {
            Ok(open) => {
                debug!(ino, ?rel, mode = ?open.mode, "open");
                let fh = self.store_handle(open);
                reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_rel) = self.rel_of(parent).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let rel = parent_rel.join(name);
        let caller = caller_of(req);
        match self.fs.create(&rel, flags, mode & 0o7777, caller) {
            Ok(open) => {
                let ino = self.ino_for(&rel);
                match self.attr_for(ino, &rel, &caller) {
                    Ok(attr) => {
                        let fh = self.store_handle(open);
                        reply.created(&TTL, &attr, 0, fh, fuser::consts::FOPEN_DIRECT_IO);
                    }
                    Err(err) => reply.error(err.errno()),
                }
            }
            Err(err) => reply.error(err.errno()),
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
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let Some(open) = self.handles.get(&fh) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.read(open, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
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
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let Some(open) = self.handles.get(&fh) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.write(open, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(open) = self.handles.get(&fh) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.flush(open) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(open) = self.handles.get(&fh) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.flush(open) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(open) = self.handles.remove(&fh) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.release(open) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
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
        let Some(rel) = self.rel_of(ino).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let lower = self.fs.lower_path(&rel);
        let entries = match std::fs::read_dir(&lower) {
            Ok(iter) => iter,
            Err(err) => {
                reply.error(err.raw_os_error().unwrap_or(ENOTDIR));
                return;
            }
        };

        let mut listing: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (ino, FileType::Directory, "..".into()),
        ];
        for entry in entries.flatten() {
            let name = entry.file_name();
            let child_rel = rel.join(&name);
            let kind = entry
                .metadata()
                .map(|meta| kind_of(&meta))
                .unwrap_or(FileType::RegularFile);
            let child_ino = self.ino_for(&child_rel);
            listing.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in
            listing.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_rel) = self.rel_of(parent).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let rel = parent_rel.join(name);
        let lower = self.fs.lower_path(&rel);
        if let Err(err) = std::fs::create_dir(&lower) {
            reply.error(err.raw_os_error().unwrap_or(EIO));
            return;
        }
        let _ = std::fs::set_permissions(&lower, std::fs::Permissions::from_mode(mode & 0o7777));
        let ino = self.ino_for(&rel);
        match self.attr_for(ino, &rel, &caller_of(req)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_rel) = self.rel_of(parent).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let rel = parent_rel.join(name);
        match std::fs::remove_dir(self.fs.lower_path(&rel)) {
            Ok(()) => {
                if let Some(ino) = self.inos.get(&rel).copied() {
                    self.forget_path(ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_rel) = self.rel_of(parent).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let rel = parent_rel.join(name);
        let lower = self.fs.lower_path(&rel);
        let file_id = std::fs::metadata(&lower).map(|meta| meta.ino()).ok();
        match std::fs::remove_file(&lower) {
            Ok(()) => {
                if let Some(file_id) = file_id {
                    self.fs.evict(file_id, &caller_of(req));
                }
                if let Some(ino) = self.inos.get(&rel).copied() {
                    self.forget_path(ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(rel) = self.rel_of(ino).cloned() else {
            reply.error(ENOENT);
            return;
        };
        match std::fs::read_link(self.fs.lower_path(&rel)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_rel) = self.rel_of(parent).cloned() else {
            reply.error(ENOENT);
            return;
        };
        let rel = parent_rel.join(link_name);
        if let Err(err) = std::os::unix::fs::symlink(target, self.fs.lower_path(&rel)) {
            reply.error(err.raw_os_error().unwrap_or(EIO));
            return;
        }
        let ino = self.ino_for(&rel);
        match self.attr_for(ino, &rel, &caller_of(req)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from_parent), Some(to_parent)) = (
            self.rel_of(parent).cloned(),
            self.rel_of(newparent).cloned(),
        ) else {
            reply.error(ENOENT);
            return;
        };
        let from = from_parent.join(name);
        let to = to_parent.join(newname);
        match std::fs::rename(self.fs.lower_path(&from), self.fs.lower_path(&to)) {
            Ok(()) => {
                // Path tables track names, so the moved entry gets a fresh
                // ino on next lookup.
                if let Some(ino) = self.inos.remove(&from) {
                    self.paths.remove(&ino);
                }
                if let Some(ino) = self.inos.remove(&to) {
                    self.paths.remove(&ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
        }
    }
}
