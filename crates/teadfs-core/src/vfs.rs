// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! VFS facade
//!
//! Entry points the mount host calls for regular-file operations. Each open
//! runs the daemon handshake, picks its access mode and joins the shared
//! lower handle of its inode; reads and writes then route through the I/O
//! adapter under that mode. With no daemon attached every operation is a
//! pass-through of the lower file.

use crate::config::FsConfig;
use crate::decision::{normalize_flags, AccessMode};
use crate::error::{FsError, FsResult};
use crate::inode::{InodeState, InodeTable};
use crate::io;
use crate::transport::Bus;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teadfs_proto::{
    decode_reply, encode_cleanup, encode_open_request, encode_release_request, AccessVerdict,
    Caller, ReplyBody,
};
use tracing::{debug, warn};

/// One open of a regular file.
pub struct OpenFile {
    pub inode: Arc<InodeState>,
    lower: Arc<File>,
    pub mode: AccessMode,
    caller: Caller,
    /// Daemon-reentrant opens bypass the coordinator and the daemon.
    daemon_open: bool,
}

impl OpenFile {
    pub fn file_id(&self) -> u64 {
        self.inode.file_id
    }
}

pub struct TeadFs {
    config: FsConfig,
    bus: Arc<Bus>,
    inodes: InodeTable,
}

impl TeadFs {
    pub fn new(config: FsConfig) -> Self {
        let bus = Arc::new(Bus::new(config.request_timeout()));
        Self {
            config,
            bus,
            inodes: InodeTable::new(),
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn lower_path(&self, rel: &Path) -> PathBuf {
        self.config.lower_root.join(rel)
    }

    /// Mount-absolute path sent to the daemon in OPEN/RELEASE blobs.
    fn mount_path_bytes(&self, rel: &Path) -> Vec<u8> {
        self.config
            .mount_point
            .join(rel)
            .as_os_str()
            .as_bytes()
            .to_vec()
    }

    /// Open the regular file at `rel` (relative to the mount root).
    pub fn open(&self, rel: &Path, flags: i32, caller: Caller) -> FsResult<OpenFile> {
        let flags = normalize_flags(flags);
        let lower_path = self.lower_path(rel);
        let meta = std::fs::metadata(&lower_path).map_err(map_lookup)?;
        if !meta.is_file() {
            return Err(FsError::Invalid);
        }
        let file_id = meta.ino();

        // The daemon's own opens skip the gate, the verdict and the
        // shared-handle refcount entirely.
        if self.bus.gate().is_daemon_caller(caller.pid) {
            let lower = Arc::new(open_lower(&lower_path, flags)?);
            return Ok(OpenFile {
                inode: self.inodes.entry(file_id, rel),
                lower,
                mode: AccessMode::Init,
                caller,
                daemon_open: true,
            });
        }

        let mode = self.decide_open(rel, file_id, &caller)?;
        let inode = self.inodes.entry(file_id, rel);
        if mode == AccessMode::Decrypt {
            inode.mark_decrypt();
        }

        let lower = inode.get_lower_file(|| open_lower(&lower_path, flags))?;
        debug!(file_id, ?mode, path = %rel.display(), "opened");
        Ok(OpenFile {
            inode,
            lower,
            mode,
            caller,
            daemon_open: false,
        })
    }

    /// Create the lower file, then run the regular open path.
    pub fn create(&self, rel: &Path, flags: i32, perm: u32, caller: Caller) -> FsResult<OpenFile> {
        use std::os::unix::fs::OpenOptionsExt;
        let lower_path = self.lower_path(rel);
        File::options()
            .write(true)
            .create_new(true)
            .mode(perm)
            .open(&lower_path)?;
        self.open(rel, flags, caller)
    }

    /// OPEN round trip; the verdict becomes the mode of this open.
    fn decide_open(&self, rel: &Path, file_id: u64, caller: &Caller) -> FsResult<AccessMode> {
        if !self.bus.gate().connected() {
            return Ok(AccessMode::Init);
        }
        let path = self.mount_path_bytes(rel);
        let reply = match self
            .bus
            .roundtrip(|msg_id| encode_open_request(msg_id, caller, file_id, &path))
        {
            Ok(reply) => reply,
            // A missing, hung or detaching daemon degrades the open to a
            // pass-through instead of failing it.
            Err(FsError::NoDaemon | FsError::Timeout | FsError::NoReply) => {
                return Ok(AccessMode::Init)
            }
            Err(err) => return Err(err),
        };
        // A malformed reply is dropped like any other malformed packet;
        // the open then degrades to a pass-through, same as a timeout.
        let verdict = match decode_reply(&reply) {
            Ok(view) => match view.body {
                ReplyBody::Code { error_code } => AccessVerdict::from_code(error_code),
                ReplyBody::Data { .. } => {
                    warn!(file_id, "dropping open reply with a data body");
                    return Ok(AccessMode::Init);
                }
            },
            Err(err) => {
                warn!(file_id, %err, "dropping malformed open reply");
                return Ok(AccessMode::Init);
            }
        };
        AccessMode::from_verdict(verdict)
    }

    pub fn read(&self, open: &OpenFile, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        io::read_transformed(&self.bus, &open.caller, open.mode, &open.lower, offset, size)
    }

    pub fn write(&self, open: &OpenFile, offset: u64, data: &[u8]) -> FsResult<usize> {
        io::write_transformed(&self.bus, &open.caller, open.mode, &open.lower, offset, data)
    }

    pub fn flush(&self, open: &OpenFile) -> FsResult<()> {
        open.lower.sync_data()?;
        Ok(())
    }

    /// Apparent size of this open's view.
    pub fn size_of(&self, open: &OpenFile) -> FsResult<u64> {
        let lower_size = open.lower.metadata()?.len();
        Ok(if open.mode.biased() {
            io::apparent_size(lower_size)
        } else {
            lower_size
        })
    }

    pub fn truncate(&self, open: &OpenFile, new_size: u64) -> FsResult<()> {
        let old_size = self.size_of(open)?;
        io::truncate_transformed(
            &self.bus,
            &open.caller,
            open.mode,
            &open.lower,
            old_size,
            new_size,
        )
    }

    /// Path-based truncate for setattr without an open handle.
    pub fn truncate_path(&self, rel: &Path, new_size: u64, caller: Caller) -> FsResult<()> {
        let open = self.open(rel, libc::O_RDWR, caller)?;
        let result = self.truncate(&open, new_size);
        let release = self.release(open);
        result.and(release)
    }

    /// Close one open. The last close of an inode flushes the lower file
    /// and emits RELEASE before dropping the shared handle.
    pub fn release(&self, open: OpenFile) -> FsResult<()> {
        if open.daemon_open {
            return Ok(());
        }
        let path = self.mount_path_bytes(&open.inode.rel_path);
        let file_id = open.inode.file_id;
        let caller = open.caller;
        open.inode.put_lower_file(|_lower| {
            match self
                .bus
                .roundtrip(|msg_id| encode_release_request(msg_id, &caller, file_id, &path))
            {
                Ok(reply) => {
                    if let Ok(view) = decode_reply(&reply) {
                        if let ReplyBody::Code { error_code } = view.body {
                            if error_code < 0 {
                                warn!(file_id, error_code, "daemon failed the release");
                            }
                        }
                    }
                }
                Err(FsError::NoDaemon) => {}
                Err(err) => warn!(file_id, %err, "release round trip failed"),
            }
            Ok(())
        })
    }

    /// Report the size the caller should see for `rel`, re-asking the
    /// daemon for decrypt-marked files. A file counts as decrypt-marked
    /// when a DECRYPT open already flagged its inode or when the lower
    /// file carries the ciphertext header magic, so a cold stat of an
    /// encrypted file reports the apparent size too.
    pub fn apparent_size_of_path(&self, rel: &Path, caller: &Caller) -> FsResult<u64> {
        let meta = std::fs::metadata(self.lower_path(rel)).map_err(map_lookup)?;
        let lower_size = meta.len();
        if !meta.is_file() || self.bus.gate().is_daemon_caller(caller.pid) {
            return Ok(lower_size);
        }
        if !self.bus.gate().connected() {
            return Ok(lower_size);
        }
        let marked = self
            .inodes
            .lookup(meta.ino())
            .map(|state| state.is_decrypt_marked())
            .unwrap_or(false)
            || self.lower_has_cipher_header(rel);
        if !marked {
            return Ok(lower_size);
        }

        let path = self.mount_path_bytes(rel);
        let reply = match self
            .bus
            .roundtrip(|msg_id| encode_open_request(msg_id, caller, meta.ino(), &path))
        {
            Ok(reply) => reply,
            Err(FsError::NoDaemon | FsError::Timeout | FsError::NoReply) => {
                return Ok(lower_size)
            }
            Err(err) => return Err(err),
        };
        match decode_reply(&reply) {
            Ok(view) => match view.body {
                ReplyBody::Code { error_code }
                    if AccessVerdict::from_code(error_code) == AccessVerdict::Decrypt =>
                {
                    Ok(io::apparent_size(lower_size))
                }
                _ => Ok(lower_size),
            },
            Err(err) => {
                warn!(path = %rel.display(), %err, "dropping malformed size reply");
                Ok(lower_size)
            }
        }
    }

    fn lower_has_cipher_header(&self, rel: &Path) -> bool {
        match File::open(self.lower_path(rel)) {
            Ok(file) => io::has_cipher_header(&file).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Drop the inode state once nothing holds it open, telling the daemon
    /// with a one-way CLEANUP. Late or missing daemons are fine.
    pub fn evict(&self, file_id: u64, caller: &Caller) {
        if let Some(_state) = self.inodes.evict(file_id) {
            match self
                .bus
                .notify(|msg_id| encode_cleanup(msg_id, caller, file_id))
            {
                Ok(()) | Err(FsError::NoDaemon) => {}
                Err(err) => warn!(file_id, %err, "cleanup notice failed"),
            }
        }
    }
}

fn open_lower(path: &Path, flags: i32) -> FsResult<File> {
    let wants_write = flags & libc::O_ACCMODE != libc::O_RDONLY;
    // The handle is shared by every open of the inode, so prefer a
    // read-write handle and fall back when the file itself is read-only.
    match File::options().read(true).write(true).open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied && !wants_write => {
            Ok(File::open(path)?)
        }
        Err(err) => Err(map_lookup(err)),
    }
}

fn map_lookup(err: std::io::Error) -> FsError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound
    } else {
        FsError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fs_at(dir: &tempfile::TempDir) -> TeadFs {
        let lower = dir.path().join("lower");
        std::fs::create_dir_all(&lower).unwrap();
        TeadFs::new(FsConfig::new(lower, "/mnt/tead"))
    }

    fn caller() -> Caller {
        Caller::new(321, 1000, 1000)
    }

    #[test]
    fn no_daemon_means_pass_through() {
        let dir = tempdir().unwrap();
        let fs = fs_at(&dir);
        std::fs::write(fs.lower_path(Path::new("a.txt")), b"contents").unwrap();

        let open = fs.open(Path::new("a.txt"), libc::O_RDWR, caller()).unwrap();
        assert_eq!(open.mode, AccessMode::Init);
        assert_eq!(fs.read(&open, 0, 8).unwrap(), b"contents");
        fs.write(&open, 0, b"C").unwrap();
        assert_eq!(fs.size_of(&open).unwrap(), 8);
        fs.release(open).unwrap();

        assert_eq!(
            std::fs::read(fs.lower_path(Path::new("a.txt"))).unwrap(),
            b"Contents"
        );
    }

    #[test]
    fn open_of_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let fs = fs_at(&dir);
        assert!(matches!(
            fs.open(Path::new("nope"), libc::O_RDONLY, caller()),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn create_then_reopen_shares_the_inode_entry() {
        let dir = tempdir().unwrap();
        let fs = fs_at(&dir);

        let first = fs
            .create(Path::new("new.txt"), libc::O_WRONLY, 0o644, caller())
            .unwrap();
        let second = fs.open(Path::new("new.txt"), libc::O_RDONLY, caller()).unwrap();
        assert!(Arc::ptr_eq(&first.inode, &second.inode));
        assert_eq!(first.inode.open_count(), 2);

        let file_id = first.file_id();
        fs.release(first).unwrap();
        fs.release(second).unwrap();
        fs.evict(file_id, &caller());
        assert!(fs.inodes.is_empty());
    }

    #[test]
    fn truncate_path_without_handle() {
        let dir = tempdir().unwrap();
        let fs = fs_at(&dir);
        std::fs::write(fs.lower_path(Path::new("t.txt")), b"0123456789").unwrap();

        fs.truncate_path(Path::new("t.txt"), 4, caller()).unwrap();
        assert_eq!(std::fs::read(fs.lower_path(Path::new("t.txt"))).unwrap(), b"0123");
    }

    #[test]
    fn getattr_without_mark_reports_lower_size() {
        let dir = tempdir().unwrap();
        let fs = fs_at(&dir);
        std::fs::write(fs.lower_path(Path::new("a")), vec![0u8; 300]).unwrap();
        let size = fs
            .apparent_size_of_path(Path::new("a"), &caller())
            .unwrap();
        assert_eq!(size, 300);
    }
}
