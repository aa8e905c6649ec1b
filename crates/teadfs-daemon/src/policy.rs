// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reference policy
//!
//! Path-prefix rules decide the verdict; a single-byte XOR stream stands in
//! for the cipher. Files under a protected prefix are encrypted in place
//! when their last reference closes, and opened as DECRYPT once they carry
//! the ciphertext header. Callers on the raw-access list get the ENCRYPT
//! view so backup tooling can copy ciphertext verbatim.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use teadfs_client::PolicyHandler;
use teadfs_proto::{AccessVerdict, Caller, CIPHER_HEADER_SIZE, TEAD_MAGIC};
use tracing::{info, warn};

fn default_key() -> u8 {
    0x5a
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Control socket of the mount host.
    pub control_socket: PathBuf,
    /// Mount point the host reports paths under.
    pub mount_point: PathBuf,
    /// Lower directory backing the mount; used to inspect and rewrite
    /// ciphertext files directly.
    pub lower_root: PathBuf,
    /// Paths (mount-absolute) whose files are transparently encrypted.
    #[serde(default)]
    pub protect: Vec<PathBuf>,
    /// Paths (mount-absolute) nobody may open.
    #[serde(default)]
    pub deny: Vec<PathBuf>,
    /// Uids that see raw ciphertext instead of plaintext.
    #[serde(default)]
    pub raw_access_uids: Vec<u32>,
    /// XOR key byte of the toy cipher.
    #[serde(default = "default_key")]
    pub key: u8,
}

pub struct XorPolicy {
    config: PolicyConfig,
}

impl XorPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.config.key).collect()
    }

    /// Map a mount-absolute path onto the lower tree.
    fn lower_path(&self, mount_path: &Path) -> Option<PathBuf> {
        mount_path
            .strip_prefix(&self.config.mount_point)
            .ok()
            .map(|rel| self.config.lower_root.join(rel))
    }

    fn under_any(path: &Path, prefixes: &[PathBuf]) -> bool {
        prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    fn is_ciphertext(&self, mount_path: &Path) -> bool {
        let Some(lower) = self.lower_path(mount_path) else {
            return false;
        };
        let mut magic = [0u8; 4];
        match fs::File::open(&lower).and_then(|file| {
            use std::os::unix::fs::FileExt;
            file.read_exact_at(&mut magic, 0)
        }) {
            Ok(()) => u32::from_le_bytes(magic) == TEAD_MAGIC,
            Err(_) => false,
        }
    }

    /// Replace the lower file with `{header, xor(plaintext)}`. Writes to a
    /// sibling temp file and renames, so readers never see a half-written
    /// ciphertext.
    fn encrypt_in_place(&self, mount_path: &Path) -> io::Result<()> {
        let lower = self
            .lower_path(mount_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path outside mount"))?;
        let plain = fs::read(&lower)?;
        if plain.len() >= 4 && plain[..4] == TEAD_MAGIC.to_le_bytes() {
            return Ok(());
        }

        let mut out = vec![0u8; CIPHER_HEADER_SIZE as usize];
        out[..4].copy_from_slice(&TEAD_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.xor(&plain));

        let tmp = lower.with_extension("teadtmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, &lower)?;
        info!(path = %mount_path.display(), bytes = plain.len(), "encrypted on close");
        Ok(())
    }
}

impl PolicyHandler for XorPolicy {
    fn open(&mut self, caller: &Caller, _file_id: u64, path: &Path) -> AccessVerdict {
        if Self::under_any(path, &self.config.deny) {
            return AccessVerdict::Prohibit;
        }
        if !Self::under_any(path, &self.config.protect) {
            return AccessVerdict::Init;
        }
        if !self.is_ciphertext(path) {
            // Not yet encrypted; pass through until the close-time rewrite.
            return AccessVerdict::Init;
        }
        if self.config.raw_access_uids.contains(&caller.uid) {
            AccessVerdict::Encrypt
        } else {
            AccessVerdict::Decrypt
        }
    }

    fn release(&mut self, _caller: &Caller, _file_id: u64, path: &Path) -> i32 {
        if !Self::under_any(path, &self.config.protect) || Self::under_any(path, &self.config.deny)
        {
            return 0;
        }
        match self.encrypt_in_place(path) {
            Ok(()) => 0,
            Err(err) => {
                warn!(path = %path.display(), %err, "close-time encryption failed");
                -err.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }

    fn read(&mut self, _caller: &Caller, _offset: u64, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        Ok(self.xor(ciphertext))
    }

    fn write(&mut self, _caller: &Caller, _offset: u64, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        Ok(self.xor(plaintext))
    }

    fn cleanup(&mut self, _caller: &Caller, file_id: u64) {
        tracing::debug!(file_id, "inode evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_at(dir: &tempfile::TempDir) -> PolicyConfig {
        PolicyConfig {
            control_socket: dir.path().join("control.sock"),
            mount_point: PathBuf::from("/mnt/tead"),
            lower_root: dir.path().join("lower"),
            protect: vec![PathBuf::from("/mnt/tead/vault")],
            deny: vec![PathBuf::from("/mnt/tead/vault/secret")],
            raw_access_uids: vec![34],
            key: 0x5a,
        }
    }

    fn caller(uid: u32) -> Caller {
        Caller::new(10, uid, uid)
    }

    #[test]
    fn deny_prefix_wins_over_protect() {
        let dir = tempdir().unwrap();
        let mut policy = XorPolicy::new(config_at(&dir));
        assert_eq!(
            policy.open(&caller(1000), 1, Path::new("/mnt/tead/vault/secret/key")),
            AccessVerdict::Prohibit
        );
        assert_eq!(
            policy.open(&caller(1000), 1, Path::new("/mnt/tead/public.txt")),
            AccessVerdict::Init
        );
    }

    #[test]
    fn protected_plain_file_passes_until_encrypted() {
        let dir = tempdir().unwrap();
        let config = config_at(&dir);
        fs::create_dir_all(config.lower_root.join("vault")).unwrap();
        fs::write(config.lower_root.join("vault/a.txt"), b"plain").unwrap();
        let mut policy = XorPolicy::new(config);

        let path = Path::new("/mnt/tead/vault/a.txt");
        assert_eq!(policy.open(&caller(1000), 1, path), AccessVerdict::Init);

        assert_eq!(policy.release(&caller(1000), 1, path), 0);
        assert_eq!(policy.open(&caller(1000), 1, path), AccessVerdict::Decrypt);
        assert_eq!(policy.open(&caller(34), 1, path), AccessVerdict::Encrypt);
    }

    #[test]
    fn release_rewrite_is_header_plus_xor_and_idempotent() {
        let dir = tempdir().unwrap();
        let config = config_at(&dir);
        fs::create_dir_all(config.lower_root.join("vault")).unwrap();
        let lower = config.lower_root.join("vault/a.txt");
        fs::write(&lower, b"attack at dawn").unwrap();
        let mut policy = XorPolicy::new(config);

        let path = Path::new("/mnt/tead/vault/a.txt");
        assert_eq!(policy.release(&caller(1000), 1, path), 0);

        let bytes = fs::read(&lower).unwrap();
        assert_eq!(bytes.len() as u64, CIPHER_HEADER_SIZE + 14);
        assert_eq!(&bytes[..4], &TEAD_MAGIC.to_le_bytes());
        let tail: Vec<u8> = bytes[CIPHER_HEADER_SIZE as usize..]
            .iter()
            .map(|b| b ^ 0x5a)
            .collect();
        assert_eq!(tail, b"attack at dawn");

        // A second release must not double-encrypt.
        assert_eq!(policy.release(&caller(1000), 1, path), 0);
        assert_eq!(fs::read(&lower).unwrap(), bytes);
    }

    #[test]
    fn transforms_are_symmetric() {
        let dir = tempdir().unwrap();
        let mut policy = XorPolicy::new(config_at(&dir));
        let cipher = policy.write(&caller(1), 0, b"payload").unwrap();
        assert_ne!(cipher, b"payload");
        assert_eq!(policy.read(&caller(1), 0, &cipher).unwrap(), b"payload");
    }
}
