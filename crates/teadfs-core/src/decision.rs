// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Access decision state machine
//!
//! Every open of a regular file by a non-daemon caller carries one of three
//! modes for its whole lifetime. `Init` is a pass-through of the lower
//! file. `Encrypt` exposes the raw ciphertext bytes read-only. `Decrypt`
//! installs the plaintext view: offsets are biased past the ciphertext
//! header and every read/write is transformed by the daemon. A `Prohibit`
//! verdict never produces an open at all.

use crate::error::{FsError, FsResult};
use teadfs_proto::AccessVerdict;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Init,
    Encrypt,
    Decrypt,
}

impl AccessMode {
    /// Turn the daemon's open verdict into the mode of the new open.
    /// `Prohibit` fails the open; unknown codes already collapsed to
    /// `Init` during decode.
    pub fn from_verdict(verdict: AccessVerdict) -> FsResult<Self> {
        match verdict {
            AccessVerdict::Init => Ok(AccessMode::Init),
            AccessVerdict::Prohibit => Err(FsError::AccessDenied),
            AccessVerdict::Encrypt => Ok(AccessMode::Encrypt),
            AccessVerdict::Decrypt => Ok(AccessMode::Decrypt),
        }
    }

    /// Encrypt-mode opens reject every write.
    pub fn check_write(&self) -> FsResult<()> {
        match self {
            AccessMode::Encrypt => Err(FsError::Readonly),
            _ => Ok(()),
        }
    }

    /// Whether lower-file offsets are biased past the ciphertext header.
    pub fn biased(&self) -> bool {
        matches!(self, AccessMode::Decrypt)
    }
}

/// Rewrite a write-only open to read-write. The plaintext view has to read
/// back ciphertext pages to apply partial writes, so a pure write handle on
/// the lower file is never sufficient.
pub fn normalize_flags(flags: i32) -> i32 {
    if flags & libc::O_ACCMODE == libc::O_WRONLY {
        (flags & !libc::O_ACCMODE) | libc::O_RDWR
    } else {
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prohibit_denies_the_open() {
        assert!(matches!(
            AccessMode::from_verdict(AccessVerdict::Prohibit),
            Err(FsError::AccessDenied)
        ));
    }

    #[test]
    fn encrypt_rejects_writes_only() {
        assert!(matches!(
            AccessMode::Encrypt.check_write(),
            Err(FsError::Readonly)
        ));
        AccessMode::Init.check_write().unwrap();
        AccessMode::Decrypt.check_write().unwrap();
    }

    #[test]
    fn only_decrypt_biases_offsets() {
        assert!(AccessMode::Decrypt.biased());
        assert!(!AccessMode::Init.biased());
        assert!(!AccessMode::Encrypt.biased());
    }

    #[test]
    fn write_only_becomes_read_write() {
        let flags = normalize_flags(libc::O_WRONLY | libc::O_APPEND);
        assert_eq!(flags & libc::O_ACCMODE, libc::O_RDWR);
        assert_ne!(flags & libc::O_APPEND, 0);

        assert_eq!(normalize_flags(libc::O_RDONLY), libc::O_RDONLY);
        assert_eq!(normalize_flags(libc::O_RDWR), libc::O_RDWR);
    }
}
