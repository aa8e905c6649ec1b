// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the TEADFS core

use std::io;

/// Core filesystem error type.
///
/// `NoDaemon` is always recovered locally (the operation degrades to a
/// pass-through) and must never reach a VFS caller; the other kinds map to
/// errnos at the host boundary via [`FsError::errno`].
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("no daemon attached")]
    NoDaemon,
    #[error("busy")]
    Busy,
    #[error("request timed out")]
    Timeout,
    #[error("daemon detached before replying")]
    NoReply,
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] teadfs_proto::WireError),
    #[error("access denied")]
    AccessDenied,
    #[error("write to an encrypt-mode open")]
    Readonly,
    #[error("not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no memory")]
    NoMemory,
    #[error("invalid state")]
    Invalid,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Errno surfaced to VFS callers at the host boundary.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NoDaemon => libc::EIO, // recovered before reaching callers
            FsError::Busy => libc::EBUSY,
            // Open-time timeouts degrade to a pass-through and never get
            // here; a timeout on the data path is an I/O failure.
            FsError::Timeout => libc::EIO,
            FsError::NoReply => libc::EIO,
            FsError::MalformedPacket(_) => libc::EIO,
            FsError::AccessDenied => libc::EACCES,
            FsError::Readonly => libc::EROFS,
            FsError::NotFound => libc::ENOENT,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::NoMemory => libc::ENOMEM,
            FsError::Invalid => libc::EINVAL,
        }
    }
}
