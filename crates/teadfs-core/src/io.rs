// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! I/O adapter
//!
//! Routes reads and writes of a decrypt-mode open through the daemon's
//! transform. Ciphertext files carry a fixed 256-byte header, so every
//! lower-file offset of the plaintext view is biased by that amount and
//! the apparent size is the lower size minus the header. Init-mode opens
//! pass straight through to the lower file.

use crate::decision::AccessMode;
use crate::error::{FsError, FsResult};
use crate::transport::Bus;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use teadfs_proto::{
    decode_reply, encode_read_request, encode_write_request, Caller, ReplyBody, CIPHER_HEADER_SIZE,
    TEAD_MAGIC,
};
use tracing::trace;

pub const PAGE_SIZE: usize = 4096;

/// Plaintext size presented for a ciphertext lower file.
pub fn apparent_size(lower_size: u64) -> u64 {
    lower_size.saturating_sub(CIPHER_HEADER_SIZE)
}

/// Whether the lower file starts with the ciphertext header magic.
pub fn has_cipher_header(lower: &File) -> FsResult<bool> {
    let mut magic = [0u8; 4];
    match lower.read_exact_at(&mut magic, 0) {
        Ok(()) => Ok(u32::from_le_bytes(magic) == TEAD_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn transform_error(code: i32) -> FsError {
    FsError::Io(io::Error::from_raw_os_error(code.unsigned_abs() as i32))
}

/// Read `size` bytes of the open's view at `offset`.
///
/// Decrypt mode reads ciphertext past the header, ships it to the daemon
/// and returns the plaintext from the reply. Other modes read the lower
/// bytes directly (encrypt-mode callers see raw ciphertext by design).
pub fn read_transformed(
    bus: &Bus,
    caller: &Caller,
    mode: AccessMode,
    lower: &File,
    offset: u64,
    size: usize,
) -> FsResult<Vec<u8>> {
    if mode != AccessMode::Decrypt {
        return Ok(read_lower(lower, offset, size)?);
    }

    let cipher = read_lower(lower, offset + CIPHER_HEADER_SIZE, size)?;
    if cipher.is_empty() {
        return Ok(cipher);
    }
    trace!(offset, len = cipher.len(), "decrypt read round trip");
    let reply = bus.roundtrip(|msg_id| encode_read_request(msg_id, caller, offset, &cipher))?;
    let view = decode_reply(&reply)?;
    match view.body {
        ReplyBody::Data { code, data, .. } => {
            if code < 0 {
                return Err(transform_error(code));
            }
            let len = (code as usize).min(data.len());
            Ok(data[..len].to_vec())
        }
        ReplyBody::Code { error_code } => Err(transform_error(error_code.min(-1))),
    }
}

/// Write the open's view at `offset`.
///
/// Decrypt mode ships the plaintext to the daemon and stores the returned
/// ciphertext past the header. Encrypt mode was already rejected by the
/// state machine; this is the last line of defence.
pub fn write_transformed(
    bus: &Bus,
    caller: &Caller,
    mode: AccessMode,
    lower: &File,
    offset: u64,
    data: &[u8],
) -> FsResult<usize> {
    mode.check_write()?;
    if mode != AccessMode::Decrypt {
        lower.write_all_at(data, offset)?;
        return Ok(data.len());
    }
    if data.is_empty() {
        return Ok(0);
    }

    trace!(offset, len = data.len(), "encrypt write round trip");
    let reply = bus.roundtrip(|msg_id| encode_write_request(msg_id, caller, offset, data))?;
    let view = decode_reply(&reply)?;
    let cipher = match view.body {
        ReplyBody::Data { code, data, .. } => {
            if code < 0 {
                return Err(transform_error(code));
            }
            data
        }
        ReplyBody::Code { error_code } => return Err(transform_error(error_code.min(-1))),
    };
    lower.write_all_at(cipher, offset + CIPHER_HEADER_SIZE)?;
    Ok(data.len())
}

/// Resize the open's view to `new_size` apparent bytes.
///
/// Growth zero-fills through the write path so the daemon turns the zeros
/// into ciphertext. Shrinking just cuts the lower file; no round trip.
pub fn truncate_transformed(
    bus: &Bus,
    caller: &Caller,
    mode: AccessMode,
    lower: &File,
    old_size: u64,
    new_size: u64,
) -> FsResult<()> {
    mode.check_write()?;
    if new_size <= old_size {
        let lower_size = if mode.biased() {
            new_size + CIPHER_HEADER_SIZE
        } else {
            new_size
        };
        lower.set_len(lower_size)?;
        return Ok(());
    }

    let zeros = [0u8; PAGE_SIZE];
    let mut at = old_size;
    while at < new_size {
        let chunk = ((new_size - at) as usize).min(PAGE_SIZE);
        write_transformed(bus, caller, mode, lower, at, &zeros[..chunk])?;
        at += chunk as u64;
    }
    Ok(())
}

fn read_lower(lower: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = lower.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
