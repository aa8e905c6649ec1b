// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon-side client for the TEADFS control socket
//!
//! A policy daemon links this crate, implements [`PolicyHandler`] and calls
//! [`PolicyClient::serve`]. The client owns the socket protocol: it sends
//! HELLO with the daemon's pid right after connecting, answers every host
//! request through the handler, preserves the request header in each reply
//! so correlation fields line up, and sends CLOSE on orderly shutdown.

use anyhow::{bail, Context, Result};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use teadfs_proto::{
    decode_request, encode_close, encode_code_reply, encode_data_reply, encode_hello,
    encode_verdict_reply, read_packet, write_packet, AccessVerdict, Caller, Header, RequestBody,
};
use tracing::{debug, info, warn};

/// Policy and transform callbacks, one per host request type.
///
/// `read` gets ciphertext and returns plaintext; `write` is the inverse.
/// An `Err` from either is reported to the host as a negative errno and
/// the serve loop keeps running.
///
/// Handlers run while the host blocks inside the originating round trip
/// and the host serves its mount on a single session. A handler that
/// touches a file through the mount therefore deadlocks until the host
/// times the request out. Handlers must operate on the lower tree
/// directly, the way the reference policy does with its `lower_root`.
pub trait PolicyHandler: Send {
    fn open(&mut self, caller: &Caller, file_id: u64, path: &Path) -> AccessVerdict;

    /// Last reference to `file_id` closed; the lower file is fully flushed.
    /// Return 0 for success or a negative errno.
    fn release(&mut self, caller: &Caller, file_id: u64, path: &Path) -> i32;

    fn read(&mut self, caller: &Caller, offset: u64, ciphertext: &[u8]) -> io::Result<Vec<u8>>;

    fn write(&mut self, caller: &Caller, offset: u64, plaintext: &[u8]) -> io::Result<Vec<u8>>;

    /// One-way eviction notice. Must not produce a reply.
    fn cleanup(&mut self, _caller: &Caller, _file_id: u64) {}
}

pub struct PolicyClient {
    stream: UnixStream,
    msg_id: AtomicU64,
}

impl PolicyClient {
    /// Connect to the mount host's control socket and announce ourselves.
    /// Fails if another daemon already holds the slot (the host drops the
    /// connection, which we observe as an EOF on the first read).
    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("connecting to control socket {}", socket.display()))?;
        let client = Self {
            stream,
            msg_id: AtomicU64::new(1),
        };
        let caller = Caller::current();
        let hello = encode_hello(client.next_msg_id(), &caller, caller.pid);
        client.send(&hello).context("sending hello")?;
        info!(pid = caller.pid, "attached to mount host");
        Ok(client)
    }

    fn next_msg_id(&self) -> u64 {
        let id = self.msg_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.msg_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        let mut stream = &self.stream;
        write_packet(&mut stream, packet)
    }

    /// Serve host requests until the socket closes. Malformed packets are
    /// logged and skipped; handler transform errors are reported to the
    /// host without ending the loop.
    pub fn serve(&mut self, handler: &mut dyn PolicyHandler) -> Result<()> {
        loop {
            let packet = {
                let mut stream = &self.stream;
                match read_packet(&mut stream) {
                    Ok(Some(packet)) => packet,
                    Ok(None) => {
                        info!("mount host closed the control socket");
                        return Ok(());
                    }
                    Err(err) => return Err(err).context("reading control socket"),
                }
            };
            let view = match decode_request(&packet) {
                Ok(view) => view,
                Err(err) => {
                    warn!(%err, "skipping malformed host packet");
                    continue;
                }
            };
            let caller = view.header.caller();
            if let Some(reply) = self.handle(handler, &view.header, &view.body, &caller)? {
                self.send(&reply).context("sending reply")?;
            }
        }
    }

    fn handle(
        &self,
        handler: &mut dyn PolicyHandler,
        header: &Header,
        body: &RequestBody<'_>,
        caller: &Caller,
    ) -> Result<Option<Vec<u8>>> {
        let reply = match body {
            RequestBody::Open { file_id, file_path } => {
                let path = blob_path(file_path);
                let verdict = handler.open(caller, *file_id, path);
                debug!(file_id, path = %path.display(), ?verdict, "open");
                Some(encode_verdict_reply(header, verdict))
            }
            RequestBody::Release { file_id, file_path } => {
                let path = blob_path(file_path);
                let code = handler.release(caller, *file_id, path);
                debug!(file_id, path = %path.display(), code, "release");
                Some(encode_code_reply(header, code))
            }
            RequestBody::Read { offset, data, .. } => {
                Some(transform_reply(header, *offset, handler.read(caller, *offset, data)))
            }
            RequestBody::Write { offset, data, .. } => {
                Some(transform_reply(header, *offset, handler.write(caller, *offset, data)))
            }
            RequestBody::Cleanup { file_id } => {
                handler.cleanup(caller, *file_id);
                None
            }
            RequestBody::Hello { .. } | RequestBody::Close => {
                bail!("host sent a daemon-only message type {:?}", header.msg_type)
            }
        };
        Ok(reply)
    }

    /// Detach politely. The host clears the daemon slot without waiting
    /// for the socket to drop.
    pub fn close(self) -> Result<()> {
        let close = encode_close(self.next_msg_id(), &Caller::current());
        self.send(&close).context("sending close")?;
        Ok(())
    }
}

fn blob_path(bytes: &[u8]) -> &Path {
    Path::new(std::ffi::OsStr::from_bytes(bytes))
}

fn transform_reply(header: &Header, offset: u64, result: io::Result<Vec<u8>>) -> Vec<u8> {
    match result {
        Ok(data) => encode_data_reply(header, data.len() as i32, offset, &data),
        Err(err) => {
            let errno = err.raw_os_error().unwrap_or(libc::EIO);
            warn!(%err, "transform failed");
            encode_data_reply(header, -errno, offset, &[])
        }
    }
}
