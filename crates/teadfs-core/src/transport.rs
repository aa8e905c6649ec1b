// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Control-socket transport
//!
//! The policy daemon attaches over a Unix socket. Exactly one attachment is
//! live at a time; a second connection is refused while the first holds the
//! slot. Packets from the daemon are demultiplexed by a reader thread:
//! daemon-initiated HELLO/CLOSE drive the presence gate, everything else is
//! a response echoing a host request header and is routed to the pending
//! waiter by message id.

use crate::engine::{RequestEngine, Transport};
use crate::error::{FsError, FsResult};
use crate::gate::DaemonGate;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use teadfs_proto::{
    decode_request, read_packet, write_packet, Initiator, RequestBody,
};
use tracing::{debug, info, warn};

/// Write half of one daemon attachment.
pub struct DaemonLink {
    stream: Mutex<UnixStream>,
}

impl DaemonLink {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }
}

impl Transport for DaemonLink {
    fn send(&self, packet: &[u8]) -> FsResult<()> {
        let mut stream = self.stream.lock().unwrap();
        write_packet(&mut *stream, packet)?;
        Ok(())
    }
}

/// Message bus between the mount host and the (at most one) policy daemon.
pub struct Bus {
    gate: DaemonGate,
    engine: RequestEngine,
    link: RwLock<Option<Arc<DaemonLink>>>,
}

impl Bus {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            gate: DaemonGate::new(),
            engine: RequestEngine::new(request_timeout),
            link: RwLock::new(None),
        }
    }

    pub fn gate(&self) -> &DaemonGate {
        &self.gate
    }

    /// Claim the daemon slot for `stream` and start its reader thread.
    /// Fails with `Busy` while another daemon is attached.
    pub fn attach_stream(self: &Arc<Self>, stream: UnixStream) -> FsResult<()> {
        self.gate.attach()?;
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                self.gate.detach();
                return Err(err.into());
            }
        };
        let link = Arc::new(DaemonLink::new(stream));
        *self.link.write().unwrap() = Some(Arc::clone(&link));
        info!("policy daemon attached");

        let bus = Arc::clone(self);
        thread::Builder::new()
            .name("teadfs-bus-reader".into())
            .spawn(move || bus.reader_loop(reader, link))
            .map_err(FsError::Io)?;
        Ok(())
    }

    /// Tear down the current attachment: clear the gate, drop the link and
    /// wake every pending waiter with `NoReply`.
    pub fn detach(&self) {
        let link = self.link.read().unwrap().clone();
        if let Some(link) = link {
            self.detach_link(&link);
        }
    }

    /// Tear down one specific attachment. A reader whose attachment was
    /// already replaced by a newer daemon must not touch the successor, so
    /// this acts only while `link` still holds the slot.
    fn detach_link(&self, link: &Arc<DaemonLink>) {
        {
            let mut slot = self.link.write().unwrap();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, link) => *slot = None,
                _ => return,
            }
        }
        let _ = link.stream.lock().unwrap().shutdown(Shutdown::Both);
        if self.gate.detach().is_some() {
            info!("policy daemon detached");
        }
        self.engine.fail_all_pending();
    }

    fn is_current(&self, link: &Arc<DaemonLink>) -> bool {
        matches!(
            self.link.read().unwrap().as_ref(),
            Some(current) if Arc::ptr_eq(current, link)
        )
    }

    /// One host-to-daemon round trip. `build` receives the allocated
    /// message id and returns the encoded packet.
    pub fn roundtrip(&self, build: impl FnOnce(u64) -> Vec<u8>) -> FsResult<Vec<u8>> {
        let link = self.current_link()?;
        let msg_id = self.engine.next_msg_id();
        let packet = build(msg_id);
        self.engine.request(link.as_ref(), msg_id, &packet)
    }

    /// One-way notification. No pending record is linked and no response
    /// is expected.
    pub fn notify(&self, build: impl FnOnce(u64) -> Vec<u8>) -> FsResult<()> {
        let link = self.current_link()?;
        let msg_id = self.engine.next_msg_id();
        link.send(&build(msg_id))
    }

    fn current_link(&self) -> FsResult<Arc<DaemonLink>> {
        self.link
            .read()
            .unwrap()
            .clone()
            .ok_or(FsError::NoDaemon)
    }

    fn reader_loop(self: Arc<Self>, mut reader: UnixStream, link: Arc<DaemonLink>) {
        loop {
            match read_packet(&mut reader) {
                Ok(Some(packet)) => {
                    if !self.dispatch(packet, &link) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("daemon socket closed");
                    break;
                }
                Err(err) => {
                    warn!(%err, "daemon socket read failed");
                    break;
                }
            }
        }
        self.detach_link(&link);
    }

    /// Route one inbound packet. Daemon-initiated messages drive the gate;
    /// everything else echoes a host request header and wakes its waiter.
    /// Malformed packets are logged and dropped. Returns `false` once the
    /// attachment this reader serves has ended.
    fn dispatch(&self, packet: Vec<u8>, link: &Arc<DaemonLink>) -> bool {
        let header = match teadfs_proto::decode_header(&packet) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "dropping malformed packet");
                return true;
            }
        };

        if header.initiator == Initiator::Daemon {
            let view = match decode_request(&packet) {
                Ok(view) => view,
                Err(err) => {
                    warn!(%err, "dropping malformed daemon message");
                    return true;
                }
            };
            match view.body {
                RequestBody::Hello { pid } => {
                    if self.is_current(link) {
                        info!(pid, "daemon announced itself");
                        self.gate.set_client_pid(pid);
                    }
                }
                RequestBody::Close => {
                    info!("daemon requested detach");
                    self.detach_link(link);
                    return false;
                }
                other => {
                    warn!(body = ?other, "unexpected daemon-initiated message");
                }
            }
            return true;
        }

        self.engine.complete(header.msg_id, packet);
        true
    }
}

/// Bind the control socket and hand each accepted connection to the bus.
/// Connections refused by the gate are dropped immediately; the rejected
/// daemon observes EOF.
pub fn spawn_control_server(path: &Path, bus: Arc<Bus>) -> io::Result<thread::JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "control socket listening");

    thread::Builder::new()
        .name("teadfs-control".into())
        .spawn(move || {
            for connection in listener.incoming() {
                match connection {
                    Ok(stream) => {
                        if let Err(err) = bus.attach_stream(stream) {
                            warn!(%err, "refusing daemon connection");
                        }
                    }
                    Err(err) => {
                        warn!(%err, "control socket accept failed");
                        break;
                    }
                }
            }
        })
}
