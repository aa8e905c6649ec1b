// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon-presence gate
//!
//! Tracks whether a policy daemon is currently attached and which pid it
//! runs as. Every caller of the request engine checks `connected()` first;
//! when no daemon is attached the VFS operation degrades to a pass-through.
//! A caller whose tgid equals the client pid is the daemon itself and
//! bypasses both the round-trips and the per-inode lock, which is what
//! keeps the daemon's own file I/O on the mount from deadlocking.

use crate::error::{FsError, FsResult};
use std::sync::RwLock;

/// Pid placeholder between control-socket attach and the HELLO message.
/// No real task has pid 0, so the reentrancy check cannot match it.
const PID_UNKNOWN: libc::pid_t = 0;

pub struct DaemonGate {
    client: RwLock<Option<libc::pid_t>>,
}

impl DaemonGate {
    pub fn new() -> Self {
        Self {
            client: RwLock::new(None),
        }
    }

    /// Claim the single daemon slot. Fails with `Busy` while another
    /// daemon is attached.
    pub fn attach(&self) -> FsResult<()> {
        let mut client = self.client.write().unwrap();
        if client.is_some() {
            return Err(FsError::Busy);
        }
        *client = Some(PID_UNKNOWN);
        Ok(())
    }

    /// Record the pid announced by HELLO.
    pub fn set_client_pid(&self, pid: libc::pid_t) {
        let mut client = self.client.write().unwrap();
        if client.is_some() {
            *client = Some(pid);
        }
    }

    /// Clear the slot; returns the previously attached pid, if any.
    pub fn detach(&self) -> Option<libc::pid_t> {
        self.client.write().unwrap().take()
    }

    pub fn connected(&self) -> bool {
        self.client.read().unwrap().is_some()
    }

    pub fn client_pid(&self) -> Option<libc::pid_t> {
        *self.client.read().unwrap()
    }

    /// Reentrancy check: is this caller the attached daemon itself?
    pub fn is_daemon_caller(&self, pid: libc::pid_t) -> bool {
        pid != PID_UNKNOWN && *self.client.read().unwrap() == Some(pid)
    }
}

impl Default for DaemonGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_attach_is_busy() {
        let gate = DaemonGate::new();
        gate.attach().unwrap();
        assert!(matches!(gate.attach(), Err(FsError::Busy)));
        gate.detach();
        gate.attach().unwrap();
    }

    #[test]
    fn reentrancy_matches_only_the_announced_pid() {
        let gate = DaemonGate::new();
        gate.attach().unwrap();
        assert!(gate.connected());
        assert!(!gate.is_daemon_caller(1234));

        gate.set_client_pid(1234);
        assert!(gate.is_daemon_caller(1234));
        assert!(!gate.is_daemon_caller(1235));

        gate.detach();
        assert!(!gate.connected());
        assert!(!gate.is_daemon_caller(1234));
    }

    #[test]
    fn pid_zero_never_counts_as_daemon() {
        let gate = DaemonGate::new();
        gate.attach().unwrap();
        assert!(!gate.is_daemon_caller(0));
    }
}
