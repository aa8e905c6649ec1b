// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request engine
//!
//! Correlates host-initiated requests with daemon responses by message id.
//! A requesting thread links a pending record, sends, then sleeps on the
//! record's condvar until the matching response arrives, the timeout
//! elapses, or the daemon detaches. The pending-list mutex is held only for
//! link/unlink; the per-record mutex orders the response write against the
//! waiter's wake, so a waiter can only ever observe the response whose
//! msg id matches its own.

use crate::error::{FsError, FsResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outgoing-packet seam between the engine and the control socket.
/// The tests drive the engine through a mock of this trait.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn send(&self, packet: &[u8]) -> FsResult<()>;
}

#[derive(Debug)]
enum PendingState {
    Pending,
    /// Response payload, or empty after a local timeout marked the record
    /// done so that a late response gets dropped.
    Done(Vec<u8>),
    NoReply,
}

/// One kernel-initiated request awaiting its response.
struct PendingRequest {
    msg_id: u64,
    state: Mutex<PendingState>,
    wait: Condvar,
}

impl PendingRequest {
    fn new(msg_id: u64) -> Self {
        Self {
            msg_id,
            state: Mutex::new(PendingState::Pending),
            wait: Condvar::new(),
        }
    }

    /// Deliver a response. Returns false if the waiter already gave up,
    /// in which case the payload is dropped.
    fn fulfill(&self, response: Vec<u8>) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            PendingState::Pending => {
                *state = PendingState::Done(response);
                self.wait.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Wake the waiter without a response (daemon detach).
    fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, PendingState::Pending) {
            *state = PendingState::NoReply;
            self.wait.notify_one();
        }
    }

    fn wait_answer(&self, timeout: Duration) -> FsResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while matches!(*state, PendingState::Pending) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Mark done so a late response is dropped, not delivered.
                *state = PendingState::Done(Vec::new());
                return Err(FsError::Timeout);
            }
            let (guard, _) = self.wait.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
        match std::mem::replace(&mut *state, PendingState::Done(Vec::new())) {
            PendingState::Done(response) => Ok(response),
            PendingState::NoReply => Err(FsError::NoReply),
            PendingState::Pending => unreachable!(),
        }
    }
}

pub struct RequestEngine {
    pending: Mutex<HashMap<u64, Arc<PendingRequest>>>,
    next_msg_id: AtomicU64,
    timeout: Duration,
}

impl RequestEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            // 0 is reserved; the counter starts past it.
            next_msg_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Allocate the next message id. Unique for the lifetime of an
    /// attachment; wraps around to 1, never returning 0.
    pub fn next_msg_id(&self) -> u64 {
        loop {
            let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send `packet` and block until the matching response, the timeout,
    /// or a detach. The caller owns the returned buffer.
    pub fn request(&self, transport: &dyn Transport, msg_id: u64, packet: &[u8]) -> FsResult<Vec<u8>> {
        let record = Arc::new(PendingRequest::new(msg_id));
        self.pending.lock().unwrap().insert(msg_id, Arc::clone(&record));

        if let Err(err) = transport.send(packet) {
            self.pending.lock().unwrap().remove(&msg_id);
            return Err(err);
        }

        let result = record.wait_answer(self.timeout);
        self.pending.lock().unwrap().remove(&msg_id);
        if let Err(ref err) = result {
            debug!(msg_id, %err, "request finished without a response");
        }
        result
    }

    /// Route a response to its waiter. Unmatched responses are dropped
    /// silently per the wire contract.
    pub fn complete(&self, msg_id: u64, response: Vec<u8>) {
        let record = self.pending.lock().unwrap().get(&msg_id).cloned();
        match record {
            Some(record) => {
                debug_assert_eq!(record.msg_id, msg_id);
                if !record.fulfill(response) {
                    debug!(msg_id, "response arrived after the waiter gave up");
                }
            }
            None => {
                debug!(msg_id, "dropping response with no pending request");
            }
        }
    }

    /// Wake every pending waiter with `NoReply`. Called on daemon detach.
    pub fn fail_all_pending(&self) {
        let records: Vec<_> = self.pending.lock().unwrap().values().cloned().collect();
        if !records.is_empty() {
            warn!(count = records.len(), "failing pending requests after detach");
        }
        for record in records {
            record.abort();
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    /// Test transport capturing sent packets on a channel, for the tests
    /// that need real cross-thread wakeups.
    struct ChannelTransport {
        tx: Mutex<mpsc::Sender<Vec<u8>>>,
    }

    impl Transport for ChannelTransport {
        fn send(&self, packet: &[u8]) -> FsResult<()> {
            self.tx.lock().unwrap().send(packet.to_vec()).unwrap();
            Ok(())
        }
    }

    fn channel_transport() -> (Arc<ChannelTransport>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelTransport { tx: Mutex::new(tx) }), rx)
    }

    #[test]
    fn msg_ids_are_monotonic_and_skip_zero() {
        let engine = RequestEngine::new(Duration::from_secs(1));
        let first = engine.next_msg_id();
        let second = engine.next_msg_id();
        assert!(second > first);
        assert_ne!(first, 0);

        // Force the wrap: the counter re-rolls past 0.
        engine.next_msg_id.store(u64::MAX, Ordering::Relaxed);
        let wrapped = engine.next_msg_id();
        assert_eq!(wrapped, u64::MAX);
        let after_wrap = engine.next_msg_id();
        assert_eq!(after_wrap, 1);
    }

    #[test]
    fn waiter_receives_matching_response() {
        let engine = Arc::new(RequestEngine::new(Duration::from_secs(5)));
        let (transport, rx) = channel_transport();

        let engine_clone = Arc::clone(&engine);
        let responder = thread::spawn(move || {
            let _sent = rx.recv().unwrap();
            // A response for some other id must not wake the waiter.
            engine_clone.complete(999, b"wrong".to_vec());
            engine_clone.complete(7, b"right".to_vec());
        });

        let response = engine.request(transport.as_ref(), 7, b"req").unwrap();
        assert_eq!(response, b"right");
        responder.join().unwrap();
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn timeout_unlinks_and_drops_late_response() {
        let engine = Arc::new(RequestEngine::new(Duration::from_millis(50)));
        let (transport, _rx) = channel_transport();

        let msg_id = engine.next_msg_id();
        let err = engine.request(transport.as_ref(), msg_id, b"req").unwrap_err();
        assert!(matches!(err, FsError::Timeout));
        assert_eq!(engine.pending_len(), 0);

        // Late response for the timed-out id is dropped silently.
        engine.complete(msg_id, b"late".to_vec());
    }

    #[test]
    fn send_failure_unlinks_immediately() {
        let engine = RequestEngine::new(Duration::from_secs(5));
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(FsError::NoDaemon));
        let err = engine.request(&transport, 1, b"req").unwrap_err();
        assert!(matches!(err, FsError::NoDaemon));
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn detach_wakes_all_waiters_with_no_reply() {
        let engine = Arc::new(RequestEngine::new(Duration::from_secs(10)));
        let (transport, rx) = channel_transport();

        let mut waiters = Vec::new();
        for msg_id in 1..=3u64 {
            let engine = Arc::clone(&engine);
            let transport = Arc::clone(&transport);
            waiters.push(thread::spawn(move || {
                engine.request(transport.as_ref(), msg_id, b"req")
            }));
        }
        for _ in 0..3 {
            rx.recv().unwrap();
        }

        engine.fail_all_pending();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(FsError::NoReply)));
        }
    }

    #[test]
    fn concurrent_requests_never_share_an_id() {
        let engine = Arc::new(RequestEngine::new(Duration::from_secs(1)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| engine.next_msg_id()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
        assert!(!all.contains(&0));
    }
}
