// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Message types and fixed constants of the TEADFS wire protocol

/// Magic tag marking an encrypted lower file and the filesystem superblock
/// (`"TEAD"` read as a little-endian u32).
pub const TEAD_MAGIC: u32 = 0x4441_4554;

/// Fixed-size header preceding ciphertext in an encrypted lower file. The
/// first four bytes hold [`TEAD_MAGIC`]; the rest is reserved and
/// zero-initialised.
pub const CIPHER_HEADER_SIZE: u64 = 256;

/// Packed size of [`Header`] on the wire:
/// `size:u32 + msg_id:u64 + msg_type:u8 + initiator:u8 + pid:i32 + uid:u32 + gid:u32`.
pub const HEADER_SIZE: usize = 26;

/// Packet type tags. Values 1 and 2 are reserved control messages; 3 marks
/// the start of the user-defined range, mirroring the original protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Daemon announces itself after attaching (daemon-initiated).
    Hello = 1,
    /// Daemon detaches explicitly (daemon-initiated).
    Close = 2,
    /// Host asks for an access verdict on an open; reply is a CODE body.
    Open = 4,
    /// Host reports the last reference to an inode closing; reply is CODE.
    Release = 5,
    /// Ciphertext-to-plaintext transform round-trip.
    Read = 6,
    /// Plaintext-to-ciphertext transform round-trip.
    Write = 7,
    /// One-way eviction notice; no reply is ever sent.
    Cleanup = 8,
}

impl MessageType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MessageType::Hello),
            2 => Some(MessageType::Close),
            4 => Some(MessageType::Open),
            5 => Some(MessageType::Release),
            6 => Some(MessageType::Read),
            7 => Some(MessageType::Write),
            8 => Some(MessageType::Cleanup),
            _ => None,
        }
    }
}

/// Which side started the exchange. Replies carry the initiator of the
/// exchange they answer, so a daemon reply to a host request still says
/// `Host`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Initiator {
    /// The mount host (the kernel side of the original module).
    Host = 0,
    /// The attached policy daemon.
    Daemon = 1,
}

impl Initiator {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Initiator::Host),
            1 => Some(Initiator::Daemon),
            _ => None,
        }
    }
}

/// Per-open access verdict returned in the CODE reply to an OPEN request.
///
/// Any unknown code degrades to `Init` (pass-through); the state machine in
/// the core treats that the same way as a missing daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessVerdict {
    Init = 1,
    Prohibit = 2,
    Encrypt = 3,
    Decrypt = 4,
}

impl AccessVerdict {
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => AccessVerdict::Prohibit,
            3 => AccessVerdict::Encrypt,
            4 => AccessVerdict::Decrypt,
            _ => AccessVerdict::Init,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Identity of the task on whose behalf a packet is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub pid: libc::pid_t,
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn new(pid: libc::pid_t, uid: u32, gid: u32) -> Self {
        Self { pid, uid, gid }
    }

    /// Identity of the current process, used by the daemon side.
    pub fn current() -> Self {
        // Safety: these libc calls only read process-global state.
        unsafe {
            Self {
                pid: libc::getpid(),
                uid: libc::geteuid(),
                gid: libc::getegid(),
            }
        }
    }
}

/// Decoded packet header. `size` always equals the total buffer length,
/// which makes packets self-framing on a stream socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub msg_id: u64,
    pub msg_type: MessageType,
    pub initiator: Initiator,
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl Header {
    pub fn caller(&self) -> Caller {
        Caller {
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
        }
    }
}
