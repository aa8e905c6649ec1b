// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TEADFS wire protocol — packet layout, codec and framing
//!
//! Every exchange between the mount host and the policy daemon is a single
//! contiguous buffer: a packed little-endian header, a typed body, and any
//! variable-length blobs referenced by `(offset, size)` pairs relative to
//! the start of the buffer. This crate owns that layout; the host and the
//! daemon side both build and parse packets exclusively through it.

pub mod codec;
pub mod framing;
pub mod messages;

pub use codec::{
    decode_header, decode_reply, decode_request, encode_cleanup, encode_close, encode_code_reply,
    encode_data_reply, encode_hello, encode_open_request, encode_read_request,
    encode_release_request, encode_verdict_reply, encode_write_request, PacketView, ReplyBody,
    ReplyView, RequestBody, WireError,
};
pub use framing::{read_packet, write_packet, MAX_PACKET_SIZE};
pub use messages::{
    AccessVerdict, Caller, Header, Initiator, MessageType, CIPHER_HEADER_SIZE, HEADER_SIZE,
    TEAD_MAGIC,
};
