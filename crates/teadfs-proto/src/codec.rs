// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Packet encoder/decoder
//!
//! The encoder produces one contiguous, owned buffer per packet. The decoder
//! is zero-copy: blob fields come back as slices borrowed from the input
//! buffer, and every blob reference is bounds-checked before a view is
//! handed out — `offset` must land past the typed body and `offset + size`
//! must stay inside the buffer.

use crate::messages::{AccessVerdict, Caller, Header, Initiator, MessageType, HEADER_SIZE};
use thiserror::Error;

/// Codec failure. The core maps every variant to its `MalformedPacket`
/// error kind; the variants exist for diagnostics only.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("packet truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("header size field {size} does not match buffer length {len}")]
    LengthMismatch { size: u32, len: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unknown initiator {0}")]
    UnknownInitiator(u8),
    #[error("message type {0:?} is not valid here")]
    UnexpectedType(MessageType),
    #[error("blob out of range: offset {offset} size {size} in {len}-byte packet")]
    BlobOutOfRange { offset: u32, size: u32, len: usize },
}

/// Typed body of a request as seen by its receiver.
///
/// HELLO and CLOSE arrive at the host; everything else arrives at the
/// daemon. Blob fields borrow from the packet buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestBody<'a> {
    Hello { pid: i32 },
    Close,
    Open { file_id: u64, file_path: &'a [u8] },
    Release { file_id: u64, file_path: &'a [u8] },
    Read { code: i32, offset: u64, data: &'a [u8] },
    Write { code: i32, offset: u64, data: &'a [u8] },
    Cleanup { file_id: u64 },
}

/// Typed body of a reply, discriminated by the echoed request type:
/// OPEN/RELEASE answer with `Code`, READ/WRITE answer with `Data`.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyBody<'a> {
    Code { error_code: i32 },
    Data { code: i32, offset: u64, data: &'a [u8] },
}

/// Decoded request packet; blobs borrow from the input buffer.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub header: Header,
    pub body: RequestBody<'a>,
}

/// Decoded reply packet; blobs borrow from the input buffer.
#[derive(Debug)]
pub struct ReplyView<'a> {
    pub header: Header,
    pub body: ReplyBody<'a>,
}

const HELLO_BODY: usize = 4;
const CLOSE_BODY: usize = 0;
const OPEN_BODY: usize = 16; // file_id:u64 + Blob{size:u32, offset:u32}
const DATA_BODY: usize = 20; // code:i32 + offset:u64 + Blob
const CLEANUP_BODY: usize = 8;
const CODE_BODY: usize = 4;

fn request_body_size(msg_type: MessageType) -> usize {
    match msg_type {
        MessageType::Hello => HELLO_BODY,
        MessageType::Close => CLOSE_BODY,
        MessageType::Open | MessageType::Release => OPEN_BODY,
        MessageType::Read | MessageType::Write => DATA_BODY,
        MessageType::Cleanup => CLEANUP_BODY,
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_header(
    buf: &mut Vec<u8>,
    total: usize,
    msg_id: u64,
    msg_type: MessageType,
    initiator: Initiator,
    caller: &Caller,
) {
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&msg_id.to_le_bytes());
    buf.push(msg_type as u8);
    buf.push(initiator as u8);
    buf.extend_from_slice(&(caller.pid as i32).to_le_bytes());
    buf.extend_from_slice(&caller.uid.to_le_bytes());
    buf.extend_from_slice(&caller.gid.to_le_bytes());
}

fn put_blob_ref(buf: &mut Vec<u8>, data: &[u8], blob_start: usize) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    let offset = if data.is_empty() { 0u32 } else { blob_start as u32 };
    buf.extend_from_slice(&offset.to_le_bytes());
}

fn encode_path_packet(
    msg_type: MessageType,
    msg_id: u64,
    caller: &Caller,
    file_id: u64,
    file_path: &[u8],
) -> Vec<u8> {
    let blob_start = HEADER_SIZE + OPEN_BODY;
    let total = blob_start + file_path.len();
    let mut buf = Vec::with_capacity(total);
    put_header(&mut buf, total, msg_id, msg_type, Initiator::Host, caller);
    buf.extend_from_slice(&file_id.to_le_bytes());
    put_blob_ref(&mut buf, file_path, blob_start);
    buf.extend_from_slice(file_path);
    buf
}

fn encode_data_packet(
    msg_type: MessageType,
    msg_id: u64,
    initiator: Initiator,
    caller: &Caller,
    code: i32,
    offset: u64,
    data: &[u8],
) -> Vec<u8> {
    let blob_start = HEADER_SIZE + DATA_BODY;
    let total = blob_start + data.len();
    let mut buf = Vec::with_capacity(total);
    put_header(&mut buf, total, msg_id, msg_type, initiator, caller);
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    put_blob_ref(&mut buf, data, blob_start);
    buf.extend_from_slice(data);
    buf
}

/// HELLO, sent by the daemon right after connecting. `pid` is the daemon's
/// own tgid; the gate records it for the reentrancy bypass.
pub fn encode_hello(msg_id: u64, caller: &Caller, pid: i32) -> Vec<u8> {
    let total = HEADER_SIZE + HELLO_BODY;
    let mut buf = Vec::with_capacity(total);
    put_header(&mut buf, total, msg_id, MessageType::Hello, Initiator::Daemon, caller);
    buf.extend_from_slice(&pid.to_le_bytes());
    buf
}

/// CLOSE, sent by the daemon to detach without dropping the socket.
pub fn encode_close(msg_id: u64, caller: &Caller) -> Vec<u8> {
    let total = HEADER_SIZE + CLOSE_BODY;
    let mut buf = Vec::with_capacity(total);
    put_header(&mut buf, total, msg_id, MessageType::Close, Initiator::Daemon, caller);
    buf
}

pub fn encode_open_request(msg_id: u64, caller: &Caller, file_id: u64, file_path: &[u8]) -> Vec<u8> {
    encode_path_packet(MessageType::Open, msg_id, caller, file_id, file_path)
}

pub fn encode_release_request(
    msg_id: u64,
    caller: &Caller,
    file_id: u64,
    file_path: &[u8],
) -> Vec<u8> {
    encode_path_packet(MessageType::Release, msg_id, caller, file_id, file_path)
}

/// READ transform request: `data` is ciphertext, the reply carries plaintext.
pub fn encode_read_request(msg_id: u64, caller: &Caller, offset: u64, data: &[u8]) -> Vec<u8> {
    encode_data_packet(MessageType::Read, msg_id, Initiator::Host, caller, 0, offset, data)
}

/// WRITE transform request: `data` is plaintext, the reply carries ciphertext.
pub fn encode_write_request(msg_id: u64, caller: &Caller, offset: u64, data: &[u8]) -> Vec<u8> {
    encode_data_packet(MessageType::Write, msg_id, Initiator::Host, caller, 0, offset, data)
}

/// CLEANUP eviction notice. One-way; the daemon must not reply.
pub fn encode_cleanup(msg_id: u64, caller: &Caller, file_id: u64) -> Vec<u8> {
    let total = HEADER_SIZE + CLEANUP_BODY;
    let mut buf = Vec::with_capacity(total);
    put_header(&mut buf, total, msg_id, MessageType::Cleanup, Initiator::Host, caller);
    buf.extend_from_slice(&file_id.to_le_bytes());
    buf
}

/// CODE reply to an OPEN or RELEASE request. The header of the request is
/// echoed so the correlation fields (msg id, type, initiator) line up.
pub fn encode_code_reply(request: &Header, error_code: i32) -> Vec<u8> {
    let total = HEADER_SIZE + CODE_BODY;
    let mut buf = Vec::with_capacity(total);
    put_header(
        &mut buf,
        total,
        request.msg_id,
        request.msg_type,
        request.initiator,
        &request.caller(),
    );
    buf.extend_from_slice(&error_code.to_le_bytes());
    buf
}

/// Data reply to a READ or WRITE request, carrying the transformed bytes.
pub fn encode_data_reply(request: &Header, code: i32, offset: u64, data: &[u8]) -> Vec<u8> {
    encode_data_packet(
        request.msg_type,
        request.msg_id,
        request.initiator,
        &request.caller(),
        code,
        offset,
        data,
    )
}

/// Reply to an OPEN request carrying the access verdict.
pub fn encode_verdict_reply(request: &Header, verdict: AccessVerdict) -> Vec<u8> {
    encode_code_reply(request, verdict.code())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Parse and validate the fixed header. Fails if the buffer is shorter than
/// a header or the size field disagrees with the buffer length.
pub fn decode_header(buf: &[u8]) -> Result<Header, WireError> {
    if buf.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            needed: HEADER_SIZE,
            have: buf.len(),
        });
    }
    let size = read_u32(buf, 0);
    if size as usize != buf.len() {
        return Err(WireError::LengthMismatch {
            size,
            len: buf.len(),
        });
    }
    let raw_type = buf[12];
    let msg_type = MessageType::from_u8(raw_type).ok_or(WireError::UnknownType(raw_type))?;
    let raw_initiator = buf[13];
    let initiator =
        Initiator::from_u8(raw_initiator).ok_or(WireError::UnknownInitiator(raw_initiator))?;
    Ok(Header {
        size,
        msg_id: read_u64(buf, 4),
        msg_type,
        initiator,
        pid: read_i32(buf, 14),
        uid: read_u32(buf, 18),
        gid: read_u32(buf, 22),
    })
}

fn check_body(buf: &[u8], body_size: usize) -> Result<(), WireError> {
    let needed = HEADER_SIZE + body_size;
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Resolve a `(size, offset)` blob reference against the packet buffer.
/// An empty blob is always valid regardless of its offset field.
fn blob_slice(buf: &[u8], body_end: usize, size: u32, offset: u32) -> Result<&[u8], WireError> {
    if size == 0 {
        return Ok(&[]);
    }
    let start = offset as u64;
    let end = start + size as u64;
    if start < body_end as u64 || end > buf.len() as u64 {
        return Err(WireError::BlobOutOfRange {
            offset,
            size,
            len: buf.len(),
        });
    }
    Ok(&buf[start as usize..end as usize])
}

/// Decode a request packet (host-initiated work or daemon-initiated
/// HELLO/CLOSE). The returned view borrows blob bytes from `buf`.
pub fn decode_request(buf: &[u8]) -> Result<PacketView<'_>, WireError> {
    let header = decode_header(buf)?;
    let body_size = request_body_size(header.msg_type);
    check_body(buf, body_size)?;
    let body_end = HEADER_SIZE + body_size;
    let b = HEADER_SIZE;

    let body = match header.msg_type {
        MessageType::Hello => RequestBody::Hello {
            pid: read_i32(buf, b),
        },
        MessageType::Close => RequestBody::Close,
        MessageType::Open | MessageType::Release => {
            let file_id = read_u64(buf, b);
            let size = read_u32(buf, b + 8);
            let offset = read_u32(buf, b + 12);
            let file_path = blob_slice(buf, body_end, size, offset)?;
            if header.msg_type == MessageType::Open {
                RequestBody::Open { file_id, file_path }
            } else {
                RequestBody::Release { file_id, file_path }
            }
        }
        MessageType::Read | MessageType::Write => {
            let code = read_i32(buf, b);
            let offset = read_u64(buf, b + 4);
            let size = read_u32(buf, b + 12);
            let blob_offset = read_u32(buf, b + 16);
            let data = blob_slice(buf, body_end, size, blob_offset)?;
            if header.msg_type == MessageType::Read {
                RequestBody::Read { code, offset, data }
            } else {
                RequestBody::Write { code, offset, data }
            }
        }
        MessageType::Cleanup => RequestBody::Cleanup {
            file_id: read_u64(buf, b),
        },
    };

    Ok(PacketView { header, body })
}

/// Decode a reply packet. The echoed message type selects the body shape:
/// OPEN/RELEASE carry a CODE body, READ/WRITE carry a data body. The other
/// types never have replies.
pub fn decode_reply(buf: &[u8]) -> Result<ReplyView<'_>, WireError> {
    let header = decode_header(buf)?;
    let b = HEADER_SIZE;

    let body = match header.msg_type {
        MessageType::Open | MessageType::Release => {
            check_body(buf, CODE_BODY)?;
            ReplyBody::Code {
                error_code: read_i32(buf, b),
            }
        }
        MessageType::Read | MessageType::Write => {
            check_body(buf, DATA_BODY)?;
            let body_end = HEADER_SIZE + DATA_BODY;
            let code = read_i32(buf, b);
            let offset = read_u64(buf, b + 4);
            let size = read_u32(buf, b + 12);
            let blob_offset = read_u32(buf, b + 16);
            let data = blob_slice(buf, body_end, size, blob_offset)?;
            ReplyBody::Data { code, offset, data }
        }
        other => return Err(WireError::UnexpectedType(other)),
    };

    Ok(ReplyView { header, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> Caller {
        Caller::new(4321, 1000, 1000)
    }

    #[test]
    fn header_is_packed_little_endian() {
        let buf = encode_hello(7, &caller(), 4321);
        assert_eq!(buf.len(), HEADER_SIZE + 4);
        assert_eq!(read_u32(&buf, 0) as usize, buf.len());
        assert_eq!(read_u64(&buf, 4), 7);
        assert_eq!(buf[12], MessageType::Hello as u8);
        assert_eq!(buf[13], Initiator::Daemon as u8);
    }

    #[test]
    fn open_request_round_trip() {
        let buf = encode_open_request(42, &caller(), 99, b"/mnt/a.txt");
        let view = decode_request(&buf).unwrap();
        assert_eq!(view.header.msg_id, 42);
        assert_eq!(view.header.initiator, Initiator::Host);
        match view.body {
            RequestBody::Open { file_id, file_path } => {
                assert_eq!(file_id, 99);
                assert_eq!(file_path, b"/mnt/a.txt");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn read_reply_round_trip() {
        let request = decode_header(&encode_read_request(5, &caller(), 256, b"cipher")).unwrap();
        let buf = encode_data_reply(&request, 0, 256, b"plain!");
        let view = decode_reply(&buf).unwrap();
        assert_eq!(view.header.msg_id, 5);
        match view.body {
            ReplyBody::Data { code, offset, data } => {
                assert_eq!(code, 0);
                assert_eq!(offset, 256);
                assert_eq!(data, b"plain!");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn blob_pointing_into_header_is_rejected() {
        let mut buf = encode_open_request(1, &caller(), 1, b"x");
        // Rewrite the blob offset to land inside the header.
        buf[HEADER_SIZE + 12..HEADER_SIZE + 16].copy_from_slice(&4u32.to_le_bytes());
        match decode_request(&buf) {
            Err(WireError::BlobOutOfRange { .. }) => {}
            other => panic!("expected BlobOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn blob_past_end_is_rejected() {
        let mut buf = encode_read_request(1, &caller(), 0, b"abcd");
        // Inflate the blob size past the end of the packet.
        buf[HEADER_SIZE + 12..HEADER_SIZE + 16].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            decode_request(&buf),
            Err(WireError::BlobOutOfRange { .. })
        ));
    }

    #[test]
    fn size_field_must_match_buffer() {
        let mut buf = encode_close(3, &caller());
        buf.push(0); // trailing garbage the size field does not cover
        assert!(matches!(
            decode_request(&buf),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = encode_close(3, &caller());
        buf[12] = 3; // reserved PR_MSG_USER value, never valid on the wire
        assert!(matches!(
            decode_request(&buf),
            Err(WireError::UnknownType(3))
        ));
    }

    #[test]
    fn verdict_codes_map_with_init_fallback() {
        assert_eq!(AccessVerdict::from_code(1), AccessVerdict::Init);
        assert_eq!(AccessVerdict::from_code(2), AccessVerdict::Prohibit);
        assert_eq!(AccessVerdict::from_code(3), AccessVerdict::Encrypt);
        assert_eq!(AccessVerdict::from_code(4), AccessVerdict::Decrypt);
        assert_eq!(AccessVerdict::from_code(0), AccessVerdict::Init);
        assert_eq!(AccessVerdict::from_code(77), AccessVerdict::Init);
    }
}
