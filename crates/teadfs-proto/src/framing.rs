// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stream framing for packets
//!
//! Packets carry their total length in the first four header bytes, so a
//! stream socket needs no extra length prefix: read the size field, then
//! the remainder. Both the host transport and the daemon-side client use
//! these helpers so the two ends cannot disagree about framing.

use crate::messages::HEADER_SIZE;
use std::io::{self, ErrorKind, Read, Write};

/// Upper bound on a single packet. A transform round-trip carries at most
/// one page-cache chunk plus slack, so anything near this limit is a
/// corrupt or hostile peer.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Read one complete packet. Returns `Ok(None)` on clean EOF at a packet
/// boundary; EOF mid-packet is an error.
pub fn read_packet(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut size_buf = [0u8; 4];
    match reader.read_exact(&mut size_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let size = u32::from_le_bytes(size_buf) as usize;
    if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("packet size {} outside [{}, {}]", size, HEADER_SIZE, MAX_PACKET_SIZE),
        ));
    }
    let mut buf = vec![0u8; size];
    buf[..4].copy_from_slice(&size_buf);
    reader.read_exact(&mut buf[4..])?;
    Ok(Some(buf))
}

/// Write one complete packet produced by the codec.
pub fn write_packet(writer: &mut impl Write, packet: &[u8]) -> io::Result<()> {
    writer.write_all(packet)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_cleanup, encode_hello};
    use crate::messages::Caller;

    #[test]
    fn packets_survive_a_stream() {
        let caller = Caller::new(1, 0, 0);
        let mut stream = Vec::new();
        write_packet(&mut stream, &encode_hello(1, &caller, 1)).unwrap();
        write_packet(&mut stream, &encode_cleanup(2, &caller, 50)).unwrap();

        let mut cursor = &stream[..];
        let first = read_packet(&mut cursor).unwrap().unwrap();
        let second = read_packet(&mut cursor).unwrap().unwrap();
        assert_eq!(first, encode_hello(1, &caller, 1));
        assert_eq!(second, encode_cleanup(2, &caller, 50));
        assert!(read_packet(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn runt_size_field_is_an_error() {
        let mut cursor = &[4u8, 0, 0, 0][..];
        assert!(read_packet(&mut cursor).is_err());
    }

    #[test]
    fn eof_mid_packet_is_an_error() {
        let caller = Caller::new(1, 0, 0);
        let packet = encode_hello(1, &caller, 1);
        let mut cursor = &packet[..packet.len() - 2];
        assert!(read_packet(&mut cursor).is_err());
    }
}
