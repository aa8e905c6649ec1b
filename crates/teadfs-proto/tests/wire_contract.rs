// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-side wire contract checks: packets built by one side must decode
//! on the other exactly, including the correlation fields replies echo.

use teadfs_proto::*;

fn host_caller() -> Caller {
    Caller::new(1234, 1000, 1000)
}

#[test]
fn open_exchange_echoes_correlation_fields() {
    let request = encode_open_request(17, &host_caller(), 8001, b"/mnt/a.txt");

    // Daemon side decodes the request and answers with a verdict.
    let view = decode_request(&request).unwrap();
    let RequestBody::Open { file_id, file_path } = view.body else {
        panic!("expected OPEN body");
    };
    assert_eq!(file_id, 8001);
    assert_eq!(file_path, b"/mnt/a.txt");

    let reply = encode_verdict_reply(&view.header, AccessVerdict::Decrypt);

    // Host side sees the same msg id and the host initiator bit.
    let reply_view = decode_reply(&reply).unwrap();
    assert_eq!(reply_view.header.msg_id, 17);
    assert_eq!(reply_view.header.msg_type, MessageType::Open);
    assert_eq!(reply_view.header.initiator, Initiator::Host);
    assert!(matches!(reply_view.body, ReplyBody::Code { error_code: 4 }));
}

#[test]
fn read_exchange_carries_transform_payloads() {
    // 356 ciphertext bytes read from lower offset 256, as in a full-file
    // read of a 612-byte encrypted lower file.
    let ciphertext = vec![0xAAu8; 356];
    let request = encode_read_request(99, &host_caller(), 256, &ciphertext);

    let view = decode_request(&request).unwrap();
    let RequestBody::Read { code, offset, data } = view.body else {
        panic!("expected READ body");
    };
    assert_eq!(code, 0);
    assert_eq!(offset, 256);
    assert_eq!(data.len(), 356);

    let plaintext = vec![0x55u8; 356];
    let reply = encode_data_reply(&view.header, 0, 256, &plaintext);
    let reply_view = decode_reply(&reply).unwrap();
    match reply_view.body {
        ReplyBody::Data { data, .. } => assert_eq!(data, &plaintext[..]),
        other => panic!("unexpected reply body {:?}", other),
    }
}

#[test]
fn empty_write_payload_is_legal() {
    let request = encode_write_request(3, &host_caller(), 0, &[]);
    let view = decode_request(&request).unwrap();
    match view.body {
        RequestBody::Write { data, .. } => assert!(data.is_empty()),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn release_and_cleanup_round_trip() {
    let release = encode_release_request(7, &host_caller(), 42, b"/mnt/b.txt");
    let view = decode_request(&release).unwrap();
    let RequestBody::Release { file_id, file_path } = view.body else {
        panic!("expected RELEASE body");
    };
    assert_eq!(file_id, 42);
    assert_eq!(file_path, b"/mnt/b.txt");

    let cleanup = encode_cleanup(8, &host_caller(), 42);
    let view = decode_request(&cleanup).unwrap();
    assert!(matches!(view.body, RequestBody::Cleanup { file_id: 42 }));

    // CLEANUP is one-way: a reply-shaped parse must fail.
    assert!(matches!(
        decode_reply(&cleanup),
        Err(WireError::UnexpectedType(MessageType::Cleanup))
    ));
}

#[test]
fn hello_and_close_are_daemon_initiated() {
    let daemon = Caller::new(999, 0, 0);
    let hello_bytes = encode_hello(1, &daemon, 999);
    let hello = decode_request(&hello_bytes).unwrap();
    assert_eq!(hello.header.initiator, Initiator::Daemon);
    assert!(matches!(hello.body, RequestBody::Hello { pid: 999 }));

    let close_bytes = encode_close(2, &daemon);
    let close = decode_request(&close_bytes).unwrap();
    assert_eq!(close.header.initiator, Initiator::Daemon);
    assert!(matches!(close.body, RequestBody::Close));
}
