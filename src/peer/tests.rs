use bytes::Bytes;

use super::extension::ExtensionHandshake;
use super::message::{Block, BlockRequest, Handshake, Message};
use super::*;
use crate::constants::{BLOCK_SIZE, DONT_HAVE_LOCAL_ID, PEX_LOCAL_ID};

fn round_trip(message: Message) {
    let encoded = message.encode();
    let decoded = Message::decode(encoded).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_message_round_trips() {
    round_trip(Message::KeepAlive);
    round_trip(Message::Choke);
    round_trip(Message::Unchoke);
    round_trip(Message::Interested);
    round_trip(Message::NotInterested);
    round_trip(Message::Have(7));
    round_trip(Message::Bitfield(Bytes::from_static(&[0b1010_0000])));
    round_trip(Message::Request(BlockRequest {
        index: 1,
        begin: 16384,
        length: 16384,
    }));
    round_trip(Message::Piece(Block {
        index: 2,
        begin: 0,
        data: Bytes::from_static(b"block data"),
    }));
    round_trip(Message::Cancel(BlockRequest {
        index: 3,
        begin: 0,
        length: 16384,
    }));
    round_trip(Message::Port(6881));
    round_trip(Message::Suggest(4));
    round_trip(Message::HaveAll);
    round_trip(Message::HaveNone);
    round_trip(Message::Reject(BlockRequest {
        index: 5,
        begin: 0,
        length: 16384,
    }));
    round_trip(Message::AllowedFast(6));
    round_trip(Message::Extended {
        id: 3,
        payload: Bytes::from_static(b"d1:md2:xx:i1eee"),
    });
}

#[test]
fn test_keepalive_is_four_zero_bytes() {
    assert_eq!(Message::KeepAlive.encode().as_ref(), &[0, 0, 0, 0]);
}

#[test]
fn test_request_frame_layout() {
    let encoded = Message::Request(BlockRequest {
        index: 1,
        begin: 2,
        length: 3,
    })
    .encode();
    assert_eq!(encoded.len(), 17);
    assert_eq!(&encoded[..5], &[0, 0, 0, 13, 6]);
}

#[test]
fn test_oversized_frame_is_malicious() {
    let mut frame = vec![0u8; 8];
    frame[..4].copy_from_slice(&(1024u32 * 1024).to_be_bytes());
    frame[4] = 5;
    assert!(matches!(
        Message::decode(Bytes::from(frame)),
        Err(PeerError::Malicious(_))
    ));
}

#[test]
fn test_oversized_piece_payload_is_malicious() {
    let data_len = (BLOCK_SIZE * 2 + 1) as usize;
    let mut frame = Vec::with_capacity(4 + 9 + data_len);
    frame.extend_from_slice(&(9 + data_len as u32).to_be_bytes());
    frame.push(7);
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend(std::iter::repeat(0u8).take(data_len));
    assert!(matches!(
        Message::decode(Bytes::from(frame)),
        Err(PeerError::Malicious(_))
    ));
}

#[test]
fn test_unknown_message_id_is_skipped() {
    let frame = Bytes::from_static(&[0, 0, 0, 3, 99, 1, 2]);
    assert_eq!(
        Message::decode(frame).unwrap(),
        Message::Unknown { id: 99 }
    );
}

#[test]
fn test_handshake_flags() {
    let public = Handshake::new([1u8; 20], [2u8; 20], true);
    assert!(public.supports_fast_extension());
    assert!(public.supports_extension_protocol());
    assert!(public.supports_dht());

    let private = Handshake::new([1u8; 20], [2u8; 20], false);
    assert!(!private.supports_dht());
    assert!(private.supports_fast_extension());
}

#[test]
fn test_handshake_round_trip() {
    let ours = Handshake::new([7u8; 20], [9u8; 20], true);
    let decoded = Handshake::decode(&ours.encode()).unwrap();
    assert_eq!(decoded.info_hash, ours.info_hash);
    assert_eq!(decoded.peer_id, ours.peer_id);
    assert_eq!(decoded.reserved, ours.reserved);
}

#[test]
fn test_handshake_rejects_wrong_protocol() {
    let mut data = Handshake::new([0u8; 20], [0u8; 20], false).encode().to_vec();
    data[3] = b'X';
    assert!(matches!(
        Handshake::decode(&data),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn test_extension_handshake_round_trip() {
    let local = ExtensionHandshake::local(true);
    assert_eq!(local.pex_id, Some(PEX_LOCAL_ID));
    assert_eq!(local.dont_have_id, Some(DONT_HAVE_LOCAL_ID));

    let decoded = ExtensionHandshake::decode(&local.encode()).unwrap();
    assert_eq!(decoded.pex_id, local.pex_id);
    assert_eq!(decoded.dont_have_id, local.dont_have_id);
    assert_eq!(decoded.client, local.client);
    assert_eq!(decoded.reqq, local.reqq);
}

#[test]
fn test_extension_handshake_private_omits_pex() {
    let local = ExtensionHandshake::local(false);
    assert_eq!(local.pex_id, None);
    let decoded = ExtensionHandshake::decode(&local.encode()).unwrap();
    assert_eq!(decoded.pex_id, None);
}

#[test]
fn test_extension_handshake_zero_id_disables() {
    let payload = b"d1:md11:lt_donthavei0e6:ut_pexi2eee";
    let decoded = ExtensionHandshake::decode(payload).unwrap();
    assert_eq!(decoded.dont_have_id, None);
    assert_eq!(decoded.pex_id, Some(2));
}
