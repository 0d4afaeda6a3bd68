use alloc::vec;
use alloc::vec::Vec;

use byteorder::{ByteOrder, NetworkEndian};

use super::*;

#[test]
fn decode_md5_response() {
    let raw_packet = [
        2,    // code: Response
        42,   // identifier
        0, 8, // length
        4, // type: MD5-Challenge
        // type data
        0xde, 0xad, 0xbe,
    ];

    let packet = EapPacket::decode(&raw_packet).expect("packet should be valid");

    assert_eq!(packet.code(), Code::Response);
    assert_eq!(packet.identifier(), 42);
    assert_eq!(packet.method(), Method::MD5);
    assert_eq!(
        packet.body().as_ref().map(|body| body.data().as_slice()),
        Some(&[0xde, 0xad, 0xbe][..])
    );
}

#[test]
fn decode_ignores_octets_beyond_declared_length() {
    let raw_packet = [
        1,    // code: Request
        7,    // identifier
        0, 6, // length: one octet of type data
        1,    // type: Identity
        b'?', // type data
        // padding beyond declared length
        0xff, 0xff,
    ];

    let packet = EapPacket::decode(&raw_packet).expect("padding should be ignored");
    assert_eq!(
        packet.body().as_ref().map(|body| body.data().as_slice()),
        Some(&b"?"[..])
    );
}

#[test]
fn decode_success_has_no_body() {
    let raw_packet = [3, 9, 0, 4];

    let packet = EapPacket::decode(&raw_packet).expect("packet should be valid");

    assert_eq!(packet.code(), Code::Success);
    assert_eq!(packet.identifier(), 9);
    assert!(packet.body().is_none());
    assert_eq!(packet.method(), Method::INVALID);
}

#[test]
fn decode_rejects_bad_code() {
    let raw_packet = [5, 0, 0, 4];

    let error = EapPacket::decode(&raw_packet).expect_err("code 5 is invalid");
    assert_eq!(error, DecodeError::InvalidCode(5));
}

#[test]
fn decode_rejects_runt_length_field() {
    // declared length of 2 is below the 4-octet header
    let raw_packet = [2, 0, 0, 2];

    let error = EapPacket::decode(&raw_packet).expect_err("length field is a runt");
    assert_eq!(error, DecodeError::RuntLength(2));
}

#[test]
fn decode_rejects_overlong_length_field() {
    let raw_packet = [
        2,     // code: Response
        0,     // identifier
        0, 64, // length: claims 64 octets
        4, // type: MD5-Challenge
    ];

    let error = EapPacket::decode(&raw_packet).expect_err("declared length exceeds buffer");
    assert_eq!(
        error,
        DecodeError::LengthMismatch {
            declared: 64,
            actual: 5
        }
    );
}

#[test]
fn decode_rejects_response_without_type_octet() {
    // header-only Response: the declared length leaves no room for a type
    let raw_packet = [2, 3, 0, 4];

    let error = EapPacket::decode(&raw_packet).expect_err("Response needs a type octet");
    assert_eq!(error, DecodeError::MissingType);
}

#[test]
fn decode_rejects_short_buffer() {
    let error = EapPacket::decode(&[2, 0, 0]).expect_err("three octets is not a packet");
    assert_eq!(error, DecodeError::Truncated { actual: 3 });
}

#[test]
fn encode_decode_round_trip() {
    let packets = [
        EapPacket::request(1, Method::IDENTITY, Vec::new()),
        EapPacket::response(1, Method::IDENTITY, b"bob".to_vec()),
        EapPacket::request(2, Method::MD5, vec![16; 17]),
        EapPacket::response(200, Method::NAK, vec![13]),
        EapPacket::success(200),
        EapPacket::failure(255),
    ];

    for packet in packets {
        let encoded = packet.encode().expect("packet should encode");
        assert_eq!(encoded.len(), packet.wire_size());
        assert_eq!(
            NetworkEndian::read_u16(&encoded[2..4]),
            u16::try_from(encoded.len()).unwrap()
        );

        let decoded = EapPacket::decode(&encoded).expect("encoded packet should decode");
        assert_eq!(decoded, packet);
    }
}

#[test]
fn encode_rejects_oversize_packet() {
    let packet = EapPacket::request(0, Method::TLS, vec![0; 65_532]);

    let error = packet.encode().expect_err("packet exceeds the length field");
    assert_eq!(error, EncodeError::DataTooLong { length: 65_537 });
}

#[test]
fn from_fragments_concatenates_in_order() {
    let packet = EapPacket::request(5, Method::TLS, vec![0xab; 400]);
    let encoded = packet.encode().expect("packet should encode");

    let reassembled = EapPacket::from_fragments(encoded.chunks(MAX_FRAGMENT_LEN))
        .expect("fragments should reassemble");

    assert_eq!(reassembled, packet);
}

#[test]
fn from_fragments_rejects_empty_list() {
    let error =
        EapPacket::from_fragments(core::iter::empty()).expect_err("no fragments to reassemble");
    assert_eq!(error, DecodeError::NoFragments);
}
