//! The bread-and-butter conversation: Identity, MD5-Challenge, Success.

use eap_radius::config::ConfigSection;
use eap_radius::radius::{attr, Attribute, PacketCode, Value, VENDOR_NONE};
use eap_radius::{Code, EapPacket, Method, Rcode};

mod common;

use common::{
    access_request, carry_state, eap_module, eap_module_with, md5_response_value, reply_eap_packet,
    reply_state, run_round, InnerMode, TestLoader, CHALLENGE, PASSWORD,
};

#[test]
fn eap_start_is_answered_with_an_identity_request() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    // an EAP-Start: an empty EAP-Message attribute
    let mut request = access_request(&EapPacket::response(0, Method::IDENTITY, Vec::new()));
    request.packet.vps.remove_all(VENDOR_NONE, attr::EAP_MESSAGE);
    request
        .packet
        .vps
        .add(Attribute::octets(VENDOR_NONE, attr::EAP_MESSAGE, Vec::new()));

    assert_eq!(module.authorize(&mut request), Rcode::Handled);

    let staged = reply_eap_packet(&request);
    assert_eq!(staged.code(), Code::Request);
    assert_eq!(staged.method(), Method::IDENTITY);
    assert_eq!(request.reply.code, Some(PacketCode::AccessChallenge));
    assert!(request
        .reply
        .vps
        .contains(VENDOR_NONE, attr::MESSAGE_AUTHENTICATOR));
}

#[test]
fn identity_md5_success() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    // round 1: Identity response opens the session
    let mut first = access_request(&EapPacket::response(0, Method::IDENTITY, b"bob".to_vec()));
    let (authorize, authenticate) = run_round(&module, &mut first);
    assert_eq!(authorize, Rcode::Ok);
    assert_eq!(authenticate, Rcode::Handled);

    let challenge = reply_eap_packet(&first);
    assert_eq!(challenge.code(), Code::Request);
    assert_eq!(challenge.method(), Method::MD5);
    // the challenge chains its identifier off the Identity response
    assert_eq!(challenge.identifier(), 1);
    assert_eq!(first.reply.code, Some(PacketCode::AccessChallenge));
    assert!(reply_state(&first).is_some());

    // round 2: the peer answers the challenge
    let mut value = vec![16u8];
    value.extend_from_slice(&md5_response_value(
        challenge.identifier(),
        PASSWORD,
        &CHALLENGE,
    ));
    let mut second = access_request(&EapPacket::response(
        challenge.identifier(),
        Method::MD5,
        value,
    ));
    carry_state(&mut second, &first);

    let (authorize, authenticate) = run_round(&module, &mut second);
    assert_eq!(authorize, Rcode::Updated);
    assert_eq!(authenticate, Rcode::Ok);

    let success = reply_eap_packet(&second);
    assert_eq!(success.code(), Code::Success);
    assert_eq!(success.identifier(), challenge.identifier());
    assert_eq!(second.reply.code, Some(PacketCode::AccessAccept));

    // RFC 2869: the Accept must carry User-Name
    let username = second
        .reply
        .vps
        .find(VENDOR_NONE, attr::USER_NAME)
        .expect("Accept should carry User-Name");
    assert_eq!(username.value.as_str(), Some("bob"));

    // terminal session: the old State leads nowhere
    let state = reply_state(&first).unwrap();
    assert!(module.store().thaw(&state).is_err());
}

#[test]
fn wrong_password_gets_a_failure() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    let mut first = access_request(&EapPacket::response(0, Method::IDENTITY, b"bob".to_vec()));
    run_round(&module, &mut first);
    let challenge = reply_eap_packet(&first);

    let mut value = vec![16u8];
    value.extend_from_slice(&md5_response_value(
        challenge.identifier(),
        b"wrong password",
        &CHALLENGE,
    ));
    let mut second = access_request(&EapPacket::response(
        challenge.identifier(),
        Method::MD5,
        value,
    ));
    carry_state(&mut second, &first);

    let (_, authenticate) = run_round(&module, &mut second);
    assert_eq!(authenticate, Rcode::Reject);
    assert_eq!(reply_eap_packet(&second).code(), Code::Failure);
    assert_eq!(second.reply.code, Some(PacketCode::AccessReject));
}

#[test]
fn cisco_accounting_bug_pads_username_with_two_nuls() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module_with(
        &loader,
        ConfigSection::new("eap").with_item("cisco_accounting_username_bug", "yes"),
    );

    let mut first = access_request(&EapPacket::response(0, Method::IDENTITY, b"bob".to_vec()));
    run_round(&module, &mut first);
    let challenge = reply_eap_packet(&first);

    let mut value = vec![16u8];
    value.extend_from_slice(&md5_response_value(
        challenge.identifier(),
        PASSWORD,
        &CHALLENGE,
    ));
    let mut second = access_request(&EapPacket::response(
        challenge.identifier(),
        Method::MD5,
        value,
    ));
    carry_state(&mut second, &first);
    run_round(&module, &mut second);

    let username = second
        .reply
        .vps
        .find(VENDOR_NONE, attr::USER_NAME)
        .expect("Accept should carry User-Name");
    assert_eq!(username.value, Value::Octets(b"bob\0\0".to_vec()));
}

#[test]
fn malformed_eap_message_fails_the_round() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    let mut request = access_request(&EapPacket::response(0, Method::IDENTITY, b"bob".to_vec()));
    request.packet.vps.remove_all(VENDOR_NONE, attr::EAP_MESSAGE);
    // declared length exceeds the buffer
    request.packet.vps.add(Attribute::octets(
        VENDOR_NONE,
        attr::EAP_MESSAGE,
        vec![2, 0, 0, 64, 1],
    ));

    assert_eq!(module.authenticate(&mut request), Rcode::Fail);
}

#[test]
fn authenticate_without_eap_message_is_invalid() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    let mut request = access_request(&EapPacket::response(0, Method::IDENTITY, b"bob".to_vec()));
    request.packet.vps.remove_all(VENDOR_NONE, attr::EAP_MESSAGE);

    assert_eq!(module.authenticate(&mut request), Rcode::Invalid);
}

#[test]
fn non_identity_packet_without_a_session_is_invalid() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    // an MD5 response out of nowhere: no State, no stored session
    let mut request = access_request(&EapPacket::response(5, Method::MD5, vec![16; 17]));

    assert_eq!(module.authenticate(&mut request), Rcode::Invalid);
}

#[test]
fn mismatched_identifier_destroys_the_session() {
    let loader = TestLoader::new(InnerMode::EapConversation);
    let module = eap_module(&loader);

    let mut first = access_request(&EapPacket::response(0, Method::IDENTITY, b"bob".to_vec()));
    run_round(&module, &mut first);
    let challenge = reply_eap_packet(&first);

    // answer with the wrong identifier
    let mut second = access_request(&EapPacket::response(
        challenge.identifier().wrapping_add(7),
        Method::MD5,
        vec![16; 17],
    ));
    carry_state(&mut second, &first);

    assert_eq!(module.authenticate(&mut second), Rcode::Invalid);

    // the session did not survive the mismatch
    let state = reply_state(&first).unwrap();
    assert!(module.store().thaw(&state).is_err());
}
