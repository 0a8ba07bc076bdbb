use proptest::prelude::*;

use super::cipher::{BLOCK_LEN_MAX, Channel, CipherContext, Role};
use super::server::{PairSetupServer, PairVerifyServer};
use super::setup::{PairSetup, SetupMode};
use super::storage::PairingKeys;
use super::tlv::{TlvReader, TlvType, TlvWriter};
use super::verify::PairVerify;
use super::{PairingError, TRANSIENT_PIN};

const CLIENT_ID: &str = "AA6BD2A6D5A84B5A";
const ACCESSORY_ID: &str = "11:22:33:44:55:66";

fn run_transient_setup() -> (Vec<u8>, Vec<u8>) {
    let mut client = PairSetup::new(SetupMode::Transient, CLIENT_ID, "");
    let mut server = PairSetupServer::new(ACCESSORY_ID, TRANSIENT_PIN).unwrap();

    let m1 = client.request1().unwrap();
    let m2 = server.handle(&m1);
    client.response1(&m2).unwrap();

    let m3 = client.request2().unwrap();
    let m4 = server.handle(&m3);
    client.response2(&m4).unwrap();

    (
        client.shared_secret().unwrap().to_vec(),
        server.shared_secret().unwrap().to_vec(),
    )
}

#[test]
fn transient_setup_derives_matching_64_byte_secret() {
    let (client_secret, server_secret) = run_transient_setup();
    assert_eq!(client_secret.len(), 64);
    assert_eq!(client_secret, server_secret);
}

#[test]
fn normal_setup_exchanges_long_term_keys() {
    let mut client = PairSetup::new(SetupMode::Normal, CLIENT_ID, "1234");
    let mut server = PairSetupServer::new(ACCESSORY_ID, "1234").unwrap();

    let m1 = client.request1().unwrap();
    client.response1(&server.handle(&m1)).unwrap();
    let m3 = client.request2().unwrap();
    client.response2(&server.handle(&m3)).unwrap();
    let m5 = client.request3().unwrap();
    client.response3(&server.handle(&m5)).unwrap();

    let keys = client.keys().expect("keys after M6");
    assert_eq!(keys.device_id, ACCESSORY_ID);
    assert_eq!(keys.device_public.len(), 32);
    assert_eq!(server.controller_ltpk().unwrap(), &keys.client_public[..]);
}

#[test]
fn setup_fails_on_wrong_pin() {
    let mut client = PairSetup::new(SetupMode::Normal, CLIENT_ID, "0000");
    let mut server = PairSetupServer::new(ACCESSORY_ID, "1234").unwrap();

    let m1 = client.request1().unwrap();
    client.response1(&server.handle(&m1)).unwrap();
    let m3 = client.request2().unwrap();
    let m4 = server.handle(&m3);

    // Server answers with an Error TLV, the client surfaces the code
    match client.response2(&m4) {
        Err(PairingError::PeerError { code }) => assert_eq!(code, super::tlv::errors::AUTHENTICATION),
        other => panic!("expected PeerError, got {other:?}"),
    }
}

#[test]
fn verify_roundtrip_after_normal_setup() {
    let mut client = PairSetup::new(SetupMode::Normal, CLIENT_ID, "1234");
    let mut server = PairSetupServer::new(ACCESSORY_ID, "1234").unwrap();

    let m1 = client.request1().unwrap();
    client.response1(&server.handle(&m1)).unwrap();
    let m3 = client.request2().unwrap();
    client.response2(&server.handle(&m3)).unwrap();
    let m5 = client.request3().unwrap();
    client.response3(&server.handle(&m5)).unwrap();

    let keys = client.keys().unwrap();
    let signing_secret = server.signing_secret();
    let controller_ltpk = server.controller_ltpk().map(<[u8]>::to_vec);

    // keys() returns the accessory LTPK the client saw; verify against it
    let mut vclient = PairVerify::new(CLIENT_ID, keys);
    let mut vserver = PairVerifyServer::new(ACCESSORY_ID, &signing_secret, controller_ltpk);

    let v1 = vclient.request1().unwrap();
    vclient.response1(&vserver.handle(&v1)).unwrap();
    let v3 = vclient.request2().unwrap();
    vclient.response2(&vserver.handle(&v3)).unwrap();

    assert_eq!(
        vclient.shared_secret().unwrap(),
        vserver.shared_secret().unwrap()
    );
}

#[test]
fn verify_rejects_unknown_accessory_key() {
    // Client holds keys from a different accessory; signature check must fail
    let mut client = PairSetup::new(SetupMode::Normal, CLIENT_ID, "1234");
    let mut server = PairSetupServer::new(ACCESSORY_ID, "1234").unwrap();

    let m1 = client.request1().unwrap();
    client.response1(&server.handle(&m1)).unwrap();
    let m3 = client.request2().unwrap();
    client.response2(&server.handle(&m3)).unwrap();
    let m5 = client.request3().unwrap();
    client.response3(&server.handle(&m5)).unwrap();

    let mut keys = client.keys().unwrap();
    keys.device_public = vec![0x55; 32];

    let signing_secret = server.signing_secret();
    let mut vclient = PairVerify::new(CLIENT_ID, keys);
    let mut vserver = PairVerifyServer::new(ACCESSORY_ID, &signing_secret, None);

    let v1 = vclient.request1().unwrap();
    let v2 = vserver.handle(&v1);
    assert!(vclient.response1(&v2).is_err());
}

#[test]
fn control_channel_roundtrip_between_roles() {
    let (secret, _) = run_transient_setup();

    let mut controller = CipherContext::new(&secret, Channel::Control, Role::Controller).unwrap();
    let mut accessory = CipherContext::new(&secret, Channel::Control, Role::Accessory).unwrap();

    let wire = controller.encrypt(b"SETUP rtsp://x RTSP/1.0\r\n\r\n").unwrap();
    let (plain, consumed) = accessory.decrypt(&wire).unwrap();
    assert_eq!(consumed, wire.len());
    assert_eq!(plain, b"SETUP rtsp://x RTSP/1.0\r\n\r\n");

    // And the reverse direction
    let wire = accessory.encrypt(b"RTSP/1.0 200 OK\r\n\r\n").unwrap();
    let (plain, _) = controller.decrypt(&wire).unwrap();
    assert_eq!(plain, b"RTSP/1.0 200 OK\r\n\r\n");
}

#[test]
fn events_channel_swaps_keys_for_accessory() {
    let (secret, _) = run_transient_setup();

    let mut controller = CipherContext::new(&secret, Channel::Events, Role::Controller).unwrap();
    let mut accessory = CipherContext::new(&secret, Channel::Events, Role::Accessory).unwrap();

    let wire = accessory.encrypt(b"event").unwrap();
    let (plain, _) = controller.decrypt(&wire).unwrap();
    assert_eq!(plain, b"event");
}

#[test]
fn frame_roundtrip_counters_match() {
    let secret = [0x11u8; 64];

    for len in [0usize, 1, 0x3ff, 0x400, 0x401, 0x800, 0x1000, 64 * 1024] {
        let mut tx = CipherContext::new(&secret, Channel::Control, Role::Controller).unwrap();
        let mut rx = CipherContext::new(&secret, Channel::Control, Role::Accessory).unwrap();

        let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let wire = tx.encrypt(&plain).unwrap();
        let (roundtripped, consumed) = rx.decrypt(&wire).unwrap();

        assert_eq!(roundtripped, plain, "len {len}");
        assert_eq!(consumed, wire.len());
        assert_eq!(tx.write_counter(), (len.div_ceil(BLOCK_LEN_MAX)) as u64);
        assert_eq!(rx.read_counter(), tx.write_counter());
    }
}

#[test]
fn partial_block_is_left_unconsumed() {
    let secret = [0x22u8; 64];
    let mut tx = CipherContext::new(&secret, Channel::Control, Role::Controller).unwrap();
    let mut rx = CipherContext::new(&secret, Channel::Control, Role::Accessory).unwrap();

    let wire = tx.encrypt(&[0xaa; 100]).unwrap();

    let (plain, consumed) = rx.decrypt(&wire[..wire.len() - 1]).unwrap();
    assert!(plain.is_empty());
    assert_eq!(consumed, 0);

    let (plain, consumed) = rx.decrypt(&wire).unwrap();
    assert_eq!(plain.len(), 100);
    assert_eq!(consumed, wire.len());
}

#[test]
fn encrypt_rollback_reproduces_ciphertext() {
    let secret = [0x33u8; 64];
    let mut tx = CipherContext::new(&secret, Channel::Control, Role::Controller).unwrap();

    // Advance the counter a little first
    let _ = tx.encrypt(b"warmup").unwrap();

    let first = tx.encrypt(b"payload").unwrap();
    tx.encrypt_rollback();
    let second = tx.encrypt(b"payload").unwrap();
    assert_eq!(first, second);
}

#[test]
fn decrypt_rollback_allows_retry() {
    let secret = [0x44u8; 64];
    let mut tx = CipherContext::new(&secret, Channel::Control, Role::Controller).unwrap();
    let mut rx = CipherContext::new(&secret, Channel::Control, Role::Accessory).unwrap();

    let wire = tx.encrypt(b"abc").unwrap();
    let (plain, _) = rx.decrypt(&wire).unwrap();
    assert_eq!(plain, b"abc");

    rx.decrypt_rollback();
    let (plain, _) = rx.decrypt(&wire).unwrap();
    assert_eq!(plain, b"abc");
}

#[test]
fn tlv_long_value_chunks_at_255() {
    let value = vec![0xabu8; 600];
    let blob = TlvWriter::new().add(TlvType::PublicKey, &value).build();

    // 255 + 255 + 90, three headers
    assert_eq!(blob.len(), 600 + 6);
    assert_eq!(blob[0], TlvType::PublicKey as u8);
    assert_eq!(blob[1], 255);

    let parsed = TlvReader::parse(&blob).unwrap();
    assert_eq!(parsed.get(TlvType::PublicKey).unwrap(), &value[..]);
}

#[test]
fn tlv_truncated_input_is_rejected() {
    assert!(TlvReader::parse(&[0x06]).is_err());
    assert!(TlvReader::parse(&[0x06, 0x02, 0x01]).is_err());
}

proptest! {
    #[test]
    fn tlv_roundtrip(values in proptest::collection::hash_map(
        proptest::sample::select(vec![
            TlvType::Method, TlvType::Identifier, TlvType::Salt, TlvType::PublicKey,
            TlvType::Proof, TlvType::EncryptedData, TlvType::Signature, TlvType::Flags,
        ]),
        proptest::collection::vec(any::<u8>(), 0..10_000),
        0..5,
    )) {
        let mut writer = TlvWriter::new();
        for (t, v) in &values {
            writer = writer.add(*t, v);
        }

        let parsed = TlvReader::parse(&writer.build()).unwrap();
        for (t, v) in &values {
            prop_assert_eq!(parsed.get(*t).unwrap_or(&[]), &v[..]);
        }
    }

    #[test]
    fn framed_cipher_roundtrip_any_len(len in 0usize..3000) {
        let secret = [0x55u8; 64];
        let mut tx = CipherContext::new(&secret, Channel::Control, Role::Controller).unwrap();
        let mut rx = CipherContext::new(&secret, Channel::Control, Role::Accessory).unwrap();

        let plain: Vec<u8> = (0..len).map(|i| (i & 0xff) as u8).collect();
        let wire = tx.encrypt(&plain).unwrap();
        let (out, consumed) = rx.decrypt(&wire).unwrap();
        prop_assert_eq!(out, plain);
        prop_assert_eq!(consumed, wire.len());
    }
}
