use super::*;

#[test]
fn srp_client_and_server_agree_on_session_key() {
    let salt = [0x42u8; 16];
    let server = SrpServer::new(b"Pair-Setup", b"3939", &salt).unwrap();
    let client = SrpClient::new().unwrap();

    let verifier = client
        .process_challenge(b"Pair-Setup", b"3939", &salt, server.public_key())
        .unwrap();

    let (m2, server_key) = server
        .verify_client(client.public_key(), verifier.client_proof())
        .unwrap();

    let client_key = verifier.verify_server(&m2).unwrap();

    assert_eq!(client_key.as_bytes().len(), lengths::SRP_SESSION_KEY);
    assert_eq!(client_key.as_bytes(), server_key.as_bytes());
}

#[test]
fn srp_server_rejects_wrong_password() {
    let salt = [7u8; 16];
    let server = SrpServer::new(b"Pair-Setup", b"3939", &salt).unwrap();
    let client = SrpClient::new().unwrap();

    let verifier = client
        .process_challenge(b"Pair-Setup", b"0000", &salt, server.public_key())
        .unwrap();

    assert!(
        server
            .verify_client(client.public_key(), verifier.client_proof())
            .is_err()
    );
}

#[test]
fn srp_client_rejects_zero_server_public() {
    let client = SrpClient::new().unwrap();
    let zero = vec![0u8; lengths::SRP_PUBLIC_KEY];
    assert!(
        client
            .process_challenge(b"Pair-Setup", b"3939", &[1u8; 16], &zero)
            .is_err()
    );
}

#[test]
fn srp_public_keys_are_group_sized() {
    let client = SrpClient::new().unwrap();
    assert_eq!(client.public_key().len(), lengths::SRP_PUBLIC_KEY);

    let server = SrpServer::new(b"Pair-Setup", b"3939", &[0u8; 16]).unwrap();
    assert_eq!(server.public_key().len(), lengths::SRP_PUBLIC_KEY);
}

#[test]
fn hkdf_control_write_key_is_stable() {
    let ikm = [0xabu8; 64];

    let hkdf = HkdfSha512::new(Some(b"Control-Salt"), &ikm);
    let first: [u8; 32] = hkdf.expand_fixed(b"Control-Write-Encryption-Key").unwrap();
    let second: [u8; 32] = HkdfSha512::new(Some(b"Control-Salt"), &ikm)
        .expand_fixed(b"Control-Write-Encryption-Key")
        .unwrap();

    assert_eq!(first, second);
    // Precomputed with an independent HKDF-SHA512 implementation
    assert_eq!(
        first,
        [
            0x89, 0x15, 0x56, 0xe5, 0x43, 0x79, 0x86, 0xd9, 0x52, 0x9e, 0xdf, 0x69, 0xf2, 0xc6,
            0xd8, 0xb4, 0xd2, 0x17, 0xb1, 0x84, 0x89, 0x77, 0x3a, 0x77, 0xe5, 0x97, 0x6d, 0xb8,
            0xe1, 0xc6, 0x57, 0x66
        ]
    );
}

#[test]
fn hkdf_rfc5869_shape() {
    // Different infos must give unrelated keys from the same ikm
    let hkdf = HkdfSha512::new(Some(b"Control-Salt"), &[1u8; 64]);
    let write: [u8; 32] = hkdf.expand_fixed(b"Control-Write-Encryption-Key").unwrap();
    let read: [u8; 32] = hkdf.expand_fixed(b"Control-Read-Encryption-Key").unwrap();
    assert_ne!(write, read);
}

#[test]
fn chacha_roundtrip_with_aad() {
    let key = [3u8; 32];
    let cipher = ChaCha20Poly1305Cipher::new(&key).unwrap();
    let nonce = Nonce::from_counter(9);

    let sealed = cipher.encrypt_with_aad(&nonce, b"aad", b"hello").unwrap();
    assert_eq!(sealed.len(), 5 + lengths::CHACHA_TAG);

    let opened = cipher.decrypt_with_aad(&nonce, b"aad", &sealed).unwrap();
    assert_eq!(opened, b"hello");

    assert!(cipher.decrypt_with_aad(&nonce, b"bad", &sealed).is_err());
}

#[test]
fn chacha_detached_matches_appended() {
    let key = [5u8; 32];
    let cipher = ChaCha20Poly1305Cipher::new(&key).unwrap();
    let nonce = Nonce::from_seqnum(0x1234);

    let appended = cipher.encrypt_with_aad(&nonce, b"hdr", b"payload").unwrap();

    let mut buf = b"payload".to_vec();
    let tag = cipher.encrypt_detached(&nonce, b"hdr", &mut buf).unwrap();

    assert_eq!(&appended[..7], &buf[..]);
    assert_eq!(&appended[7..], &tag[..]);

    cipher.decrypt_detached(&nonce, b"hdr", &mut buf, &tag).unwrap();
    assert_eq!(buf, b"payload");
}

#[test]
fn nonce_constructions() {
    assert_eq!(
        Nonce::from_counter(1).as_bytes(),
        &[0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(
        Nonce::from_seqnum(0x0102).as_bytes(),
        &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2]
    );
    assert_eq!(
        Nonce::from_label(b"PS-Msg05").as_bytes(),
        &[0, 0, 0, 0, b'P', b'S', b'-', b'M', b's', b'g', b'0', b'5']
    );
}

#[test]
fn ed25519_sign_verify_roundtrip() {
    let keypair = Ed25519KeyPair::generate();
    let sig = keypair.sign(b"message");

    keypair.public_key().verify(b"message", &sig).unwrap();
    assert!(keypair.public_key().verify(b"other", &sig).is_err());

    let restored = Ed25519KeyPair::from_bytes(&keypair.secret_bytes()).unwrap();
    assert_eq!(
        restored.public_key().as_bytes(),
        keypair.public_key().as_bytes()
    );
}

#[test]
fn x25519_shared_secret_agreement() {
    let ours = X25519KeyPair::generate();
    let theirs = X25519KeyPair::generate();

    let s1 = ours.diffie_hellman(&theirs.public_key());
    let s2 = theirs.diffie_hellman(&ours.public_key());
    assert_eq!(s1.as_bytes(), s2.as_bytes());
}
