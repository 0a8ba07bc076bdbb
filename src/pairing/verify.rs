//! Controller side of pair-verify: ephemeral Curve25519 exchange
//! authenticated with the long-term ed25519 keys from a previous pair-setup.

use crate::crypto::{
    ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, HkdfSha512, Nonce,
    X25519KeyPair, X25519PublicKey,
};

use super::storage::PairingKeys;
use super::tlv::{TlvReader, TlvType, TlvWriter};
use super::PairingError;

enum State {
    New,
    SentM1,
    GotM2,
    SentM3,
    Done,
    Failed,
}

/// One pair-verify exchange
pub struct PairVerify {
    client_id: String,
    keys: PairingKeys,
    eph: X25519KeyPair,
    server_eph: Option<X25519PublicKey>,
    shared_secret: [u8; 32],
    state: State,
}

impl PairVerify {
    /// `keys` are the persisted result of the normal pair-setup against this
    /// device.
    #[must_use]
    pub fn new(client_id: &str, keys: PairingKeys) -> Self {
        Self {
            client_id: client_id.to_string(),
            keys,
            eph: X25519KeyPair::generate(),
            server_eph: None,
            shared_secret: [0u8; 32],
            state: State::New,
        }
    }

    /// Build M1 (our ephemeral public key)
    pub fn request1(&mut self) -> Result<Vec<u8>, PairingError> {
        if !matches!(self.state, State::New) {
            return Err(PairingError::OutOfSequence("M1 already sent"));
        }

        let m1 = TlvWriter::new()
            .add_state(1)
            .add(TlvType::PublicKey, self.eph.public_key().as_bytes())
            .build();

        self.state = State::SentM1;
        Ok(m1)
    }

    /// Consume M2: the device's ephemeral key plus its encrypted, signed
    /// identity. The signature is checked against the stored LTPK.
    pub fn response1(&mut self, data: &[u8]) -> Result<(), PairingError> {
        if !matches!(self.state, State::SentM1) {
            return Err(PairingError::OutOfSequence("M2 before M1"));
        }

        let tlv = self.read_checked(data, 2)?;
        let server_eph = X25519PublicKey::from_bytes(tlv.get_required(TlvType::PublicKey)?)?;
        let encrypted = tlv.get_required(TlvType::EncryptedData)?;

        let shared = self.eph.diffie_hellman(&server_eph);
        self.shared_secret = *shared.as_bytes();

        let cipher = ChaCha20Poly1305Cipher::new(&self.verify_encrypt_key()?)?;
        let decrypted = cipher.decrypt(&Nonce::from_label(b"PV-Msg02"), encrypted)?;

        let sub_tlv = TlvReader::parse(&decrypted)?;
        let device_id = sub_tlv.get_required(TlvType::Identifier)?;
        let signature = Ed25519Signature::from_bytes(sub_tlv.get_required(TlvType::Signature)?)?;

        // Device signs server_eph || device_id || client_eph
        let mut signed_data = Vec::with_capacity(64 + device_id.len());
        signed_data.extend_from_slice(server_eph.as_bytes());
        signed_data.extend_from_slice(device_id);
        signed_data.extend_from_slice(self.eph.public_key().as_bytes());

        let device_ltpk = Ed25519PublicKey::from_bytes(&self.keys.device_public)?;
        device_ltpk
            .verify(&signed_data, &signature)
            .map_err(|_| PairingError::SignatureVerificationFailed)?;

        self.server_eph = Some(server_eph);
        self.state = State::GotM2;
        Ok(())
    }

    /// Build M3 (our encrypted, signed identity)
    pub fn request2(&mut self) -> Result<Vec<u8>, PairingError> {
        if !matches!(self.state, State::GotM2) {
            return Err(PairingError::OutOfSequence("M3 before M2"));
        }
        let server_eph = self
            .server_eph
            .ok_or(PairingError::OutOfSequence("server key missing"))?;

        let signing = Ed25519KeyPair::from_bytes(&self.keys.client_secret)?;

        // We sign client_eph || client_id || server_eph
        let mut sign_data = Vec::with_capacity(64 + self.client_id.len());
        sign_data.extend_from_slice(self.eph.public_key().as_bytes());
        sign_data.extend_from_slice(self.client_id.as_bytes());
        sign_data.extend_from_slice(server_eph.as_bytes());

        let signature = signing.sign(&sign_data);

        let sub_tlv = TlvWriter::new()
            .add(TlvType::Identifier, self.client_id.as_bytes())
            .add(TlvType::Signature, &signature.to_bytes())
            .build();

        let cipher = ChaCha20Poly1305Cipher::new(&self.verify_encrypt_key()?)?;
        let encrypted = cipher.encrypt(&Nonce::from_label(b"PV-Msg03"), &sub_tlv)?;

        let m3 = TlvWriter::new()
            .add_state(3)
            .add(TlvType::EncryptedData, &encrypted)
            .build();

        self.state = State::SentM3;
        Ok(m3)
    }

    /// Consume M4 (empty on success). Completes the exchange.
    pub fn response2(&mut self, data: &[u8]) -> Result<(), PairingError> {
        if !matches!(self.state, State::SentM3) {
            return Err(PairingError::OutOfSequence("M4 before M3"));
        }

        self.read_checked(data, 4)?;
        self.state = State::Done;
        Ok(())
    }

    /// The 32-byte Curve25519 shared secret once verification completed
    #[must_use]
    pub fn shared_secret(&self) -> Option<&[u8; 32]> {
        matches!(self.state, State::Done).then_some(&self.shared_secret)
    }

    fn verify_encrypt_key(&self) -> Result<[u8; 32], PairingError> {
        let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), &self.shared_secret);
        Ok(hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info")?)
    }

    fn read_checked(&mut self, data: &[u8], expected_state: u8) -> Result<TlvReader, PairingError> {
        let tlv = TlvReader::parse(data)?;

        if let Some(code) = tlv.error_code() {
            self.state = State::Failed;
            return Err(PairingError::PeerError { code });
        }

        let state = tlv.state()?;
        if state != expected_state {
            self.state = State::Failed;
            return Err(PairingError::UnexpectedState {
                expected: expected_state,
                actual: state,
            });
        }

        Ok(tlv)
    }
}
