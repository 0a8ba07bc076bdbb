//! Accessory side of pair-setup and pair-verify.
//!
//! This is the role a speaker plays. It exists here for the mock speaker the
//! integration tests stream to, and to give the SRP layer a real peer; it
//! does not implement pairing administration (add/remove/list pairings).

use rand::RngCore;

use crate::crypto::{
    ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, HkdfSha512, Nonce,
    SrpServer, X25519KeyPair, X25519PublicKey,
};

use super::tlv::{TlvReader, TlvType, TlvWriter, errors, flags};
use super::{PairingError, SETUP_USERNAME};

/// Build the Error TLV an accessory answers with when a step fails
#[must_use]
pub fn error_reply(state: u8, code: u8) -> Vec<u8> {
    TlvWriter::new()
        .add_state(state)
        .add_u8(TlvType::Error, code)
        .build()
}

enum SetupState {
    New,
    SentM2 { transient: bool },
    SentM4,
    Done,
    Failed,
}

/// Accessory pair-setup endpoint. Handles both transient and normal mode,
/// selected by the controller's M1 flags.
pub struct PairSetupServer {
    accessory_id: String,
    srp: SrpServer,
    signing_keypair: Ed25519KeyPair,
    session_key: Vec<u8>,
    controller_ltpk: Option<Vec<u8>>,
    state: SetupState,
}

impl PairSetupServer {
    pub fn new(accessory_id: &str, pin: &str) -> Result<Self, PairingError> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        Ok(Self {
            accessory_id: accessory_id.to_string(),
            srp: SrpServer::new(SETUP_USERNAME.as_bytes(), pin.as_bytes(), &salt)?,
            signing_keypair: Ed25519KeyPair::generate(),
            session_key: Vec::new(),
            controller_ltpk: None,
            state: SetupState::New,
        })
    }

    /// Process one controller request, returning the reply TLV. On error the
    /// reply is an Error TLV and the context is dead.
    pub fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        match self.step(request) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("pair-setup failed: {e}");
                let state = match self.state {
                    SetupState::SentM2 { .. } => 4,
                    SetupState::SentM4 => 6,
                    _ => 2,
                };
                self.state = SetupState::Failed;
                error_reply(state, e.tlv_code())
            }
        }
    }

    fn step(&mut self, request: &[u8]) -> Result<Vec<u8>, PairingError> {
        let tlv = TlvReader::parse(request)?;
        let state = tlv.state()?;

        match (&self.state, state) {
            (SetupState::New, 1) => {
                let transient = tlv
                    .get(TlvType::Flags)
                    .is_some_and(|f| f.first().is_some_and(|b| b & flags::TRANSIENT != 0));

                let m2 = TlvWriter::new()
                    .add_state(2)
                    .add(TlvType::Salt, self.srp.salt())
                    .add(TlvType::PublicKey, self.srp.public_key())
                    .build();

                self.state = SetupState::SentM2 { transient };
                Ok(m2)
            }
            (SetupState::SentM2 { transient }, 3) => {
                let transient = *transient;
                let client_public = tlv.get_required(TlvType::PublicKey)?;
                let client_proof = tlv.get_required(TlvType::Proof)?;

                let (m2_proof, session_key) = self
                    .srp
                    .verify_client(client_public, client_proof)
                    .map_err(|_| PairingError::AuthenticationFailed("SRP proof mismatch"))?;
                self.session_key = session_key.as_bytes().to_vec();

                let m4 = TlvWriter::new()
                    .add_state(4)
                    .add(TlvType::Proof, &m2_proof)
                    .build();

                self.state = if transient {
                    SetupState::Done
                } else {
                    SetupState::SentM4
                };
                Ok(m4)
            }
            (SetupState::SentM4, 5) => {
                let encrypted = tlv.get_required(TlvType::EncryptedData)?;

                let cipher = ChaCha20Poly1305Cipher::new(&self.setup_encrypt_key()?)?;
                let decrypted = cipher.decrypt(&Nonce::from_label(b"PS-Msg05"), encrypted)?;

                let sub_tlv = TlvReader::parse(&decrypted)?;
                let controller_id = sub_tlv.get_required(TlvType::Identifier)?;
                let controller_ltpk = sub_tlv.get_required(TlvType::PublicKey)?.to_vec();
                let signature =
                    Ed25519Signature::from_bytes(sub_tlv.get_required(TlvType::Signature)?)?;

                let hkdf =
                    HkdfSha512::new(Some(b"Pair-Setup-Controller-Sign-Salt"), &self.session_key);
                let mut signed_data = hkdf.expand(b"Pair-Setup-Controller-Sign-Info", 32)?;
                signed_data.extend_from_slice(controller_id);
                signed_data.extend_from_slice(&controller_ltpk);

                Ed25519PublicKey::from_bytes(&controller_ltpk)?
                    .verify(&signed_data, &signature)
                    .map_err(|_| PairingError::SignatureVerificationFailed)?;

                // Our own signed identity back in M6
                let hkdf =
                    HkdfSha512::new(Some(b"Pair-Setup-Accessory-Sign-Salt"), &self.session_key);
                let mut sign_data = hkdf.expand(b"Pair-Setup-Accessory-Sign-Info", 32)?;
                sign_data.extend_from_slice(self.accessory_id.as_bytes());
                sign_data.extend_from_slice(self.signing_keypair.public_key().as_bytes());

                let our_signature = self.signing_keypair.sign(&sign_data);

                let reply_tlv = TlvWriter::new()
                    .add(TlvType::Identifier, self.accessory_id.as_bytes())
                    .add(
                        TlvType::PublicKey,
                        self.signing_keypair.public_key().as_bytes(),
                    )
                    .add(TlvType::Signature, &our_signature.to_bytes())
                    .build();

                let cipher = ChaCha20Poly1305Cipher::new(&self.setup_encrypt_key()?)?;
                let encrypted = cipher.encrypt(&Nonce::from_label(b"PS-Msg06"), &reply_tlv)?;

                let m6 = TlvWriter::new()
                    .add_state(6)
                    .add(TlvType::EncryptedData, &encrypted)
                    .build();

                self.controller_ltpk = Some(controller_ltpk);
                self.state = SetupState::Done;
                Ok(m6)
            }
            (_, actual) => Err(PairingError::UnexpectedState {
                expected: self.expected_state(),
                actual,
            }),
        }
    }

    /// The 64-byte SRP session key after M4 (transient) or M6 (normal)
    #[must_use]
    pub fn shared_secret(&self) -> Option<&[u8]> {
        matches!(self.state, SetupState::Done).then_some(self.session_key.as_slice())
    }

    /// The controller's long-term public key, set after a normal M5
    #[must_use]
    pub fn controller_ltpk(&self) -> Option<&[u8]> {
        self.controller_ltpk.as_deref()
    }

    /// Our long-term keypair, shared with the verify endpoint
    #[must_use]
    pub fn signing_secret(&self) -> [u8; 32] {
        self.signing_keypair.secret_bytes()
    }

    fn setup_encrypt_key(&self) -> Result<[u8; 32], PairingError> {
        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), &self.session_key);
        Ok(hkdf.expand_fixed::<32>(b"Pair-Setup-Encrypt-Info")?)
    }

    fn expected_state(&self) -> u8 {
        match self.state {
            SetupState::New => 1,
            SetupState::SentM2 { .. } => 3,
            SetupState::SentM4 => 5,
            SetupState::Done | SetupState::Failed => 0,
        }
    }
}

enum VerifyState {
    New,
    SentM2,
    Done,
    Failed,
}

/// Accessory pair-verify endpoint
pub struct PairVerifyServer {
    accessory_id: String,
    signing_keypair: Ed25519KeyPair,
    controller_ltpk: Option<Vec<u8>>,
    eph: X25519KeyPair,
    client_eph: Option<X25519PublicKey>,
    shared_secret: [u8; 32],
    state: VerifyState,
}

impl PairVerifyServer {
    /// `controller_ltpk` is the key learned during normal pair-setup; when
    /// `None` the M3 signature is not checked (transient-style peers never
    /// get here, but the mock speaker allows it for loose tests).
    #[must_use]
    pub fn new(
        accessory_id: &str,
        signing_secret: &[u8; 32],
        controller_ltpk: Option<Vec<u8>>,
    ) -> Self {
        Self {
            accessory_id: accessory_id.to_string(),
            signing_keypair: Ed25519KeyPair::from_secret_bytes(signing_secret),
            controller_ltpk,
            eph: X25519KeyPair::generate(),
            client_eph: None,
            shared_secret: [0u8; 32],
            state: VerifyState::New,
        }
    }

    pub fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        match self.step(request) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("pair-verify failed: {e}");
                let state = if matches!(self.state, VerifyState::SentM2) { 4 } else { 2 };
                self.state = VerifyState::Failed;
                error_reply(state, errors::AUTHENTICATION)
            }
        }
    }

    fn step(&mut self, request: &[u8]) -> Result<Vec<u8>, PairingError> {
        let tlv = TlvReader::parse(request)?;
        let state = tlv.state()?;

        match (&self.state, state) {
            (VerifyState::New, 1) => {
                let client_eph =
                    X25519PublicKey::from_bytes(tlv.get_required(TlvType::PublicKey)?)?;

                let shared = self.eph.diffie_hellman(&client_eph);
                self.shared_secret = *shared.as_bytes();

                // Sign server_eph || accessory_id || client_eph
                let mut sign_data = Vec::with_capacity(64 + self.accessory_id.len());
                sign_data.extend_from_slice(self.eph.public_key().as_bytes());
                sign_data.extend_from_slice(self.accessory_id.as_bytes());
                sign_data.extend_from_slice(client_eph.as_bytes());

                let signature = self.signing_keypair.sign(&sign_data);

                let sub_tlv = TlvWriter::new()
                    .add(TlvType::Identifier, self.accessory_id.as_bytes())
                    .add(TlvType::Signature, &signature.to_bytes())
                    .build();

                let cipher = ChaCha20Poly1305Cipher::new(&self.verify_encrypt_key()?)?;
                let encrypted = cipher.encrypt(&Nonce::from_label(b"PV-Msg02"), &sub_tlv)?;

                let m2 = TlvWriter::new()
                    .add_state(2)
                    .add(TlvType::PublicKey, self.eph.public_key().as_bytes())
                    .add(TlvType::EncryptedData, &encrypted)
                    .build();

                self.client_eph = Some(client_eph);
                self.state = VerifyState::SentM2;
                Ok(m2)
            }
            (VerifyState::SentM2, 3) => {
                let encrypted = tlv.get_required(TlvType::EncryptedData)?;

                let cipher = ChaCha20Poly1305Cipher::new(&self.verify_encrypt_key()?)?;
                let decrypted = cipher.decrypt(&Nonce::from_label(b"PV-Msg03"), encrypted)?;

                let sub_tlv = TlvReader::parse(&decrypted)?;
                let controller_id = sub_tlv.get_required(TlvType::Identifier)?;

                if let Some(ltpk) = &self.controller_ltpk {
                    let client_eph = self
                        .client_eph
                        .ok_or(PairingError::OutOfSequence("client key missing"))?;
                    let signature =
                        Ed25519Signature::from_bytes(sub_tlv.get_required(TlvType::Signature)?)?;

                    let mut signed_data = Vec::with_capacity(64 + controller_id.len());
                    signed_data.extend_from_slice(client_eph.as_bytes());
                    signed_data.extend_from_slice(controller_id);
                    signed_data.extend_from_slice(self.eph.public_key().as_bytes());

                    Ed25519PublicKey::from_bytes(ltpk)?
                        .verify(&signed_data, &signature)
                        .map_err(|_| PairingError::SignatureVerificationFailed)?;
                }

                self.state = VerifyState::Done;
                Ok(TlvWriter::new().add_state(4).build())
            }
            (_, actual) => Err(PairingError::UnexpectedState {
                expected: if matches!(self.state, VerifyState::New) { 1 } else { 3 },
                actual,
            }),
        }
    }

    /// The 32-byte Curve25519 shared secret after M4 was sent
    #[must_use]
    pub fn shared_secret(&self) -> Option<&[u8; 32]> {
        matches!(self.state, VerifyState::Done).then_some(&self.shared_secret)
    }

    fn verify_encrypt_key(&self) -> Result<[u8; 32], PairingError> {
        let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), &self.shared_secret);
        Ok(hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info")?)
    }
}
