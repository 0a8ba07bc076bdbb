//! Controller side of pair-setup.
//!
//! Normal mode runs all six messages and ends with an exchange of long-term
//! ed25519 keys which the caller persists as the device's authorisation key.
//! Transient mode stops after M4; the 64-byte SRP session key becomes the
//! shared secret directly and nothing is persisted.

use zeroize::Zeroize;

use crate::crypto::{
    ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, HkdfSha512, Nonce,
    SrpClient, SrpVerifier,
};

use super::storage::PairingKeys;
use super::tlv::{TlvReader, TlvType, TlvWriter, flags, methods};
use super::{PairingError, SETUP_USERNAME};

/// Which pair-setup variant to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    /// Six messages, user PIN, long-term keys exchanged and persisted
    Normal,
    /// Four messages, fixed PIN, no persistence
    Transient,
}

enum State {
    New,
    SentM1,
    GotM2 { verifier: SrpVerifier },
    SentM3 { verifier: SrpVerifier },
    GotM4,
    SentM5,
    Done,
    Failed,
}

/// One single-shot pair-setup exchange
pub struct PairSetup {
    mode: SetupMode,
    client_id: String,
    pin: String,
    srp: Option<SrpClient>,
    signing_keypair: Ed25519KeyPair,
    session_key: Vec<u8>,
    device_ltpk: Option<Vec<u8>>,
    device_id: Option<Vec<u8>>,
    state: State,
}

impl PairSetup {
    /// `client_id` is our persistent identifier (the library hash in hex);
    /// `pin` is the user PIN in normal mode and ignored in transient mode.
    #[must_use]
    pub fn new(mode: SetupMode, client_id: &str, pin: &str) -> Self {
        Self {
            mode,
            client_id: client_id.to_string(),
            pin: match mode {
                SetupMode::Normal => pin.to_string(),
                SetupMode::Transient => super::TRANSIENT_PIN.to_string(),
            },
            srp: None,
            signing_keypair: Ed25519KeyPair::generate(),
            session_key: Vec::new(),
            device_ltpk: None,
            device_id: None,
            state: State::New,
        }
    }

    /// Build M1
    pub fn request1(&mut self) -> Result<Vec<u8>, PairingError> {
        if !matches!(self.state, State::New) {
            return Err(PairingError::OutOfSequence("M1 already sent"));
        }

        let mut writer = TlvWriter::new()
            .add_state(1)
            .add_u8(TlvType::Method, methods::PAIR_SETUP);
        if self.mode == SetupMode::Transient {
            writer = writer.add_u8(TlvType::Flags, flags::TRANSIENT);
        }

        self.state = State::SentM1;
        Ok(writer.build())
    }

    /// Consume M2 (salt + server public key)
    pub fn response1(&mut self, data: &[u8]) -> Result<(), PairingError> {
        if !matches!(self.state, State::SentM1) {
            return Err(PairingError::OutOfSequence("M2 before M1"));
        }

        let tlv = self.read_checked(data, 2)?;
        let salt = tlv.get_required(TlvType::Salt)?;
        let server_public = tlv.get_required(TlvType::PublicKey)?;

        let srp = SrpClient::new()?;
        let verifier = srp.process_challenge(
            SETUP_USERNAME.as_bytes(),
            self.pin.as_bytes(),
            salt,
            server_public,
        )?;

        self.srp = Some(srp);
        self.state = State::GotM2 { verifier };
        Ok(())
    }

    /// Build M3 (our public key + SRP proof)
    pub fn request2(&mut self) -> Result<Vec<u8>, PairingError> {
        let State::GotM2 { verifier } = std::mem::replace(&mut self.state, State::Failed) else {
            return Err(PairingError::OutOfSequence("M3 before M2"));
        };

        let srp = self
            .srp
            .as_ref()
            .ok_or(PairingError::OutOfSequence("SRP context missing"))?;

        let m3 = TlvWriter::new()
            .add_state(3)
            .add(TlvType::PublicKey, srp.public_key())
            .add(TlvType::Proof, verifier.client_proof())
            .build();

        self.state = State::SentM3 { verifier };
        Ok(m3)
    }

    /// Consume M4 (server proof). Completes the exchange in transient mode.
    pub fn response2(&mut self, data: &[u8]) -> Result<(), PairingError> {
        let State::SentM3 { verifier } = std::mem::replace(&mut self.state, State::Failed) else {
            return Err(PairingError::OutOfSequence("M4 before M3"));
        };

        let tlv = self.read_checked(data, 4)?;
        let server_proof = tlv.get_required(TlvType::Proof)?;

        let session_key = verifier
            .verify_server(server_proof)
            .map_err(|_| PairingError::AuthenticationFailed("SRP proof mismatch"))?;
        self.session_key = session_key.as_bytes().to_vec();

        self.state = match self.mode {
            SetupMode::Transient => State::Done,
            SetupMode::Normal => State::GotM4,
        };
        Ok(())
    }

    /// Build M5: our long-term public key, signed, inside an encrypted
    /// sub-TLV. Normal mode only.
    pub fn request3(&mut self) -> Result<Vec<u8>, PairingError> {
        if !matches!(self.state, State::GotM4) {
            return Err(PairingError::OutOfSequence("M5 before M4"));
        }

        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Controller-Sign-Salt"), &self.session_key);
        let mut sign_data = hkdf.expand(b"Pair-Setup-Controller-Sign-Info", 32)?;
        sign_data.extend_from_slice(self.client_id.as_bytes());
        sign_data.extend_from_slice(self.signing_keypair.public_key().as_bytes());

        let signature = self.signing_keypair.sign(&sign_data);

        let sub_tlv = TlvWriter::new()
            .add(TlvType::Identifier, self.client_id.as_bytes())
            .add(TlvType::PublicKey, self.signing_keypair.public_key().as_bytes())
            .add(TlvType::Signature, &signature.to_bytes())
            .build();

        let cipher = ChaCha20Poly1305Cipher::new(&self.setup_encrypt_key()?)?;
        let encrypted = cipher.encrypt(&Nonce::from_label(b"PS-Msg05"), &sub_tlv)?;

        let m5 = TlvWriter::new()
            .add_state(5)
            .add(TlvType::EncryptedData, &encrypted)
            .build();

        self.state = State::SentM5;
        Ok(m5)
    }

    /// Consume M6 (device identity). Completes normal pair-setup.
    pub fn response3(&mut self, data: &[u8]) -> Result<(), PairingError> {
        if !matches!(self.state, State::SentM5) {
            return Err(PairingError::OutOfSequence("M6 before M5"));
        }

        let tlv = self.read_checked(data, 6)?;
        let encrypted = tlv.get_required(TlvType::EncryptedData)?;

        let cipher = ChaCha20Poly1305Cipher::new(&self.setup_encrypt_key()?)?;
        let decrypted = cipher.decrypt(&Nonce::from_label(b"PS-Msg06"), encrypted)?;

        let sub_tlv = TlvReader::parse(&decrypted)?;
        let device_ltpk = sub_tlv.get_required(TlvType::PublicKey)?.to_vec();
        let device_id = sub_tlv.get_required(TlvType::Identifier)?.to_vec();
        let signature_bytes = sub_tlv.get_required(TlvType::Signature)?;

        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Accessory-Sign-Salt"), &self.session_key);
        let mut signed_data = hkdf.expand(b"Pair-Setup-Accessory-Sign-Info", 32)?;
        signed_data.extend_from_slice(&device_id);
        signed_data.extend_from_slice(&device_ltpk);

        let public_key = Ed25519PublicKey::from_bytes(&device_ltpk)?;
        let signature = Ed25519Signature::from_bytes(signature_bytes)?;
        public_key
            .verify(&signed_data, &signature)
            .map_err(|_| PairingError::SignatureVerificationFailed)?;

        self.device_ltpk = Some(device_ltpk);
        self.device_id = Some(device_id);
        self.state = State::Done;
        Ok(())
    }

    /// The shared secret once the exchange has completed: the 64-byte SRP
    /// session key. The first 32 bytes double as the audio key.
    #[must_use]
    pub fn shared_secret(&self) -> Option<&[u8]> {
        matches!(self.state, State::Done).then_some(self.session_key.as_slice())
    }

    /// The keys to persist after a completed normal pair-setup
    #[must_use]
    pub fn keys(&self) -> Option<PairingKeys> {
        if !matches!(self.state, State::Done) {
            return None;
        }
        let device_ltpk = self.device_ltpk.as_ref()?;
        Some(PairingKeys {
            client_secret: self.signing_keypair.secret_bytes().to_vec(),
            client_public: self.signing_keypair.public_key().as_bytes().to_vec(),
            device_public: device_ltpk.clone(),
            device_id: String::from_utf8_lossy(self.device_id.as_deref()?).to_string(),
        })
    }

    fn setup_encrypt_key(&self) -> Result<[u8; 32], PairingError> {
        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), &self.session_key);
        Ok(hkdf.expand_fixed::<32>(b"Pair-Setup-Encrypt-Info")?)
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

impl Drop for PairSetup {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}
