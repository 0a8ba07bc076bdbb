use chacha20poly1305::aead::{Aead, AeadInPlace, Payload};
use chacha20poly1305::{ChaCha20Poly1305 as ChaChaImpl, KeyInit, Tag};

use super::{CryptoError, lengths};

/// 12-byte nonce for ChaCha20-Poly1305
#[derive(Clone, Copy)]
pub struct Nonce([u8; 12]);

impl Nonce {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != lengths::CHACHA_NONCE {
            return Err(CryptoError::InvalidKeyLength {
                expected: lengths::CHACHA_NONCE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 12];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Nonce from a u64 block counter: 4 zero bytes then counter little-endian
    pub fn from_counter(counter: u64) -> Self {
        let mut arr = [0u8; 12];
        arr[4..12].copy_from_slice(&counter.to_le_bytes());
        Self(arr)
    }

    /// Nonce from a big-endian RTP sequence number: 4 zero bytes then seqnum
    /// as the low 8 bytes big-endian. Retransmitted packets reuse the nonce
    /// together with the original plaintext.
    pub fn from_seqnum(seqnum: u16) -> Self {
        let mut arr = [0u8; 12];
        arr[4..12].copy_from_slice(&u64::from(seqnum).to_be_bytes());
        Self(arr)
    }

    /// Nonce from an 8-byte ASCII message label ("PS-Msg05" etc.), zero-padded
    /// to 12 bytes on the left
    pub fn from_label(label: &[u8; 8]) -> Self {
        let mut arr = [0u8; 12];
        arr[4..].copy_from_slice(label);
        Self(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// ChaCha20-Poly1305 AEAD cipher
pub struct ChaCha20Poly1305Cipher {
    cipher: ChaChaImpl,
}

impl ChaCha20Poly1305Cipher {
    /// Create cipher with a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher = ChaChaImpl::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: lengths::CHACHA_KEY,
            actual: key.len(),
        })?;

        Ok(Self { cipher })
    }

    /// Encrypt; returns ciphertext with the 16-byte tag appended
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Encrypt with associated data; tag appended
    pub fn encrypt_with_aad(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Encrypt in place with a detached tag, for wire formats that place the
    /// tag themselves (framed control blocks, RTP payloads)
    pub fn encrypt_detached(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; 16], CryptoError> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(&nonce.0), aad, buffer)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(tag.into())
    }

    /// Decrypt and verify; input is ciphertext with the tag appended
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Decrypt with associated data
    pub fn decrypt_with_aad(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Decrypt in place with a detached tag
    pub fn decrypt_detached(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if tag.len() != lengths::CHACHA_TAG {
            return Err(CryptoError::DecryptionFailed("short tag".into()));
        }
        self.cipher
            .decrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                aad,
                buffer,
                Tag::from_slice(tag),
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}
