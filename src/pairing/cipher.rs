//! Framed ChaCha20-Poly1305 transport used on the RTSP control connection and
//! the reverse event channel once pairing has completed.
//!
//! The wire format is a sequence of blocks, each
//! `<u16 length little-endian><ciphertext><16-byte tag>` where the length
//! field doubles as the AEAD associated data. Plaintext over 0x400 bytes is
//! split across blocks. Each direction has its own key and block counter; the
//! counter forms the low 8 bytes of the nonce.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::{ChaCha20Poly1305Cipher, CryptoError, HkdfSha512, Nonce, lengths};

use super::PairingError;

/// Maximum plaintext bytes per block
pub const BLOCK_LEN_MAX: usize = 0x400;

/// Which derived key pair a context uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The RTSP control connection
    Control,
    /// The reverse event connection
    Events,
}

/// Which end of the connection we are. The event channel is opened by the
/// device towards us, so read/write keys are swapped for the accessory role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Accessory,
}

struct CipherStream {
    cipher: ChaCha20Poly1305Cipher,
    counter: u64,
    rollback: u64,
}

impl CipherStream {
    fn new(key: &[u8; 32]) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: ChaCha20Poly1305Cipher::new(key)?,
            counter: 0,
            rollback: 0,
        })
    }
}

/// Bidirectional framed cipher for one paired connection
pub struct CipherContext {
    write: CipherStream,
    read: CipherStream,
}

impl CipherContext {
    /// Derive the two stream keys from the pairing shared secret
    pub fn new(shared_secret: &[u8], channel: Channel, role: Role) -> Result<Self, PairingError> {
        let (salt, write_info, read_info): (&[u8], &[u8], &[u8]) = match channel {
            Channel::Control => (
                b"Control-Salt",
                b"Control-Write-Encryption-Key",
                b"Control-Read-Encryption-Key",
            ),
            Channel::Events => (
                b"Events-Salt",
                b"Events-Write-Encryption-Key",
                b"Events-Read-Encryption-Key",
            ),
        };

        let hkdf = HkdfSha512::new(Some(salt), shared_secret);
        let write_key = hkdf.expand_fixed::<32>(write_info)?;
        let read_key = hkdf.expand_fixed::<32>(read_info)?;

        let (write_key, read_key) = match role {
            Role::Controller => (write_key, read_key),
            Role::Accessory => (read_key, write_key),
        };

        Ok(Self {
            write: CipherStream::new(&write_key)?,
            read: CipherStream::new(&read_key)?,
        })
    }

    /// Encrypt a plaintext into one or more framed blocks
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, PairingError> {
        self.write.rollback = self.write.counter;

        let nblocks = plaintext.len().div_ceil(BLOCK_LEN_MAX);
        let mut output = Vec::with_capacity(plaintext.len() + nblocks * (2 + lengths::CHACHA_TAG));

        for chunk in plaintext.chunks(BLOCK_LEN_MAX) {
            let mut len_bytes = [0u8; 2];
            #[allow(clippy::cast_possible_truncation)]
            LittleEndian::write_u16(&mut len_bytes, chunk.len() as u16);

            let nonce = Nonce::from_counter(self.write.counter);
            let mut block = chunk.to_vec();
            let tag = self
                .write
                .cipher
                .encrypt_detached(&nonce, &len_bytes, &mut block)?;

            output.extend_from_slice(&len_bytes);
            output.extend_from_slice(&block);
            output.extend_from_slice(&tag);

            self.write.counter += 1;
        }

        Ok(output)
    }

    /// Decrypt as many complete blocks as the input holds. Returns the
    /// plaintext and the number of input bytes consumed; a trailing partial
    /// block is left for the caller to retry with more data.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), PairingError> {
        self.read.rollback = self.read.counter;

        let mut plaintext = Vec::with_capacity(data.len());
        let mut consumed = 0;

        while data.len() - consumed >= 2 + lengths::CHACHA_TAG {
            let len_bytes = &data[consumed..consumed + 2];
            let block_len = LittleEndian::read_u16(len_bytes) as usize;

            if data.len() - consumed < 2 + block_len + lengths::CHACHA_TAG {
                break;
            }

            let nonce = Nonce::from_counter(self.read.counter);
            let mut block = data[consumed + 2..consumed + 2 + block_len].to_vec();
            let tag = &data[consumed + 2 + block_len..consumed + 2 + block_len + lengths::CHACHA_TAG];

            self.read
                .cipher
                .decrypt_detached(&nonce, len_bytes, &mut block, tag)?;

            plaintext.extend_from_slice(&block);
            consumed += 2 + block_len + lengths::CHACHA_TAG;
            self.read.counter += 1;
        }

        Ok((plaintext, consumed))
    }

    /// Undo the counter advance of the last `encrypt` call, so the next call
    /// reproduces the same ciphertext. Used when a send fails after the
    /// plaintext was already ciphered.
    pub fn encrypt_rollback(&mut self) {
        self.write.counter = self.write.rollback;
    }

    /// Undo the counter advance of the last `decrypt` call
    pub fn decrypt_rollback(&mut self) {
        self.read.counter = self.read.rollback;
    }

    /// Current write-side block counter
    #[must_use]
    pub fn write_counter(&self) -> u64 {
        self.write.counter
    }

    /// Current read-side block counter
    #[must_use]
    pub fn read_counter(&self) -> u64 {
        self.read.counter
    }
}
