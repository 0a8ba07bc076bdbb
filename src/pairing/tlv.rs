//! TLV8, the type-length-value encoding used by every HomeKit pairing message

use std::collections::HashMap;
use thiserror::Error;

/// TLV type codes used by pair-setup and pair-verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    /// Pairing method
    Method = 0x00,
    /// Pairing identifier (device id string)
    Identifier = 0x01,
    /// SRP salt
    Salt = 0x02,
    /// SRP or Curve25519 public key
    PublicKey = 0x03,
    /// SRP proof
    Proof = 0x04,
    /// ChaCha20-Poly1305 encrypted sub-TLV
    EncryptedData = 0x05,
    /// Message state (M1..M6)
    State = 0x06,
    /// Error code
    Error = 0x07,
    /// Seconds to wait before retrying
    RetryDelay = 0x08,
    /// Ed25519 signature
    Signature = 0x0a,
    /// Pairing type flags
    Flags = 0x13,
    /// Item separator (zero length)
    Separator = 0xff,
}

impl TlvType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Method),
            0x01 => Some(Self::Identifier),
            0x02 => Some(Self::Salt),
            0x03 => Some(Self::PublicKey),
            0x04 => Some(Self::Proof),
            0x05 => Some(Self::EncryptedData),
            0x06 => Some(Self::State),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::RetryDelay),
            0x0a => Some(Self::Signature),
            0x13 => Some(Self::Flags),
            0xff => Some(Self::Separator),
            _ => None,
        }
    }
}

/// TLV structure errors
#[derive(Debug, Error)]
pub enum TlvError {
    #[error("truncated TLV item")]
    Truncated,

    #[error("missing required field: {0:?}")]
    MissingField(TlvType),

    #[error("invalid value for {0:?}")]
    InvalidValue(TlvType),
}

/// Builds a TLV8 blob. Values over 255 bytes are emitted as consecutive
/// entries of the same type, the last one shorter than 255.
pub struct TlvWriter {
    buffer: Vec<u8>,
}

impl TlvWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    #[must_use]
    pub fn add(mut self, tlv_type: TlvType, value: &[u8]) -> Self {
        if value.is_empty() {
            self.buffer.push(tlv_type as u8);
            self.buffer.push(0);
            return self;
        }

        for chunk in value.chunks(255) {
            self.buffer.push(tlv_type as u8);
            #[allow(clippy::cast_possible_truncation)]
            self.buffer.push(chunk.len() as u8);
            self.buffer.extend_from_slice(chunk);
        }

        self
    }

    #[must_use]
    pub fn add_u8(self, tlv_type: TlvType, value: u8) -> Self {
        self.add(tlv_type, &[value])
    }

    #[must_use]
    pub fn add_state(self, state: u8) -> Self {
        self.add_u8(TlvType::State, state)
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for TlvWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed TLV8 blob. Entries of the same type are coalesced back into a
/// single logical value.
pub struct TlvReader {
    items: HashMap<u8, Vec<u8>>,
}

impl TlvReader {
    /// Parse a complete TLV8 blob
    ///
    /// # Errors
    ///
    /// Returns `TlvError::Truncated` if an item runs past the end of input.
    pub fn parse(data: &[u8]) -> Result<Self, TlvError> {
        let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
        let mut pos = 0;

        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(TlvError::Truncated);
            }

            let tlv_type = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;

            if pos + length > data.len() {
                return Err(TlvError::Truncated);
            }

            items
                .entry(tlv_type)
                .or_default()
                .extend_from_slice(&data[pos..pos + length]);
            pos += length;
        }

        Ok(Self { items })
    }

    #[must_use]
    pub fn get(&self, tlv_type: TlvType) -> Option<&[u8]> {
        self.items.get(&(tlv_type as u8)).map(Vec::as_slice)
    }

    pub fn get_required(&self, tlv_type: TlvType) -> Result<&[u8], TlvError> {
        self.get(tlv_type).ok_or(TlvError::MissingField(tlv_type))
    }

    /// The message state (M1..M6)
    pub fn state(&self) -> Result<u8, TlvError> {
        let value = self.get_required(TlvType::State)?;
        if value.len() != 1 {
            return Err(TlvError::InvalidValue(TlvType::State));
        }
        Ok(value[0])
    }

    #[must_use]
    pub fn error_code(&self) -> Option<u8> {
        self.get(TlvType::Error).and_then(|v| v.first().copied())
    }
}

/// Pairing method codes carried in Method(0)
pub mod methods {
    pub const PAIR_SETUP: u8 = 0;
    pub const PAIR_SETUP_AUTH: u8 = 1;
    pub const PAIR_VERIFY: u8 = 2;
}

/// Error codes carried in Error(7)
pub mod errors {
    pub const UNKNOWN: u8 = 0x01;
    pub const AUTHENTICATION: u8 = 0x02;
    pub const BACKOFF: u8 = 0x03;
    pub const MAX_PEERS: u8 = 0x04;
    pub const MAX_TRIES: u8 = 0x05;
    pub const UNAVAILABLE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;
}

/// Flag bits carried in Flags(19)
pub mod flags {
    /// Transient pair-setup: end at M4 with the SRP key as shared secret
    pub const TRANSIENT: u8 = 0x10;
}
