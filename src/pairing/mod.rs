//! HomeKit pairing: pair-setup (normal and transient), pair-verify, and the
//! derived framed transport cipher.
//!
//! The controller role drives real speakers; the accessory role backs the
//! mock speaker used by the integration tests. Message layouts follow the
//! HomeKit Accessory Protocol: six-message SRP pair-setup (four in transient
//! mode) and four-message Curve25519/Ed25519 pair-verify, all TLV8 over
//! `application/octet-stream` POST bodies.

pub mod cipher;
pub mod server;
pub mod setup;
pub mod storage;
pub mod tlv;
pub mod verify;

#[cfg(test)]
mod tests;

pub use cipher::{Channel, CipherContext, Role};
pub use server::{PairSetupServer, PairVerifyServer};
pub use setup::{PairSetup, SetupMode};
pub use storage::PairingKeys;
pub use tlv::{TlvError, TlvReader, TlvType, TlvWriter};
pub use verify::PairVerify;

use crate::crypto::CryptoError;

/// The SRP username and fallback PIN used by transient pair-setup
pub const SETUP_USERNAME: &str = "Pair-Setup";

/// Fixed passphrase used when the device advertises transient pairing
pub const TRANSIENT_PIN: &str = "3939";

/// Pairing failures. All of them are fatal for the session that hit them;
/// pair-setup is single-shot.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("unexpected message: expected state {expected}, got {actual}")]
    UnexpectedState { expected: u8, actual: u8 },

    #[error("message out of sequence: {0}")]
    OutOfSequence(&'static str),

    #[error("peer returned error code {code}")]
    PeerError { code: u8 },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl PairingError {
    /// Error TLV code to send to the peer when acting as accessory
    #[must_use]
    pub fn tlv_code(&self) -> u8 {
        match self {
            Self::AuthenticationFailed(_) | Self::SignatureVerificationFailed => {
                tlv::errors::AUTHENTICATION
            }
            Self::PeerError { code } => *code,
            _ => tlv::errors::UNKNOWN,
        }
    }
}
