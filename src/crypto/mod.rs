//! Cryptographic primitives backing HomeKit pairing and stream ciphering

mod chacha;
mod ed25519;
mod error;
mod hkdf;
mod srp;
#[cfg(test)]
mod tests;
mod x25519;

pub use self::chacha::{ChaCha20Poly1305Cipher, Nonce};
pub use self::ed25519::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};
pub use self::error::CryptoError;
pub use self::hkdf::HkdfSha512;
pub use self::srp::{SessionKey, SrpClient, SrpServer, SrpVerifier};
pub use self::x25519::{X25519KeyPair, X25519PublicKey, X25519SharedSecret};

/// Lengths of the fixed-size cryptographic values used by the pairing protocol
pub mod lengths {
    /// SRP public key length (3072-bit group, big-endian, left-padded)
    pub const SRP_PUBLIC_KEY: usize = 384;
    /// SRP session key length (SHA-512 digest of S)
    pub const SRP_SESSION_KEY: usize = 64;
    /// Ed25519 public key length
    pub const ED25519_PUBLIC_KEY: usize = 32;
    /// Ed25519 signature length
    pub const ED25519_SIGNATURE: usize = 64;
    /// X25519 public key and shared secret length
    pub const X25519_KEY: usize = 32;
    /// ChaCha20-Poly1305 key length
    pub const CHACHA_KEY: usize = 32;
    /// ChaCha20-Poly1305 nonce length
    pub const CHACHA_NONCE: usize = 12;
    /// ChaCha20-Poly1305 tag length
    pub const CHACHA_TAG: usize = 16;
}
