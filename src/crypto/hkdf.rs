use hkdf::Hkdf;
use sha2::Sha512;

use super::CryptoError;

/// HKDF-SHA512 key derivation, the only KDF the pairing protocol uses
pub struct HkdfSha512 {
    hkdf: Hkdf<Sha512>,
}

impl HkdfSha512 {
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            hkdf: Hkdf::<Sha512>::new(salt, ikm),
        }
    }

    pub fn expand(&self, info: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
        let mut okm = vec![0u8; length];
        self.hkdf
            .expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed("HKDF expand failed".into()))?;
        Ok(okm)
    }

    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N], CryptoError> {
        let mut okm = [0u8; N];
        self.hkdf
            .expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed("HKDF expand failed".into()))?;
        Ok(okm)
    }
}
