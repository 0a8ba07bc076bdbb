//! Persistence for pairing keys.
//!
//! A completed normal pair-setup yields our long-term ed25519 keypair plus
//! the device's public key; the whole bundle is the device's authorisation
//! key and must survive restarts, or the speaker would demand a new PIN
//! every time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Key material from a completed normal pair-setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingKeys {
    /// Our ed25519 secret key (32 bytes)
    #[serde(with = "b64")]
    pub client_secret: Vec<u8>,
    /// Our ed25519 public key (32 bytes)
    #[serde(with = "b64")]
    pub client_public: Vec<u8>,
    /// The device's long-term ed25519 public key (32 bytes)
    #[serde(with = "b64")]
    pub device_public: Vec<u8>,
    /// The identifier the device sent in M6
    pub device_id: String,
}

impl PairingKeys {
    /// Serialise to the opaque authorisation string stored on the device
    /// record
    #[must_use]
    pub fn to_auth_string(&self) -> String {
        // Infallible: the struct is plain strings and byte arrays
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Restore from a stored authorisation string
    #[must_use]
    pub fn from_auth_string(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

mod b64 {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// JSON file of pairing keys indexed by device id
pub struct KeyStore {
    path: PathBuf,
    cache: HashMap<String, PairingKeys>,
}

impl KeyStore {
    /// Open (or create) the key store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let cache = if path.exists() {
            let file = std::fs::File::open(&path)?;
            serde_json::from_reader(std::io::BufReader::new(file))
                .map_err(|e| StorageError::Serialization(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self { path, cache })
    }

    #[must_use]
    pub fn load(&self, device_id: &str) -> Option<PairingKeys> {
        self.cache.get(device_id).cloned()
    }

    pub fn save(&mut self, device_id: &str, keys: &PairingKeys) -> Result<(), StorageError> {
        self.cache.insert(device_id.to_string(), keys.clone());
        self.flush()
    }

    /// Drop a device's keys, e.g. after the device rejected a pair-verify
    /// signed with them
    pub fn remove(&mut self, device_id: &str) -> Result<(), StorageError> {
        self.cache.remove(device_id);
        self.flush()
    }

    fn flush(&self) -> Result<(), StorageError> {
        let file = std::fs::File::create(&self.path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &self.cache)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }
}
