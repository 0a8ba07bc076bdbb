//! Crate-level error type

use std::time::Duration;

use crate::cache::CacheError;
use crate::pairing::PairingError;
use crate::plist::{PlistDecodeError, PlistEncodeError};
use crate::rtsp::RtspCodecError;

/// Failures surfaced by the output core, grouped by kind: transport,
/// protocol, authentication, capability, resource, busy and cache. Cache
/// errors are normally logged and swallowed at the call site (a cache miss),
/// everything else fails the operation that hit it.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// Socket errors, short reads, connection drops
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed plist/TLV, unexpected state, missing required field
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Pairing rejected, signature mismatch, 401 on setup
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Device advertises no supported pairing flag, or no audio
    #[error("device not supported: {0}")]
    Capability(&'static str),

    /// Allocation and port binding failures
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// Peer asked us to back off
    #[error("device busy, retry in {retry_after:?}")]
    Busy { retry_after: Duration },

    /// SQLite problems; callers treat these as cache misses
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<PairingError> for OutputError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::PeerError { code } if code == crate::pairing::tlv::errors::BACKOFF => {
                OutputError::Busy {
                    retry_after: Duration::from_secs(10),
                }
            }
            PairingError::Tlv(tlv) => OutputError::Protocol(tlv.to_string()),
            other => OutputError::Authentication(other.to_string()),
        }
    }
}

impl From<RtspCodecError> for OutputError {
    fn from(e: RtspCodecError) -> Self {
        OutputError::Protocol(e.to_string())
    }
}

impl From<PlistDecodeError> for OutputError {
    fn from(e: PlistDecodeError) -> Self {
        OutputError::Protocol(e.to_string())
    }
}

impl From<PlistEncodeError> for OutputError {
    fn from(e: PlistEncodeError) -> Self {
        OutputError::Protocol(e.to_string())
    }
}
