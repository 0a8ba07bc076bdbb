use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::AudioQuality;

/// How the speaker wants to be paired, derived from its feature bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMode {
    /// Bits 43/48: SRP with the fixed "3939" passphrase, nothing persisted
    Transient,
    /// Bit 46: full HomeKit pairing with a user PIN and persisted keys
    Normal,
    /// No supported pairing flag advertised
    Unsupported,
}

/// Sticky per-device flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFlags {
    /// Device status says a PIN is required before playback
    pub requires_auth: bool,
    /// An ipv6 connect failed before; stick to ipv4
    pub ipv6_disabled: bool,
    /// Restart the session if the device drops the connection mid-stream
    pub resurrect: bool,
}

/// A speaker known from mDNS. Instantiated when `_airplay._tcp` advertises
/// it, updated on re-advertisement, removed on withdrawal unless permanent.
#[derive(Debug, Clone)]
pub struct OutputDevice {
    /// The MAC address as a 48-bit integer, sign-extended to 64 bits
    pub id: u64,
    pub name: String,
    /// Model string from TXT ("AudioAccessory5,1" etc.)
    pub model: String,
    pub addresses: Vec<IpAddr>,
    /// RTSP control port
    pub port: u16,
    /// Opaque authorisation key from a completed normal pair-setup
    pub auth_key: Option<String>,
    /// Volume in [0, 100]
    pub volume: i32,
    pub quality: AudioQuality,
    pub flags: DeviceFlags,
    pub pairing_mode: PairingMode,
    /// Bit 41: device can be the PTP grandmaster
    pub supports_ptp: bool,
    /// Bits 15/16/17: progress, text, artwork
    pub wants_progress: bool,
    pub wants_text: bool,
    pub wants_artwork: bool,
    /// Raw features words for logging
    pub raw_features: u64,
    /// Device password for legacy digest auth, if the user configured one
    pub password: Option<String>,
    /// One-shot PIN the user entered for normal HomeKit pair-setup
    pub pin: Option<String>,
}

impl OutputDevice {
    /// The connect address honouring the ipv6-disabled flag: ipv4 first,
    /// then any non-link-local address.
    #[must_use]
    pub fn preferred_address(&self) -> Option<IpAddr> {
        let v4 = self.addresses.iter().find(|a| a.is_ipv4());
        if self.flags.ipv6_disabled {
            return v4.copied();
        }
        v4.or_else(|| {
            self.addresses
                .iter()
                .find(|a| matches!(a, IpAddr::V6(v6) if v6.segments()[0] != 0xfe80))
        })
        .or_else(|| self.addresses.first())
        .copied()
    }

    /// The low 32 bits of the device id, sent as Active-Remote and echoed
    /// back by the device on the event channel
    #[must_use]
    pub fn active_remote(&self) -> u32 {
        (self.id & 0xffff_ffff) as u32
    }

    /// True for models known to drop idle connections, which get the
    /// keep-alive feedback timer
    #[must_use]
    pub fn needs_keep_alive(&self) -> bool {
        self.model.starts_with("AppleTV5,3")
            || self.model.starts_with("AppleTV6")
            || self.model.starts_with("AppleTV11")
            || self.model.starts_with("AppleTV14")
            || self.model.starts_with("AudioAccessory")
    }
}
