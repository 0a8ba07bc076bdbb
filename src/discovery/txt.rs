//! TXT record parsing for `_airplay._tcp` advertisements

use std::collections::HashMap;
use std::net::IpAddr;

use crate::types::{AudioQuality, DeviceFlags, OutputDevice, PairingMode};

/// AirPlay feature bits (the `features` TXT value, two 32-bit words)
pub mod feature_bits {
    /// Audio streaming; required for this backend
    pub const SUPPORTS_AIRPLAY_AUDIO: u64 = 1 << 9;
    /// FairPlay authentication
    pub const FAIRPLAY_AUTH: u64 = 1 << 14;
    /// MetadataFeatures: artwork
    pub const METADATA_ARTWORK: u64 = 1 << 15;
    /// MetadataFeatures: progress
    pub const METADATA_PROGRESS: u64 = 1 << 16;
    /// MetadataFeatures: text
    pub const METADATA_TEXT: u64 = 1 << 17;
    /// MFi authentication available
    pub const MFI_AUTH: u64 = 1 << 26;
    /// Legacy (RAOP) pairing
    pub const LEGACY_PAIRING: u64 = 1 << 27;
    /// Supports unified media control
    pub const UNIFIED_MEDIA_CONTROL: u64 = 1 << 38;
    /// Supports buffered audio
    pub const BUFFERED_AUDIO: u64 = 1 << 40;
    /// Supports PTP timing
    pub const SUPPORTS_PTP: u64 = 1 << 41;
    /// Supports system pairing (transient auth available)
    pub const SYSTEM_PAIRING: u64 = 1 << 43;
    /// HomeKit pairing and access control (normal pairing required)
    pub const HK_PAIRING_AND_ACCESS_CONTROL: u64 = 1 << 46;
    /// CoreUtils pairing and encryption
    pub const COREUTILS_PAIRING: u64 = 1 << 48;
    /// Unified pair-setup and MFi
    pub const UNIFIED_PAIR_SETUP_MFI: u64 = 1 << 51;
}

/// Parse the `features` value: one hex word, or two comma-separated hex
/// words with the high word second
#[must_use]
pub fn parse_features(features: &str) -> Option<u64> {
    match features.split_once(',') {
        Some((lo, hi)) => {
            let lo = parse_hex(lo)?;
            let hi = parse_hex(hi)?;
            Some((hi << 32) | (lo & 0xffff_ffff))
        }
        None => parse_hex(features),
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// The device id is the MAC as a 48-bit integer, sign-extended to 64 bits
#[must_use]
pub fn device_id_from_mac(mac: &str) -> Option<u64> {
    let mut id: u64 = 0;
    let mut octets = 0;
    for part in mac.split(':') {
        id = (id << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
        octets += 1;
    }
    if octets != 6 {
        return None;
    }

    if id & 0x8000_0000_0000 != 0 {
        id |= 0xffff_0000_0000_0000;
    }
    Some(id)
}

/// Which pairing the feature words ask for
#[must_use]
pub fn pairing_mode_from_features(features: u64) -> PairingMode {
    if features & (feature_bits::SYSTEM_PAIRING | feature_bits::COREUTILS_PAIRING) != 0 {
        PairingMode::Transient
    } else if features & feature_bits::HK_PAIRING_AND_ACCESS_CONTROL != 0 {
        PairingMode::Normal
    } else {
        PairingMode::Unsupported
    }
}

/// Friendly names for the model strings that matter to us
#[must_use]
pub fn model_display_name(model: &str) -> &str {
    match model {
        "AudioAccessory1,1" | "AudioAccessory1,2" => "HomePod",
        "AudioAccessory5,1" => "HomePod mini",
        "AppleTV5,3" => "Apple TV (4th generation)",
        "AppleTV6,2" => "Apple TV 4K",
        "AppleTV11,1" => "Apple TV 4K (2nd generation)",
        "AirPort10,1" => "AirPort Express",
        _ => model,
    }
}

/// Build a device record from a resolved advertisement. Returns `None` when
/// the advertisement is not usable (no device id, no audio support).
#[must_use]
pub fn device_from_txt(
    name: &str,
    addresses: Vec<IpAddr>,
    port: u16,
    txt: &HashMap<String, String>,
) -> Option<OutputDevice> {
    let id = device_id_from_mac(txt.get("deviceid")?)?;
    let features = txt.get("features").and_then(|f| parse_features(f))?;

    if features & feature_bits::SUPPORTS_AIRPLAY_AUDIO == 0 {
        tracing::debug!("ignoring '{name}', no AirPlay audio support");
        return None;
    }

    let model = txt.get("model").cloned().unwrap_or_default();
    let requires_password = txt.get("pw").is_some_and(|v| v == "1" || v == "true");

    Some(OutputDevice {
        id,
        name: name.to_string(),
        model,
        addresses,
        port,
        auth_key: None,
        volume: 0,
        quality: AudioQuality::default(),
        flags: DeviceFlags {
            requires_auth: requires_password,
            ..DeviceFlags::default()
        },
        pairing_mode: pairing_mode_from_features(features),
        supports_ptp: features & feature_bits::SUPPORTS_PTP != 0,
        wants_progress: features & feature_bits::METADATA_PROGRESS != 0,
        wants_text: features & feature_bits::METADATA_TEXT != 0,
        wants_artwork: features & feature_bits::METADATA_ARTWORK != 0,
        raw_features: features,
        password: None,
        pin: None,
    })
}
