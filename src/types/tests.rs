use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::*;

fn device(addresses: Vec<IpAddr>) -> OutputDevice {
    OutputDevice {
        id: 0xffff_9876_5432_10ab_u64,
        name: "Kitchen".into(),
        model: "AudioAccessory5,1".into(),
        addresses,
        port: 7000,
        auth_key: None,
        volume: 50,
        quality: AudioQuality::default(),
        flags: DeviceFlags::default(),
        pairing_mode: PairingMode::Transient,
        supports_ptp: true,
        wants_progress: true,
        wants_text: false,
        wants_artwork: false,
        raw_features: 0,
        password: None,
        pin: None,
    }
}

#[test]
fn preferred_address_picks_ipv4_first() {
    let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
    let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

    assert_eq!(device(vec![v6, v4]).preferred_address(), Some(v4));
    assert_eq!(device(vec![v6]).preferred_address(), Some(v6));
}

#[test]
fn ipv6_disabled_skips_v6_addresses() {
    let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
    let mut d = device(vec![v6]);
    d.flags.ipv6_disabled = true;
    assert_eq!(d.preferred_address(), None);
}

#[test]
fn link_local_v6_is_last_resort() {
    let ll = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 9));
    assert_eq!(device(vec![ll]).preferred_address(), Some(ll));
}

#[test]
fn active_remote_is_low_32_bits() {
    assert_eq!(device(vec![]).active_remote(), 0x5432_10ab);
}

#[test]
fn keep_alive_model_detection() {
    let mut d = device(vec![]);
    assert!(d.needs_keep_alive());

    d.model = "Sonos One".into();
    assert!(!d.needs_keep_alive());

    d.model = "AppleTV5,3".into();
    assert!(d.needs_keep_alive());
}

#[test]
fn quality_sample_byte_conversions() {
    let q = AudioQuality::default();
    assert_eq!(q.samples_to_bytes(352), 1408);
    assert_eq!(q.bytes_to_samples(1408), 352);
    assert_eq!(q.bytes_to_samples(1409), 352);
}
