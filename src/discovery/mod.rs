//! Device discovery: `_airplay._tcp` TXT record parsing and a thin browse
//! adapter. The main thread owns the device list; this module only produces
//! arrival/departure events for it.

mod browser;
mod txt;


pub use browser::{DeviceBrowser, DeviceEvent};
pub use txt::{
    device_from_txt, device_id_from_mac, feature_bits, model_display_name, parse_features,
    pairing_mode_from_features,
};

/// The service type speakers advertise
pub const AIRPLAY_SERVICE: &str = "_airplay._tcp.local.";
