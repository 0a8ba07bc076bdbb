//! Core types shared between the player-facing API and the AirPlay engine

mod config;
mod device;
mod quality;

#[cfg(test)]
mod tests;

pub use config::OutputConfig;
pub use device::{DeviceFlags, OutputDevice, PairingMode};
pub use quality::AudioQuality;
