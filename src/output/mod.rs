//! The interface the player drives outputs through. The AirPlay engine is
//! the implementation living in this repo; other backends plug in behind the
//! same trait (tests use a loopback one).

pub mod airplay;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::OutputError;
use crate::types::{AudioQuality, OutputDevice};

/// Session states reported to the player. The player decides whether to keep
/// the device in the active set based on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    /// Session lost; the device is being torn down
    Failed,
    /// The device wants a PIN before it will talk to us
    RequiresPassword,
    Stopped,
    /// Connection sequence under way
    Startup,
    /// Session established, not yet receiving audio
    Connected,
    Streaming,
}

/// One status report on the player callback channel
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub device_id: u64,
    pub status: OutputStatus,
}

/// Playback position in RTP time units, sent as
/// `progress: start/current/end`
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub start: u32,
    pub current: u32,
    pub end: u32,
}

/// Metadata prepared for sending. Encoding text into DMAP and scaling
/// artwork belong to the library front-ends; this carries the finished
/// bytes only.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// `application/x-dmap-tagged` blob for SET_PARAMETER (text)
    pub text: Option<Vec<u8>>,
    /// Image bytes and their MIME type
    pub artwork: Option<(Vec<u8>, &'static str)>,
    pub progress: Option<Progress>,
}

/// Transport commands surfaced by a device's event channel (play, pause,
/// next, previous from the speaker's own controls)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Play,
    Pause,
    Next,
    Previous,
}

/// The common output backend interface
#[async_trait]
pub trait Output: Send {
    /// Bring up shared services. Called once before any device operation.
    async fn init(&mut self) -> Result<(), OutputError>;

    /// Tear everything down
    async fn deinit(&mut self);

    /// Connect, pair and start streaming to a device
    async fn device_start(&mut self, device: &OutputDevice) -> Result<(), OutputError>;

    /// Probe reachability and pairing requirements without starting audio
    async fn device_probe(&mut self, device: &OutputDevice) -> Result<(), OutputError>;

    /// Stop a device and release its session
    async fn device_stop(&mut self, device_id: u64) -> Result<(), OutputError>;

    /// Flush device buffers (pause)
    async fn device_flush(&mut self, device_id: u64) -> Result<(), OutputError>;

    /// Set device volume, 0..=100 on the player scale
    async fn device_volume_set(&mut self, device_id: u64, volume: i32) -> Result<(), OutputError>;

    /// Hand a PCM buffer to every matching master session. Must never block;
    /// the player calls this on its timing-critical path. `pts` is the
    /// player clock position of the first sample.
    fn write(&mut self, pcm: &[u8], quality: AudioQuality, pts: Duration);

    /// Store metadata for subsequent sends
    async fn metadata_prepare(&mut self, metadata: Metadata) -> Result<(), OutputError>;

    /// Send the prepared metadata to one device, or all when `None`
    async fn metadata_send(&mut self, device_id: Option<u64>) -> Result<(), OutputError>;
}

/// Player-facing callbacks, delivered over channels so the engine never
/// calls into the player re-entrantly
#[derive(Debug, Clone)]
pub struct OutputCallbacks {
    pub status: tokio::sync::mpsc::UnboundedSender<StatusEvent>,
    pub remote: tokio::sync::mpsc::UnboundedSender<(u64, RemoteCommand)>,
}

/// Convert player volume (0..=100) to the AirPlay dB scale (-30..0, with
/// -144 meaning mute). `max_volume` rescales when the user caps the dial.
#[must_use]
pub fn volume_to_db(volume: i32, max_volume: i32) -> f32 {
    if volume <= 0 {
        return -144.0;
    }
    let volume = volume.min(100);
    let max_volume = max_volume.clamp(1, 11);

    #[allow(clippy::cast_precision_loss)]
    let scaled = (volume as f32) * (max_volume as f32) / 11.0;
    -30.0 + 0.3 * scaled
}

/// Duration since the Unix epoch for a player pts, used for NTP stamps in
/// sync packets
#[must_use]
pub fn pts_to_ntp(pts: Duration) -> crate::rtp::NtpTime {
    crate::rtp::NtpTime::from_timespec(pts.as_secs(), pts.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_mapping_endpoints() {
        assert_eq!(volume_to_db(0, 11), -144.0);
        assert_eq!(volume_to_db(-5, 11), -144.0);
        assert!((volume_to_db(100, 11) - 0.0).abs() < 0.001);
        assert!((volume_to_db(50, 11) - (-15.0)).abs() < 0.001);
    }

    #[test]
    fn volume_mapping_respects_max_volume_cap() {
        // Capped dial: full player volume maps below 0 dB
        let capped = volume_to_db(100, 5);
        assert!(capped < -10.0 && capped > -30.0);
    }
}
