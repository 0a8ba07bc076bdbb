use std::path::PathBuf;
use std::time::Duration;

/// Static configuration handed to `airplay::init`. The surrounding daemon
/// fills this from its config file; defaults here are the ones the original
/// service ships with.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Name announced to speakers
    pub name: String,
    /// 64-bit library hash, used as Client-Instance/DACP-ID and the pairing
    /// client id
    pub library_id: u64,
    /// UDP port for the NTP timing service (0 = ephemeral)
    pub timing_port: u16,
    /// UDP port for the control/retransmit service (0 = ephemeral)
    pub control_port: u16,
    /// PTP event/general ports; the privileged defaults 319/320 must be
    /// bound before dropping privileges
    pub ptp_event_port: u16,
    pub ptp_general_port: u16,
    /// Feedback interval for devices that disconnect when idle
    pub keep_alive_interval: Duration,
    /// How much audio the device is asked to buffer
    pub buffer_duration: Duration,
    /// Where pairing keys are persisted
    pub keystore_path: PathBuf,
    /// Directory for the cache databases
    pub cache_dir: PathBuf,
    /// Volume scale maximum in the config file (the classic "max volume 11")
    pub max_volume: i32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "tonecast".to_string(),
            library_id: 0,
            timing_port: 0,
            control_port: 0,
            ptp_event_port: 319,
            ptp_general_port: 320,
            keep_alive_interval: Duration::from_secs(25),
            buffer_duration: Duration::from_millis(450),
            keystore_path: PathBuf::from("pairings.json"),
            cache_dir: PathBuf::from("."),
            max_volume: 11,
        }
    }
}
