//! # tonecast
//!
//! The output core of a home media server: takes PCM from the player,
//! encodes ALAC, and streams it to AirPlay 2 speakers over paired, ciphered
//! RTSP with RTP/UDP audio. Ships with the HomeKit pairing library, the
//! RTP retransmit ring, NTP/PTP timing services, a SQLite-backed cache
//! subsystem and a small worker pool for blocking jobs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tonecast::output::{airplay::AirplayOutput, Output, OutputCallbacks};
//! use tonecast::types::OutputConfig;
//!
//! # async fn example() -> Result<(), tonecast::OutputError> {
//! let (status_tx, _status_rx) = tokio::sync::mpsc::unbounded_channel();
//! let (remote_tx, _remote_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let callbacks = OutputCallbacks { status: status_tx, remote: remote_tx };
//! let mut output = AirplayOutput::new(OutputConfig::default(), callbacks)?;
//! output.init().await?;
//!
//! // Discover a device, then output.device_start(&device).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod alac;
pub mod cache;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod output;
pub mod pairing;
pub mod plist;
pub mod ptp;
pub mod rtp;
pub mod rtsp;
pub mod testing;
pub mod types;
pub mod worker;

pub use error::OutputError;
pub use output::{Output, OutputCallbacks, OutputStatus};
pub use types::{AudioQuality, OutputConfig, OutputDevice};
