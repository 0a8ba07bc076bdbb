//! Test doubles: a mock AirPlay speaker implementing the accessory side of
//! the protocol (pairing, ciphered RTSP, UDP audio receive), used by the
//! integration tests to exercise full sessions without hardware.

mod mock_speaker;

pub use mock_speaker::{MockSpeaker, MockSpeakerConfig, Recording};
