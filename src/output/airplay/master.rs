//! Master sessions: one shared encoder + RTP pipeline per audio quality and
//! timing mode. Device sessions using the same key share the instance and
//! the ring buffer behind it.

use std::time::Duration;

use bytes::BytesMut;

use crate::alac::{AlacError, AlacPacketEncoder, SAMPLES_PER_PACKET};
use crate::rtp::{PAYLOAD_TYPE_AUDIO, RING_SIZE, RtpPacket, RtpSession};
use crate::types::AudioQuality;

/// Master sessions are keyed on quality and timing mode; a PTP device never
/// shares a session with an NTP one
pub type MasterKey = (AudioQuality, bool);

/// Device-side latency the sync position accounts for
pub const AUDIO_LATENCY_MS: u32 = 250;

/// The "which RTP sample plays at which wall time" reference, updated on
/// every player write and carried in sync packets and progress metadata
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampRef {
    /// Player clock at the last write
    pub ts: Duration,
    /// RTP position rendering at `ts`
    pub pos: u32,
}

pub struct MasterSession {
    pub key: MasterKey,
    pub rtp: RtpSession,
    encoder: AlacPacketEncoder,
    input_buffer: BytesMut,
    frame_bytes: usize,
    pub cur_stamp: TimestampRef,
    /// Samples the downstream device is expected to keep buffered
    pub output_buffer_samples: u32,
}

impl MasterSession {
    pub fn new(
        quality: AudioQuality,
        use_ptp: bool,
        buffer_duration: Duration,
        clock_id: u64,
    ) -> Result<Self, AlacError> {
        let encoder = AlacPacketEncoder::new(quality)?;
        let frame_bytes = encoder.frame_bytes();

        #[allow(clippy::cast_possible_truncation)]
        let buffer_ms = buffer_duration.as_millis() as u32;
        let output_buffer_samples =
            buffer_ms.saturating_sub(AUDIO_LATENCY_MS) * quality.sample_rate / 1000;

        Ok(Self {
            key: (quality, use_ptp),
            rtp: RtpSession::new(quality, RING_SIZE, 0, clock_id),
            encoder,
            input_buffer: BytesMut::with_capacity(4 * frame_bytes),
            frame_bytes,
            cur_stamp: TimestampRef::default(),
            output_buffer_samples,
        })
    }

    /// Unsent samples buffered on our side
    #[must_use]
    pub fn input_buffer_samples(&self) -> u32 {
        self.key.0.bytes_to_samples(self.input_buffer.len()) as u32
    }

    /// Update the timestamp reference for a player write at `pts`.
    ///
    /// The device renders `output_buffer_samples` behind what we have handed
    /// it, and `input_buffer` holds what we have not sent yet, so the sample
    /// playing right now is `pos + input_buffer_samples - output_buffer_samples`.
    pub fn timestamp_set(&mut self, pts: Duration) {
        self.cur_stamp = TimestampRef {
            ts: pts,
            pos: self
                .rtp
                .pos
                .wrapping_add(self.input_buffer_samples())
                .wrapping_sub(self.output_buffer_samples),
        };
    }

    /// Append PCM from the player
    pub fn extend(&mut self, pcm: &[u8]) {
        self.input_buffer.extend_from_slice(pcm);
    }

    /// True while at least one packet worth of PCM is buffered
    #[must_use]
    pub fn packet_ready(&self) -> bool {
        self.input_buffer.len() >= self.frame_bytes
    }

    /// Drain one frame, encode it, and wrap it in the next RTP packet. The
    /// caller fans the packet out to the attached sessions and then
    /// `commit`s it to the ring.
    pub fn encode_next(&mut self) -> Result<RtpPacket, AlacError> {
        let frame = self.input_buffer.split_to(self.frame_bytes);
        let payload = self.encoder.encode(&frame)?;
        let mut pkt = self
            .rtp
            .packet_next(payload.len(), SAMPLES_PER_PACKET, PAYLOAD_TYPE_AUDIO);
        pkt.payload_mut().copy_from_slice(payload);
        Ok(pkt)
    }

    /// Commit a fanned-out packet to the retransmit ring
    pub fn commit(&mut self, pkt: RtpPacket) {
        self.rtp.commit(pkt);
    }

    /// The ALAC magic cookie of the shared encoder
    #[must_use]
    pub fn magic_cookie(&self) -> Vec<u8> {
        self.encoder.magic_cookie()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> MasterSession {
        // 450 ms buffer minus 250 ms latency = 200 ms = 8820 samples
        MasterSession::new(
            AudioQuality::default(),
            false,
            Duration::from_millis(450),
            0,
        )
        .unwrap()
    }

    #[test]
    fn output_buffer_sizing() {
        assert_eq!(master().output_buffer_samples, 8820);
    }

    #[test]
    fn timestamp_reference_accounts_for_buffers() {
        let mut ams = master();
        let rtp_start = ams.rtp.pos;
        let q = AudioQuality::default();

        // Ten writes of 441 samples, draining packets as the engine would.
        // The reference only depends on received = sent + buffered, so the
        // drain split does not matter.
        for i in 0..10 {
            ams.extend(&vec![0u8; q.samples_to_bytes(441)]);
            while ams.packet_ready() {
                let pkt = ams.encode_next().unwrap();
                ams.commit(pkt);
            }
            ams.timestamp_set(Duration::from_millis(10 * (i + 1)));
        }

        // pos + input - output == rtp_start + 4410 - 8820 (modular)
        let expected = rtp_start.wrapping_add(4410).wrapping_sub(8820);
        assert_eq!(ams.cur_stamp.pos, expected);
        assert_eq!(ams.cur_stamp.ts, Duration::from_millis(100));

        // Cross-check the split between sent and buffered samples
        let sent = ams.rtp.pos.wrapping_sub(rtp_start);
        assert_eq!(sent + ams.input_buffer_samples(), 4410);
    }

    #[test]
    fn encode_next_drains_exactly_one_packet() {
        let mut ams = master();
        let q = AudioQuality::default();

        ams.extend(&vec![0u8; q.samples_to_bytes(800)]);
        assert!(ams.packet_ready());

        let pkt = ams.encode_next().unwrap();
        assert_eq!(pkt.samples, 352);
        assert_eq!(ams.input_buffer_samples(), 800 - 352);
        ams.commit(pkt);

        let pkt = ams.encode_next().unwrap();
        ams.commit(pkt);
        assert!(!ams.packet_ready());
        assert_eq!(ams.input_buffer_samples(), 800 - 704);
    }

    #[test]
    fn committed_packets_are_retrievable_for_retransmit() {
        let mut ams = master();
        let q = AudioQuality::default();
        ams.extend(&vec![0u8; q.samples_to_bytes(352)]);

        let pkt = ams.encode_next().unwrap();
        let seqnum = pkt.seqnum;
        ams.commit(pkt);

        assert!(ams.rtp.get(seqnum).is_some());
    }
}
