//! RTP session state for one outgoing audio stream: sequence number and
//! timestamp position, the retransmit ring, and the serialised packet
//! formats (audio, sync, timing, control).

#[cfg(test)]
mod tests;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use crate::types::AudioQuality;

/// RTP payload type for realtime AirPlay audio
pub const PAYLOAD_TYPE_AUDIO: u8 = 0x60;

/// Marker bit in the second header byte
pub const MARKER_BIT: u8 = 0x80;

/// Slots in the retransmit ring
pub const RING_SIZE: usize = 1000;

/// Offset between the Unix and NTP epochs (1970 - 1900) in seconds
pub const NTP_EPOCH_DELTA: u32 = 0x83aa_7e80;

/// A 64-bit NTP timestamp: 32-bit seconds since 1900, 32-bit fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTime {
    pub sec: u32,
    pub frac: u32,
}

impl NtpTime {
    /// Convert a Unix-epoch timespec
    #[must_use]
    pub fn from_timespec(sec: u64, nsec: u32) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let sec = (sec as u32).wrapping_add(NTP_EPOCH_DELTA);
        // frac = nsec * 2^32 / 1e9
        let frac = ((u64::from(nsec) << 32) / 1_000_000_000) as u32;
        Self { sec, frac }
    }

    #[must_use]
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_timespec(now.as_secs(), now.subsec_nanos())
    }
}

/// A serialised RTP packet: 12-byte header followed by the payload, stored
/// contiguously so it can go straight to the socket and into the ring
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub seqnum: u16,
    pub rtptime: u32,
    pub samples: u32,
    data: Vec<u8>,
}

impl RtpPacket {
    /// Standard RTP header size
    pub const HEADER_LEN: usize = 12;

    /// Complete packet bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.data[..Self::HEADER_LEN]
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[Self::HEADER_LEN..]
    }

    /// Mutable payload slice, filled by the encoder after `packet_next`
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[Self::HEADER_LEN..]
    }

    /// Copy with the marker bit set, for the first packet to a joining device
    #[must_use]
    pub fn with_marker(&self) -> RtpPacket {
        let mut copy = self.clone();
        copy.data[1] |= MARKER_BIT;
        copy
    }
}

/// Per-stream RTP state. One instance lives in each master session.
pub struct RtpSession {
    /// Next sequence number to be committed
    pub seqnum: u16,
    /// RTP timestamp of the next packet
    pub pos: u32,
    pub ssrc: u32,
    /// 64-bit clock identifier (PTP clock id, or seeded at init)
    pub clock_id: u64,
    pub quality: AudioQuality,
    ring: Vec<Option<RtpPacket>>,
    /// `pos` at the last periodic sync packet
    sync_last_pos: u32,
    /// Audio samples between periodic sync packets (~126 ms)
    sync_interval: u32,
}

impl RtpSession {
    pub fn new(quality: AudioQuality, ring_size: usize, ssrc: u32, clock_id: u64) -> Self {
        let mut rng = rand::thread_rng();

        // RFC 3550 wants the initial values random; the upper bits are kept
        // clear so receivers have headroom before the first wraparound.
        let seqnum: u16 = rng.r#gen::<u16>() & 0x7fff;
        let pos: u32 = rng.r#gen::<u32>() & 0x3fff_ffff;

        let sync_interval = quality.sample_rate * 126 / 1000;

        Self {
            seqnum,
            pos,
            ssrc,
            clock_id,
            quality,
            ring: (0..ring_size).map(|_| None).collect(),
            sync_last_pos: pos,
            sync_interval,
        }
    }

    /// Allocate the next packet with a serialised header and an uninitialised
    /// payload of `payload_len` bytes. The caller fills the payload and then
    /// `commit`s.
    pub fn packet_next(&self, payload_len: usize, samples_per_packet: u32, payload_type: u8) -> RtpPacket {
        let mut data = vec![0u8; RtpPacket::HEADER_LEN + payload_len];
        data[0] = 0x80;
        data[1] = payload_type & 0x7f;
        BigEndian::write_u16(&mut data[2..4], self.seqnum);
        BigEndian::write_u32(&mut data[4..8], self.pos);
        BigEndian::write_u32(&mut data[8..12], self.ssrc);

        RtpPacket {
            seqnum: self.seqnum,
            rtptime: self.pos,
            samples: samples_per_packet,
            data,
        }
    }

    /// Store the packet for retransmission and advance seqnum and position
    pub fn commit(&mut self, packet: RtpPacket) {
        let slot = usize::from(packet.seqnum) % self.ring.len();
        let samples = packet.samples;
        self.ring[slot] = Some(packet);

        self.seqnum = self.seqnum.wrapping_add(1);
        self.pos = self.pos.wrapping_add(samples);
    }

    /// Retransmit lookup. Returns the packet iff it is still in the ring,
    /// i.e. the slot has not been overwritten by a later wraparound.
    #[must_use]
    pub fn get(&self, seqnum: u16) -> Option<&RtpPacket> {
        let slot = usize::from(seqnum) % self.ring.len();
        self.ring[slot].as_ref().filter(|p| p.seqnum == seqnum)
    }

    /// Number of occupied ring slots
    #[must_use]
    pub fn ring_len(&self) -> usize {
        self.ring.iter().filter(|p| p.is_some()).count()
    }

    /// True when enough audio has passed since the last periodic sync packet
    pub fn sync_is_time(&mut self) -> bool {
        if self.pos.wrapping_sub(self.sync_last_pos) >= self.sync_interval {
            self.sync_last_pos = self.pos;
            return true;
        }
        false
    }
}

/// Sync packet variants (second header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncVariant {
    /// Periodic sync while streaming
    Periodic,
    /// First sync after a device joined
    Join,
}

/// Build a 20-byte sync packet carrying the timestamp reference.
///
/// Layout: `80|90 d4 0007`, then current RTP position (the sample that is
/// playing at `time`), the NTP time, and the RTP position of the next packet.
#[must_use]
pub fn sync_packet(variant: SyncVariant, cur_pos: u32, time: NtpTime, next_pos: u32) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0] = match variant {
        SyncVariant::Periodic => 0x80,
        SyncVariant::Join => 0x90,
    };
    buf[1] = 0xd4;
    BigEndian::write_u16(&mut buf[2..4], 0x0007);
    BigEndian::write_u32(&mut buf[4..8], cur_pos);
    BigEndian::write_u32(&mut buf[8..12], time.sec);
    BigEndian::write_u32(&mut buf[12..16], time.frac);
    BigEndian::write_u32(&mut buf[16..20], next_pos);
    buf
}

/// A parsed 8-byte retransmit request from the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    pub cseq: u16,
    pub seq_start: u16,
    pub seq_len: u16,
}

impl RetransmitRequest {
    /// Parse `<0x80 0xd5, u16 cseq, u16 seq_start, u16 seq_len>`
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 8 || data[0] != 0x80 || data[1] != 0xd5 {
            return None;
        }
        Some(Self {
            cseq: BigEndian::read_u16(&data[2..4]),
            seq_start: BigEndian::read_u16(&data[4..6]),
            seq_len: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Serialise, used by tests and the mock speaker
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = 0x80;
        buf[1] = 0xd5;
        BigEndian::write_u16(&mut buf[2..4], self.cseq);
        BigEndian::write_u16(&mut buf[4..6], self.seq_start);
        BigEndian::write_u16(&mut buf[6..8], self.seq_len);
        buf
    }
}

/// Build the 32-byte reply to a timing request. Byte 2 echoes the request
/// CSeq, the client's transmit stamp (request offset 24) comes back at
/// offset 8, our receive stamp at 16 and transmit stamp at 24.
#[must_use]
pub fn timing_reply(request: &[u8; 32], recv: NtpTime, xmit: NtpTime) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[0] = 0x80;
    buf[1] = 0xd3;
    buf[2] = request[2];
    buf[8..16].copy_from_slice(&request[24..32]);
    BigEndian::write_u32(&mut buf[16..20], recv.sec);
    BigEndian::write_u32(&mut buf[20..24], recv.frac);
    BigEndian::write_u32(&mut buf[24..28], xmit.sec);
    BigEndian::write_u32(&mut buf[28..32], xmit.frac);
    buf
}

/// True when the 32-byte packet is a timing request (`0x80 0xd2`)
#[must_use]
pub fn is_timing_request(data: &[u8]) -> bool {
    data.len() == 32 && data[0] == 0x80 && data[1] == 0xd2
}
