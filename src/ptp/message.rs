//! PTPv2 message parsing, limited to what a slave tracking one grandmaster
//! needs: the common header plus Announce, Sync and Follow_Up bodies.

use byteorder::{BigEndian, ByteOrder};

/// Common header length
const HEADER_LEN: usize = 34;

/// PTP message types (transport-specific nibble of byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpMessageType {
    Sync,
    DelayReq,
    FollowUp,
    DelayResp,
    Announce,
    Signaling,
    Management,
    Other(u8),
}

impl PtpMessageType {
    fn from_nibble(n: u8) -> Self {
        match n {
            0x0 => Self::Sync,
            0x1 => Self::DelayReq,
            0x8 => Self::FollowUp,
            0x9 => Self::DelayResp,
            0xb => Self::Announce,
            0xc => Self::Signaling,
            0xd => Self::Management,
            other => Self::Other(other),
        }
    }
}

/// An 80-bit PTP timestamp: 48-bit seconds and 32-bit nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanos: u32,
}

impl PtpTimestamp {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 10 {
            return None;
        }
        Some(Self {
            seconds: BigEndian::read_u48(&data[0..6]),
            nanos: BigEndian::read_u32(&data[6..10]),
        })
    }
}

/// The parsed common header fields a slave cares about
#[derive(Debug, Clone, Copy)]
pub struct PtpHeader {
    pub message_type: PtpMessageType,
    pub version: u8,
    pub domain: u8,
    /// TWO_STEP flag: the precise origin stamp arrives in a Follow_Up
    pub two_step: bool,
    /// Clock identity of the sender
    pub source_identity: u64,
    pub sequence_id: u16,
}

/// The message bodies we track
#[derive(Debug, Clone, Copy)]
pub enum PtpBody {
    Announce { grandmaster_identity: u64 },
    Sync { origin: PtpTimestamp },
    FollowUp { origin: PtpTimestamp },
    Other,
}

/// Parse one PTPv2 datagram. Returns `None` for short input or other PTP
/// versions.
#[must_use]
pub fn parse(data: &[u8]) -> Option<(PtpHeader, PtpBody)> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let version = data[1] & 0x0f;
    if version != 2 {
        return None;
    }

    let header = PtpHeader {
        message_type: PtpMessageType::from_nibble(data[0] & 0x0f),
        version,
        domain: data[4],
        two_step: data[6] & 0x02 != 0,
        source_identity: BigEndian::read_u64(&data[20..28]),
        sequence_id: BigEndian::read_u16(&data[30..32]),
    };

    let body = match header.message_type {
        PtpMessageType::Sync => PtpBody::Sync {
            origin: PtpTimestamp::parse(&data[HEADER_LEN..])?,
        },
        PtpMessageType::FollowUp => PtpBody::FollowUp {
            origin: PtpTimestamp::parse(&data[HEADER_LEN..])?,
        },
        PtpMessageType::Announce => {
            // Announce body: origin stamp (10), utc offset (2), reserved (1),
            // gm priority1 (1), gm clock quality (4), gm priority2 (1),
            // gm identity (8)
            let body = &data[HEADER_LEN..];
            if body.len() < 27 {
                return None;
            }
            PtpBody::Announce {
                grandmaster_identity: BigEndian::read_u64(&body[19..27]),
            }
        }
        _ => PtpBody::Other,
    };

    Some((header, body))
}

/// Serialise a Sync or Follow_Up for tests and the mock grandmaster
#[must_use]
pub fn build(
    message_type: PtpMessageType,
    two_step: bool,
    source_identity: u64,
    sequence_id: u16,
    origin: PtpTimestamp,
) -> Vec<u8> {
    let type_nibble = match message_type {
        PtpMessageType::Sync => 0x0,
        PtpMessageType::FollowUp => 0x8,
        PtpMessageType::Announce => 0xb,
        _ => 0xf,
    };

    let body_len = if message_type == PtpMessageType::Announce { 30 } else { 10 };
    let mut buf = vec![0u8; HEADER_LEN + body_len];
    buf[0] = type_nibble;
    buf[1] = 2; // versionPTP
    BigEndian::write_u16(&mut buf[2..4], (HEADER_LEN + body_len) as u16);
    if two_step {
        buf[6] |= 0x02;
    }
    BigEndian::write_u64(&mut buf[20..28], source_identity);
    BigEndian::write_u16(&mut buf[30..32], sequence_id);

    match message_type {
        PtpMessageType::Announce => {
            BigEndian::write_u64(&mut buf[HEADER_LEN + 19..HEADER_LEN + 27], source_identity);
        }
        _ => {
            BigEndian::write_u48(&mut buf[HEADER_LEN..HEADER_LEN + 6], origin.seconds);
            BigEndian::write_u32(&mut buf[HEADER_LEN + 6..HEADER_LEN + 10], origin.nanos);
        }
    }

    buf
}
