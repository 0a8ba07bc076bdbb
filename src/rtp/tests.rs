use proptest::prelude::*;

use super::*;
use crate::types::AudioQuality;

fn session() -> RtpSession {
    RtpSession::new(AudioQuality::default(), RING_SIZE, 0, 0xdead_beef)
}

fn commit_one(session: &mut RtpSession, fill: u8) -> u16 {
    let mut pkt = session.packet_next(32, 352, PAYLOAD_TYPE_AUDIO);
    pkt.payload_mut().fill(fill);
    let seqnum = pkt.seqnum;
    session.commit(pkt);
    seqnum
}

#[test]
fn header_layout() {
    let session = session();
    let pkt = session.packet_next(16, 352, PAYLOAD_TYPE_AUDIO);

    let header = pkt.header();
    assert_eq!(header[0], 0x80);
    assert_eq!(header[1], 0x60);
    assert_eq!(u16::from_be_bytes([header[2], header[3]]), session.seqnum);
    assert_eq!(
        u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        session.pos
    );
    assert_eq!(&header[8..12], &[0, 0, 0, 0]);
    assert_eq!(pkt.data().len(), 12 + 16);
}

#[test]
fn marker_variant_only_touches_marker_bit() {
    let session = session();
    let pkt = session.packet_next(4, 352, PAYLOAD_TYPE_AUDIO);
    let marked = pkt.with_marker();

    assert_eq!(marked.data()[1], 0xe0);
    assert_eq!(pkt.data()[1], 0x60);
    assert_eq!(&marked.data()[2..], &pkt.data()[2..]);
}

#[test]
fn commit_advances_seqnum_and_pos() {
    let mut session = session();
    let seqnum0 = session.seqnum;
    let pos0 = session.pos;

    commit_one(&mut session, 0);

    assert_eq!(session.seqnum, seqnum0.wrapping_add(1));
    assert_eq!(session.pos, pos0.wrapping_add(352));
}

#[test]
fn ring_full_window_is_retrievable() {
    let mut session = session();
    let first = session.seqnum;

    for i in 0..RING_SIZE {
        commit_one(&mut session, (i % 256) as u8);
    }

    // Every packet of the window is found under its own seqnum
    for k in 0..RING_SIZE as u16 {
        let seq = first.wrapping_add(k);
        let pkt = session.get(seq).expect("packet in ring");
        assert_eq!(pkt.seqnum, seq);
        assert_eq!(pkt.payload()[0], (k % 256) as u8);
    }

    // One before the window was never stored
    assert!(session.get(first.wrapping_sub(1)).is_none());

    // One more insert evicts the oldest
    commit_one(&mut session, 0xff);
    assert!(session.get(first).is_none());
    assert!(session.get(first.wrapping_add(1)).is_some());
}

#[test]
fn ring_lookup_checks_stored_seqnum() {
    let mut session = session();
    let first = session.seqnum;
    commit_one(&mut session, 1);

    // Same slot, different seqnum: 1000 slots, so seqnum+1000 aliases
    assert!(session.get(first.wrapping_add(1000)).is_none());
    assert!(session.get(first).is_some());
}

#[test]
fn seqnum_wraparound_keeps_ring_consistent() {
    let mut session = session();
    session.seqnum = u16::MAX - 3;

    for _ in 0..8 {
        commit_one(&mut session, 7);
    }

    for k in 0..8u16 {
        let seq = (u16::MAX - 3).wrapping_add(k);
        assert_eq!(session.get(seq).map(|p| p.seqnum), Some(seq));
    }
}

#[test]
fn sync_cadence_fires_every_126ms_of_audio() {
    let mut session = session();

    // 44100 * 126 / 1000 = 5556 samples; 352 samples per packet
    let mut fired = 0;
    for _ in 0..32 {
        commit_one(&mut session, 0);
        if session.sync_is_time() {
            fired += 1;
        }
    }
    // 32 packets = 11264 samples, two sync points
    assert_eq!(fired, 2);
}

#[test]
fn sync_packet_layout() {
    let time = NtpTime {
        sec: 0x0102_0304,
        frac: 0x0506_0708,
    };
    let pkt = sync_packet(SyncVariant::Join, 88200, time, 97020);

    assert_eq!(pkt[0], 0x90);
    assert_eq!(pkt[1], 0xd4);
    assert_eq!(&pkt[2..4], &[0x00, 0x07]);
    assert_eq!(u32::from_be_bytes(pkt[4..8].try_into().unwrap()), 88200);
    assert_eq!(&pkt[8..12], &[1, 2, 3, 4]);
    assert_eq!(&pkt[12..16], &[5, 6, 7, 8]);
    assert_eq!(u32::from_be_bytes(pkt[16..20].try_into().unwrap()), 97020);

    assert_eq!(sync_packet(SyncVariant::Periodic, 0, time, 0)[0], 0x80);
}

#[test]
fn retransmit_request_roundtrip() {
    let req = RetransmitRequest {
        cseq: 1,
        seq_start: 10,
        seq_len: 3,
    };
    let wire = req.encode();
    assert_eq!(wire, [0x80, 0xd5, 0x00, 0x01, 0x00, 0x0a, 0x00, 0x03]);
    assert_eq!(RetransmitRequest::parse(&wire), Some(req));

    assert!(RetransmitRequest::parse(&wire[..7]).is_none());
    assert!(RetransmitRequest::parse(&[0x80, 0xd2, 0, 0, 0, 0, 0, 0]).is_none());
}

#[test]
fn timing_reply_echoes_client_stamp() {
    let mut request = [0u8; 32];
    request[0] = 0x80;
    request[1] = 0xd2;
    request[2] = 0x07;
    request[3] = 0x55;
    request[24..32].copy_from_slice(&[9, 9, 9, 9, 8, 8, 8, 8]);

    let recv = NtpTime { sec: 100, frac: 200 };
    let xmit = NtpTime { sec: 101, frac: 201 };
    let reply = timing_reply(&request, recv, xmit);

    assert_eq!(reply[0], 0x80);
    assert_eq!(reply[1], 0xd3);
    // Only byte 2 is echoed; byte 3 stays zero
    assert_eq!(reply[2], 0x07);
    assert_eq!(reply[3], 0);
    assert_eq!(&reply[8..16], &[9, 9, 9, 9, 8, 8, 8, 8]);
    assert_eq!(u32::from_be_bytes(reply[16..20].try_into().unwrap()), 100);
    assert_eq!(u32::from_be_bytes(reply[24..28].try_into().unwrap()), 101);

    assert!(is_timing_request(&request));
    assert!(!is_timing_request(&reply[..31]));
}

#[test]
fn ntp_time_from_timespec() {
    let t = NtpTime::from_timespec(0, 500_000_000);
    assert_eq!(t.sec, NTP_EPOCH_DELTA);
    assert_eq!(t.frac, 0x8000_0000);
}

proptest! {
    #[test]
    fn ring_window_property(start in any::<u16>(), lookback in 0u16..1000) {
        let mut session = session();
        session.seqnum = start;

        for _ in 0..RING_SIZE {
            let mut pkt = session.packet_next(4, 352, PAYLOAD_TYPE_AUDIO);
            pkt.payload_mut().fill(0);
            session.commit(pkt);
        }

        // Any seqnum within the last RING_SIZE commits is retrievable
        let seq = start.wrapping_add(lookback);
        prop_assert_eq!(session.get(seq).map(|p| p.seqnum), Some(seq));
    }
}
