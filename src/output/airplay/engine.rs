//! The streaming-side engine: master sessions, per-device stream entries and
//! the packet fan-out. Shared behind a mutex between the player `write`
//! path, the control service (retransmits) and the connection actors.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::crypto::{ChaCha20Poly1305Cipher, Nonce};
use crate::rtp::{NtpTime, RetransmitRequest, RtpPacket, SyncVariant, sync_packet};
use crate::types::AudioQuality;

use super::master::{MasterKey, MasterSession};

/// Streaming state of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Session established, waiting for the first audio packet
    Connected,
    Streaming,
    /// Send failure seen; teardown pending
    Failed,
}

/// The engine-side half of a device session: everything the packet fan-out
/// and the retransmit path need, nothing the RTSP connection owns.
pub struct StreamEntry {
    pub device_id: u64,
    pub name: String,
    pub state: StreamState,
    pub master_key: MasterKey,
    /// Peer address, used to route control-channel retransmit requests
    pub peer: IpAddr,
    pub data_socket: Arc<UdpSocket>,
    pub control_socket: Arc<UdpSocket>,
    cipher: ChaCha20Poly1305Cipher,
    /// Model needs the 25 s feedback keep-alive
    pub keep_alive: bool,
}

impl StreamEntry {
    pub fn new(
        device_id: u64,
        name: String,
        master_key: MasterKey,
        peer: IpAddr,
        data_socket: Arc<UdpSocket>,
        control_socket: Arc<UdpSocket>,
        audio_key: &[u8; 32],
        keep_alive: bool,
    ) -> Result<Self, crate::crypto::CryptoError> {
        Ok(Self {
            device_id,
            name,
            state: StreamState::Connected,
            master_key,
            peer,
            data_socket,
            control_socket,
            cipher: ChaCha20Poly1305Cipher::new(audio_key)?,
            keep_alive,
        })
    }

    /// Encrypt and send one audio packet. Non-blocking; a full send buffer
    /// or a socket error marks the session failed and teardown happens from
    /// the session actor, never from this path.
    pub fn send_packet(&mut self, pkt: &RtpPacket) {
        let wire = match encrypt_packet(&self.cipher, pkt) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!("packet encrypt for '{}' failed: {e}", self.name);
                self.state = StreamState::Failed;
                return;
            }
        };

        if let Err(e) = self.data_socket.try_send(&wire) {
            tracing::warn!("audio send to '{}' failed: {e}", self.name);
            self.state = StreamState::Failed;
        }
    }

    /// Send a sync packet on the control channel
    pub fn send_sync(&mut self, bytes: &[u8; 20]) {
        if let Err(e) = self.control_socket.try_send(bytes) {
            tracing::warn!("sync send to '{}' failed: {e}", self.name);
            self.state = StreamState::Failed;
        }
    }
}

/// AirPlay RTP packet encryption: the 12-byte header stays in the clear, the
/// payload is sealed with the device's audio key, nonce derived from the
/// seqnum, AAD over the last 8 header bytes. Tag and the 8-byte nonce tail
/// are appended, so a retransmitted packet is byte-identical.
pub fn encrypt_packet(
    cipher: &ChaCha20Poly1305Cipher,
    pkt: &RtpPacket,
) -> Result<Vec<u8>, crate::crypto::CryptoError> {
    let header = pkt.header();
    let nonce = Nonce::from_seqnum(pkt.seqnum);

    let mut payload = pkt.payload().to_vec();
    let tag = cipher.encrypt_detached(&nonce, &header[4..12], &mut payload)?;

    let mut wire = Vec::with_capacity(12 + payload.len() + 16 + 8);
    wire.extend_from_slice(header);
    wire.extend_from_slice(&payload);
    wire.extend_from_slice(&tag);
    wire.extend_from_slice(&nonce.as_bytes()[4..]);
    Ok(wire)
}

/// Everything owned by the streaming side
pub struct EngineState {
    pub masters: HashMap<MasterKey, MasterSession>,
    pub streams: Vec<StreamEntry>,
    pub buffer_duration: Duration,
    /// Process-wide clock identifier (PTP clock id once PTP is running)
    pub clock_id: u64,
}

impl EngineState {
    pub fn new(buffer_duration: Duration, clock_id: u64) -> Self {
        Self {
            masters: HashMap::new(),
            streams: Vec::new(),
            buffer_duration,
            clock_id,
        }
    }

    /// The master session for a key, created on first use
    pub fn master_get_or_make(
        &mut self,
        quality: AudioQuality,
        use_ptp: bool,
    ) -> Result<&mut MasterSession, crate::alac::AlacError> {
        use std::collections::hash_map::Entry;

        match self.masters.entry((quality, use_ptp)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    "creating master session for {}/{}/{} ptp={use_ptp}",
                    quality.sample_rate,
                    quality.bits_per_sample,
                    quality.channels
                );
                Ok(entry.insert(MasterSession::new(
                    quality,
                    use_ptp,
                    self.buffer_duration,
                    self.clock_id,
                )?))
            }
        }
    }

    /// Register a connected device on the streaming path
    pub fn stream_add(&mut self, entry: StreamEntry) {
        self.streams.retain(|s| s.device_id != entry.device_id);
        self.streams.push(entry);
    }

    /// Remove a device and free its master session when it was the last user
    pub fn stream_remove(&mut self, device_id: u64) {
        let Some(pos) = self.streams.iter().position(|s| s.device_id == device_id) else {
            return;
        };
        let entry = self.streams.swap_remove(pos);

        let still_used = self.streams.iter().any(|s| s.master_key == entry.master_key);
        if !still_used && self.masters.remove(&entry.master_key).is_some() {
            tracing::debug!("released master session for {:?}", entry.master_key);
        }
    }

    /// The player write path: update timestamps, send syncs, encode and fan
    /// out packets. Returns the ids of sessions that joined the stream with
    /// this write (they just moved connected -> streaming).
    pub fn write(&mut self, pcm: &[u8], quality: AudioQuality, pts: Duration) -> Vec<u64> {
        let Self {
            masters, streams, ..
        } = self;

        for ams in masters.values_mut() {
            if ams.key.0 != quality {
                continue;
            }

            ams.timestamp_set(pts);

            // Sync packets: joiners always, running sessions on cadence
            let is_sync_time = ams.rtp.sync_is_time();
            let time = NtpTime::from_timespec(
                ams.cur_stamp.ts.as_secs(),
                ams.cur_stamp.ts.subsec_nanos(),
            );
            for stream in streams.iter_mut().filter(|s| s.master_key == ams.key) {
                match stream.state {
                    StreamState::Connected => {
                        let pkt =
                            sync_packet(SyncVariant::Join, ams.cur_stamp.pos, time, ams.rtp.pos);
                        stream.send_sync(&pkt);
                        tracing::debug!(
                            "start sync sent to '{}': cur_pos={}, rtptime={}",
                            stream.name,
                            ams.cur_stamp.pos,
                            ams.rtp.pos
                        );
                    }
                    StreamState::Streaming if is_sync_time => {
                        let pkt = sync_packet(
                            SyncVariant::Periodic,
                            ams.cur_stamp.pos,
                            time,
                            ams.rtp.pos,
                        );
                        stream.send_sync(&pkt);
                    }
                    _ => {}
                }
            }

            ams.extend(pcm);

            while ams.packet_ready() {
                let pkt = match ams.encode_next() {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        tracing::error!("ALAC encode failed: {e}");
                        break;
                    }
                };

                for stream in streams.iter_mut().filter(|s| s.master_key == ams.key) {
                    match stream.state {
                        // A joiner's first audio packet carries the marker bit
                        StreamState::Connected => stream.send_packet(&pkt.with_marker()),
                        StreamState::Streaming => stream.send_packet(&pkt),
                        StreamState::Failed => {}
                    }
                }

                ams.commit(pkt);
            }
        }

        // Joiners have now had their init sync and marker packet
        let mut joined = Vec::new();
        for stream in streams
            .iter_mut()
            .filter(|s| s.state == StreamState::Connected && s.master_key.0 == quality)
        {
            stream.state = StreamState::Streaming;
            joined.push(stream.device_id);
        }
        joined
    }

    /// Serve a control-channel retransmit request from the matching
    /// session's ring. Missing packets are logged, never synthesised.
    pub fn retransmit(&mut self, peer: IpAddr, req: RetransmitRequest) {
        let Self {
            masters, streams, ..
        } = self;

        let Some(stream) = streams.iter_mut().find(|s| s.peer == peer) else {
            tracing::warn!("retransmit request from unknown peer {peer}");
            return;
        };
        let Some(ams) = masters.get(&stream.master_key) else {
            return;
        };

        let mut missing = false;
        let mut seq = req.seq_start;
        for _ in 0..req.seq_len {
            match ams.rtp.get(seq) {
                Some(pkt) => {
                    let pkt = pkt.clone();
                    stream.send_packet(&pkt);
                }
                None => missing = true,
            }
            seq = seq.wrapping_add(1);
        }

        if missing {
            tracing::warn!(
                "retransmit request from '{}' for seqnum {} (len {}) is partly outside the ring (next seqnum {})",
                stream.name,
                req.seq_start,
                req.seq_len,
                ams.rtp.seqnum
            );
        }
    }

    /// Ids of sessions marked failed by the send path
    #[must_use]
    pub fn failed_streams(&self) -> Vec<u64> {
        self.streams
            .iter()
            .filter(|s| s.state == StreamState::Failed)
            .map(|s| s.device_id)
            .collect()
    }

    /// True when a keep-alive-needing device is on the stream
    #[must_use]
    pub fn wants_keep_alive(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.keep_alive && s.state != StreamState::Failed)
    }
}
