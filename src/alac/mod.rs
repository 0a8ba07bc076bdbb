//! ALAC packetising for the RTP stream, plus the MP4/ALAC header artefact
//! the transcode cache stores so new sessions can serve a prepared init
//! segment without running a decode prelude.


use alac_encoder::{AlacEncoder, FormatDescription};
use thiserror::Error;

use crate::types::AudioQuality;

/// Samples per ALAC packet, fixed by the stream SETUP (`spf`)
pub const SAMPLES_PER_PACKET: u32 = 352;

/// Errors from the packet encoder
#[derive(Debug, Error)]
pub enum AlacError {
    #[error("invalid frame size: expected {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("unsupported quality: {0}-bit audio")]
    UnsupportedQuality(u8),
}

/// Stateful PCM-to-ALAC packet encoder. One instance lives in each master
/// session; its state persists across packets for the whole stream.
pub struct AlacPacketEncoder {
    encoder: AlacEncoder,
    input_format: FormatDescription,
    quality: AudioQuality,
    frame_bytes: usize,
    out_buffer: Vec<u8>,
}

impl AlacPacketEncoder {
    pub fn new(quality: AudioQuality) -> Result<Self, AlacError> {
        if quality.bits_per_sample != 16 {
            return Err(AlacError::UnsupportedQuality(quality.bits_per_sample));
        }

        let output_format = FormatDescription::alac(
            f64::from(quality.sample_rate),
            SAMPLES_PER_PACKET,
            u32::from(quality.channels),
        );
        let input_format = FormatDescription::pcm::<i16>(
            f64::from(quality.sample_rate),
            u32::from(quality.channels),
        );

        let frame_bytes = quality.samples_to_bytes(SAMPLES_PER_PACKET as usize);

        Ok(Self {
            encoder: AlacEncoder::new(&output_format),
            input_format,
            quality,
            frame_bytes,
            // Worst case is the frame plus a small ALAC escape header
            out_buffer: vec![0u8; frame_bytes + 64],
        })
    }

    /// Encode one fixed-size block of interleaved PCM into ALAC payload
    /// bytes. Input must be exactly one packet worth.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<&[u8], AlacError> {
        if pcm.len() != self.frame_bytes {
            return Err(AlacError::InvalidFrameSize {
                expected: self.frame_bytes,
                actual: pcm.len(),
            });
        }

        let len = self
            .encoder
            .encode(&self.input_format, pcm, &mut self.out_buffer);
        Ok(&self.out_buffer[..len])
    }

    /// The ALACSpecificConfig magic cookie describing this encoder's
    /// configuration, embedded in the MP4 sample description
    #[must_use]
    pub fn magic_cookie(&self) -> Vec<u8> {
        magic_cookie(self.quality)
    }

    /// Input bytes consumed per packet
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    #[must_use]
    pub fn quality(&self) -> AudioQuality {
        self.quality
    }
}

/// The 24-byte ALACSpecificConfig: frame length, rice tuning, channel
/// layout and sample rate, all big-endian
#[must_use]
pub fn magic_cookie(quality: AudioQuality) -> Vec<u8> {
    let mut cookie = Vec::with_capacity(24);
    cookie.extend_from_slice(&SAMPLES_PER_PACKET.to_be_bytes()); // frameLength
    cookie.push(0); // compatibleVersion
    cookie.push(quality.bits_per_sample); // bitDepth
    cookie.push(40); // pb
    cookie.push(10); // mb
    cookie.push(14); // kb
    cookie.push(quality.channels); // numChannels
    cookie.extend_from_slice(&255u16.to_be_bytes()); // maxRun
    cookie.extend_from_slice(&0u32.to_be_bytes()); // maxFrameBytes (unknown)
    cookie.extend_from_slice(&0u32.to_be_bytes()); // avgBitRate (unknown)
    cookie.extend_from_slice(&quality.sample_rate.to_be_bytes());
    cookie
}

/// Builds the MP4 init header (`ftyp` + `moov`) for an ALAC stream. This is
/// the slow artefact prepared on worker threads and cached per file under the
/// "mp4" format key.
pub struct Mp4Header {
    quality: AudioQuality,
    magic_cookie: Vec<u8>,
}

impl Mp4Header {
    /// Validates the quality against the encoder and captures its cookie
    pub fn prepare(quality: AudioQuality) -> Result<Self, AlacError> {
        let encoder = AlacPacketEncoder::new(quality)?;
        Ok(Self {
            quality,
            magic_cookie: encoder.magic_cookie(),
        })
    }

    /// Serialise the header bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);

        push_box(&mut out, b"ftyp", |b| {
            b.extend_from_slice(b"M4A ");
            b.extend_from_slice(&0u32.to_be_bytes());
            b.extend_from_slice(b"M4A mp42isom");
        });

        let cookie = &self.magic_cookie;
        let quality = self.quality;
        push_box(&mut out, b"moov", |moov| {
            push_box(moov, b"mvhd", |b| {
                b.extend_from_slice(&[0u8; 12]); // version/flags, times
                b.extend_from_slice(&quality.sample_rate.to_be_bytes()); // timescale
                b.extend_from_slice(&0u32.to_be_bytes()); // duration unknown
                b.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
                b.extend_from_slice(&[0u8; 6]);
                b.extend_from_slice(&unity_matrix());
                b.extend_from_slice(&[0u8; 24]);
                b.extend_from_slice(&2u32.to_be_bytes()); // next track id
            });
            push_box(moov, b"trak", |trak| {
                push_box(trak, b"mdia", |mdia| {
                    push_box(mdia, b"mdhd", |b| {
                        b.extend_from_slice(&[0u8; 12]);
                        b.extend_from_slice(&quality.sample_rate.to_be_bytes());
                        b.extend_from_slice(&0u32.to_be_bytes());
                        b.extend_from_slice(&[0x55, 0xc4, 0, 0]); // und, quality
                    });
                    push_box(mdia, b"minf", |minf| {
                        push_box(minf, b"stbl", |stbl| {
                            push_box(stbl, b"stsd", |stsd| {
                                stsd.extend_from_slice(&[0u8; 4]);
                                stsd.extend_from_slice(&1u32.to_be_bytes());
                                push_box(stsd, b"alac", |entry| {
                                    entry.extend_from_slice(&[0u8; 6]); // reserved
                                    entry.extend_from_slice(&1u16.to_be_bytes()); // data ref
                                    entry.extend_from_slice(&[0u8; 8]);
                                    entry.extend_from_slice(
                                        &u16::from(quality.channels).to_be_bytes(),
                                    );
                                    entry.extend_from_slice(
                                        &u16::from(quality.bits_per_sample).to_be_bytes(),
                                    );
                                    entry.extend_from_slice(&[0u8; 4]);
                                    // 16.16 sample rate
                                    entry.extend_from_slice(
                                        &(quality.sample_rate << 16).to_be_bytes(),
                                    );
                                    push_box(entry, b"alac", |cookie_box| {
                                        cookie_box.extend_from_slice(&[0u8; 4]);
                                        cookie_box.extend_from_slice(cookie);
                                    });
                                });
                            });
                        });
                    });
                });
            });
        });

        out
    }
}

/// Append a length-prefixed MP4 box, filling the payload via the closure
fn push_box(out: &mut Vec<u8>, name: &[u8; 4], fill: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(name);
    fill(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn unity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}
