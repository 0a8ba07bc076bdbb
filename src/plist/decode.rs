use std::collections::HashMap;

use thiserror::Error;

use super::PlistValue;

/// Errors during binary plist decoding
#[derive(Debug, Error)]
pub enum PlistDecodeError {
    #[error("not a binary plist")]
    InvalidMagic,

    #[error("truncated plist")]
    Truncated,

    #[error("invalid trailer")]
    InvalidTrailer,

    #[error("invalid object marker 0x{0:02x}")]
    InvalidMarker(u8),

    #[error("object reference out of range: {0}")]
    InvalidReference(usize),

    #[error("recursion limit exceeded")]
    TooDeep,

    #[error("invalid UTF-8 string")]
    InvalidString,
}

const MAX_DEPTH: usize = 32;

/// Decode bplist00 bytes into a value
pub fn decode(data: &[u8]) -> Result<PlistValue, PlistDecodeError> {
    if data.len() < 40 {
        return Err(PlistDecodeError::Truncated);
    }
    if &data[..8] != b"bplist00" && &data[..8] != b"bplist01" {
        return Err(PlistDecodeError::InvalidMagic);
    }

    // Trailer: last 32 bytes
    let trailer = &data[data.len() - 32..];
    let offset_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().unwrap()) as usize;
    let root_index = u64::from_be_bytes(trailer[16..24].try_into().unwrap()) as usize;
    let table_offset = u64::from_be_bytes(trailer[24..32].try_into().unwrap()) as usize;

    if offset_size == 0 || offset_size > 8 || ref_size == 0 || ref_size > 8 {
        return Err(PlistDecodeError::InvalidTrailer);
    }
    let table_len = num_objects
        .checked_mul(offset_size)
        .ok_or(PlistDecodeError::InvalidTrailer)?;
    if table_offset
        .checked_add(table_len)
        .is_none_or(|end| end > data.len() - 32)
    {
        return Err(PlistDecodeError::InvalidTrailer);
    }

    let mut offsets = Vec::with_capacity(num_objects);
    for i in 0..num_objects {
        let start = table_offset + i * offset_size;
        offsets.push(read_sized_int(&data[start..start + offset_size]) as usize);
    }

    let decoder = Decoder {
        data,
        offsets,
        ref_size,
    };
    decoder.decode_object(root_index, 0)
}

struct Decoder<'a> {
    data: &'a [u8],
    offsets: Vec<usize>,
    ref_size: usize,
}

impl Decoder<'_> {
    fn decode_object(&self, index: usize, depth: usize) -> Result<PlistValue, PlistDecodeError> {
        if depth > MAX_DEPTH {
            return Err(PlistDecodeError::TooDeep);
        }

        let offset = *self
            .offsets
            .get(index)
            .ok_or(PlistDecodeError::InvalidReference(index))?;
        let marker = *self.data.get(offset).ok_or(PlistDecodeError::Truncated)?;

        match marker {
            0x00 => Ok(PlistValue::Data(Vec::new())), // null, mapped to empty data
            0x08 => Ok(PlistValue::Boolean(false)),
            0x09 => Ok(PlistValue::Boolean(true)),
            0x10..=0x14 => self.decode_integer(offset),
            0x22 => {
                let bytes = self.slice(offset + 1, 4)?;
                Ok(PlistValue::Real(f64::from(f32::from_be_bytes(
                    bytes.try_into().map_err(|_| PlistDecodeError::Truncated)?,
                ))))
            }
            0x23 => {
                let bytes = self.slice(offset + 1, 8)?;
                Ok(PlistValue::Real(f64::from_be_bytes(
                    bytes.try_into().map_err(|_| PlistDecodeError::Truncated)?,
                )))
            }
            0x33 => {
                let bytes = self.slice(offset + 1, 8)?;
                Ok(PlistValue::Date(f64::from_be_bytes(
                    bytes.try_into().map_err(|_| PlistDecodeError::Truncated)?,
                )))
            }
            0x40..=0x4f => {
                let (len, start) = self.decode_length(offset, marker)?;
                Ok(PlistValue::Data(self.slice(start, len)?.to_vec()))
            }
            0x50..=0x5f => {
                let (len, start) = self.decode_length(offset, marker)?;
                let s = std::str::from_utf8(self.slice(start, len)?)
                    .map_err(|_| PlistDecodeError::InvalidString)?;
                Ok(PlistValue::String(s.to_string()))
            }
            0x60..=0x6f => {
                let (len, start) = self.decode_length(offset, marker)?;
                let bytes = self.slice(start, len * 2)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units)
                    .map(PlistValue::String)
                    .map_err(|_| PlistDecodeError::InvalidString)
            }
            0xa0..=0xaf => {
                let (len, start) = self.decode_length(offset, marker)?;
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let r = self.read_ref(start + i * self.ref_size)?;
                    items.push(self.decode_object(r, depth + 1)?);
                }
                Ok(PlistValue::Array(items))
            }
            0xd0..=0xdf => {
                let (len, start) = self.decode_length(offset, marker)?;
                let mut dict = HashMap::with_capacity(len);
                for i in 0..len {
                    let key_ref = self.read_ref(start + i * self.ref_size)?;
                    let value_ref = self.read_ref(start + (len + i) * self.ref_size)?;

                    let key = match self.decode_object(key_ref, depth + 1)? {
                        PlistValue::String(s) => s,
                        _ => return Err(PlistDecodeError::InvalidMarker(marker)),
                    };
                    dict.insert(key, self.decode_object(value_ref, depth + 1)?);
                }
                Ok(PlistValue::Dictionary(dict))
            }
            _ => Err(PlistDecodeError::InvalidMarker(marker)),
        }
    }

    fn decode_integer(&self, offset: usize) -> Result<PlistValue, PlistDecodeError> {
        let marker = self.data[offset];
        let nbytes = 1usize << (marker & 0x0f);
        let bytes = self.slice(offset + 1, nbytes)?;

        match nbytes {
            1 | 2 | 4 => Ok(PlistValue::Integer(read_sized_int(bytes) as i64)),
            // 8-byte integers are signed
            8 => Ok(PlistValue::Integer(i64::from_be_bytes(
                bytes.try_into().map_err(|_| PlistDecodeError::Truncated)?,
            ))),
            16 => {
                // Only the low 8 bytes carry a value we can represent
                let value = u64::from_be_bytes(
                    bytes[8..].try_into().map_err(|_| PlistDecodeError::Truncated)?,
                );
                Ok(PlistValue::UnsignedInteger(value))
            }
            _ => Err(PlistDecodeError::InvalidMarker(marker)),
        }
    }

    /// Container/data lengths: low nibble, or a following integer when 0x0f
    fn decode_length(&self, offset: usize, marker: u8) -> Result<(usize, usize), PlistDecodeError> {
        let low = (marker & 0x0f) as usize;
        if low != 0x0f {
            return Ok((low, offset + 1));
        }

        let int_marker = *self
            .data
            .get(offset + 1)
            .ok_or(PlistDecodeError::Truncated)?;
        if int_marker & 0xf0 != 0x10 {
            return Err(PlistDecodeError::InvalidMarker(int_marker));
        }
        let nbytes = 1usize << (int_marker & 0x0f);
        let bytes = self.slice(offset + 2, nbytes)?;

        // No object can be longer than the input itself
        let len = read_sized_int(bytes) as usize;
        if len > self.data.len() {
            return Err(PlistDecodeError::Truncated);
        }
        Ok((len, offset + 2 + nbytes))
    }

    fn read_ref(&self, offset: usize) -> Result<usize, PlistDecodeError> {
        Ok(read_sized_int(self.slice(offset, self.ref_size)?) as usize)
    }

    fn slice(&self, start: usize, len: usize) -> Result<&[u8], PlistDecodeError> {
        self.data
            .get(start..start + len)
            .ok_or(PlistDecodeError::Truncated)
    }
}

fn read_sized_int(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
