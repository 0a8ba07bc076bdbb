use thiserror::Error;

use super::PlistValue;

/// Errors during binary plist encoding
#[derive(Debug, Error)]
pub enum PlistEncodeError {
    #[error("too many objects: {0}")]
    TooManyObjects(usize),
}

/// Encode a value to bplist00 bytes
pub fn encode(value: &PlistValue) -> Result<Vec<u8>, PlistEncodeError> {
    let mut encoder = Encoder::default();
    encoder.encode(value)
}

#[derive(Default)]
struct Encoder {
    objects: Vec<u8>,
    offsets: Vec<u64>,
}

impl Encoder {
    fn encode(&mut self, value: &PlistValue) -> Result<Vec<u8>, PlistEncodeError> {
        let mut output = Vec::new();
        output.extend_from_slice(b"bplist00");

        let root_index = self.encode_value(value)?;

        if self.offsets.len() > u16::MAX as usize {
            return Err(PlistEncodeError::TooManyObjects(self.offsets.len()));
        }

        let objects_start = output.len();
        output.extend_from_slice(&self.objects);

        let offset_table_offset = output.len();
        let offset_size = int_size((objects_start + self.objects.len()) as u64);
        for &offset in &self.offsets {
            write_sized_int(&mut output, objects_start as u64 + offset, offset_size);
        }

        // 32-byte trailer: 6 pad bytes, offset size, ref size, then three
        // big-endian u64s: object count, root index, offset table offset
        output.extend_from_slice(&[0u8; 6]);
        output.push(offset_size);
        output.push(REF_SIZE);
        output.extend_from_slice(&(self.offsets.len() as u64).to_be_bytes());
        output.extend_from_slice(&(root_index as u64).to_be_bytes());
        output.extend_from_slice(&(offset_table_offset as u64).to_be_bytes());

        Ok(output)
    }

    fn encode_value(&mut self, value: &PlistValue) -> Result<usize, PlistEncodeError> {
        // Containers encode children first so their refs exist
        match value {
            PlistValue::Array(arr) => {
                let mut refs = Vec::with_capacity(arr.len());
                for item in arr {
                    refs.push(self.encode_value(item)?);
                }
                let index = self.begin_object();
                self.write_marker(0xa0, refs.len());
                for r in &refs {
                    self.write_ref(*r);
                }
                Ok(index)
            }
            PlistValue::Dictionary(dict) => {
                // Sorted keys keep the output deterministic
                let mut entries: Vec<_> = dict.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));

                let mut key_refs = Vec::with_capacity(entries.len());
                let mut value_refs = Vec::with_capacity(entries.len());
                for (key, val) in entries {
                    key_refs.push(self.encode_value(&PlistValue::String(key.clone()))?);
                    value_refs.push(self.encode_value(val)?);
                }

                let index = self.begin_object();
                self.write_marker(0xd0, key_refs.len());
                for r in key_refs.iter().chain(&value_refs) {
                    self.write_ref(*r);
                }
                Ok(index)
            }
            PlistValue::Boolean(b) => {
                let index = self.begin_object();
                self.objects.push(if *b { 0x09 } else { 0x08 });
                Ok(index)
            }
            PlistValue::Integer(i) => {
                let index = self.begin_object();
                self.write_integer(*i);
                Ok(index)
            }
            PlistValue::UnsignedInteger(u) => {
                let index = self.begin_object();
                if let Ok(i) = i64::try_from(*u) {
                    self.write_integer(i);
                } else {
                    // Values over i64::MAX use the 16-byte form
                    self.objects.push(0x14);
                    self.objects.extend_from_slice(&[0u8; 8]);
                    self.objects.extend_from_slice(&u.to_be_bytes());
                }
                Ok(index)
            }
            PlistValue::Real(f) => {
                let index = self.begin_object();
                self.objects.push(0x23);
                self.objects.extend_from_slice(&f.to_be_bytes());
                Ok(index)
            }
            PlistValue::Date(secs) => {
                let index = self.begin_object();
                self.objects.push(0x33);
                self.objects.extend_from_slice(&secs.to_be_bytes());
                Ok(index)
            }
            PlistValue::Data(data) => {
                let index = self.begin_object();
                self.write_marker(0x40, data.len());
                self.objects.extend_from_slice(data);
                Ok(index)
            }
            PlistValue::String(s) => {
                let index = self.begin_object();
                if s.is_ascii() {
                    self.write_marker(0x50, s.len());
                    self.objects.extend_from_slice(s.as_bytes());
                } else {
                    let utf16: Vec<u16> = s.encode_utf16().collect();
                    self.write_marker(0x60, utf16.len());
                    for unit in utf16 {
                        self.objects.extend_from_slice(&unit.to_be_bytes());
                    }
                }
                Ok(index)
            }
        }
    }

    fn begin_object(&mut self) -> usize {
        self.offsets.push(self.objects.len() as u64);
        self.offsets.len() - 1
    }

    /// Marker byte with embedded count, or 0x0f + following integer for
    /// counts of 15 and up
    fn write_marker(&mut self, marker: u8, count: usize) {
        if count < 15 {
            #[allow(clippy::cast_possible_truncation)]
            self.objects.push(marker | count as u8);
        } else {
            self.objects.push(marker | 0x0f);
            self.write_integer(count as i64);
        }
    }

    fn write_integer(&mut self, value: i64) {
        if value < 0 {
            // Negative integers always use the 8-byte form
            self.objects.push(0x13);
            self.objects.extend_from_slice(&value.to_be_bytes());
        } else if value <= i64::from(u8::MAX) {
            self.objects.push(0x10);
            self.objects.push(value as u8);
        } else if value <= i64::from(u16::MAX) {
            self.objects.push(0x11);
            self.objects.extend_from_slice(&(value as u16).to_be_bytes());
        } else if value <= i64::from(u32::MAX) {
            self.objects.push(0x12);
            self.objects.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.objects.push(0x13);
            self.objects.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn write_ref(&mut self, index: usize) {
        self.objects
            .extend_from_slice(&(index as u16).to_be_bytes());
    }
}

/// Object references are fixed at two bytes (up to 65535 objects)
const REF_SIZE: u8 = 2;

fn int_size(max: u64) -> u8 {
    if max <= u64::from(u8::MAX) {
        1
    } else if max <= u64::from(u16::MAX) {
        2
    } else if max <= u64::from(u32::MAX) {
        4
    } else {
        8
    }
}

fn write_sized_int(out: &mut Vec<u8>, value: u64, size: u8) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - size as usize..]);
}
