//! Binary property list (bplist00) codec.
//!
//! The `/info` reply and every SETUP/SETPEERS/TEARDOWN payload is a binary
//! plist. Only the types AirPlay actually uses are supported: booleans,
//! integers, reals, strings, data, dates, arrays and dictionaries.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::{PlistDecodeError, decode};
pub use encode::{PlistEncodeError, encode};

use std::collections::HashMap;

/// A property list value
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Boolean(bool),
    /// Signed integer (covers every integer AirPlay sends)
    Integer(i64),
    /// Unsigned integer for values above `i64::MAX`
    UnsignedInteger(u64),
    Real(f64),
    String(String),
    Data(Vec<u8>),
    /// Seconds since 2001-01-01 00:00:00 UTC
    Date(f64),
    Array(Vec<PlistValue>),
    Dictionary(HashMap<String, PlistValue>),
}

impl PlistValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::UnsignedInteger(u) => (*u).try_into().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(i) => (*i).try_into().ok(),
            Self::UnsignedInteger(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PlistValue]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<String, PlistValue>> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup shorthand
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<bool> for PlistValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for PlistValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i64> for PlistValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u16> for PlistValue {
    fn from(v: u16) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for PlistValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u64> for PlistValue {
    fn from(v: u64) -> Self {
        Self::UnsignedInteger(v)
    }
}

impl From<f64> for PlistValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<String> for PlistValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for PlistValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for PlistValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Data(v)
    }
}

impl From<Vec<PlistValue>> for PlistValue {
    fn from(v: Vec<PlistValue>) -> Self {
        Self::Array(v)
    }
}

/// Builder for plist dictionaries
#[derive(Debug, Default)]
pub struct DictBuilder {
    map: HashMap<String, PlistValue>,
}

impl DictBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<PlistValue>) -> Self {
        self.map.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn insert_opt<V: Into<PlistValue>>(
        mut self,
        key: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        if let Some(v) = value {
            self.map.insert(key.into(), v.into());
        }
        self
    }

    #[must_use]
    pub fn build(self) -> PlistValue {
        PlistValue::Dictionary(self.map)
    }
}
