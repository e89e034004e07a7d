//! Typed values
//!
//! Keys of conntrack entries and fields of events are typed values. A value
//! compares equal only to a value of the same type, and exposes a canonical
//! byte view that the conntrack hash functions consume.

use std::borrow::Cow;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// Type tag of a [`Value`], used by event schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    String,
    Bytes,
    Ipv4,
    Ipv6,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::U8 => "uint8",
            ValueType::U16 => "uint16",
            ValueType::U32 => "uint32",
            ValueType::U64 => "uint64",
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::Ipv4 => "ipv4",
            ValueType::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    String(String),
    Bytes(Vec<u8>),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::U8(_) => ValueType::U8,
            Value::U16(_) => ValueType::U16,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Ipv4(_) => ValueType::Ipv4,
            Value::Ipv6(_) => ValueType::Ipv6,
        }
    }

    /// Size in bytes of the canonical representation
    pub fn value_size(&self) -> usize {
        match self {
            Value::Bool(_) | Value::U8(_) => 1,
            Value::U16(_) => 2,
            Value::U32(_) | Value::Ipv4(_) => 4,
            Value::U64(_) => 8,
            Value::Ipv6(_) => 16,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }

    /// Canonical byte view used for hashing.
    ///
    /// Integers use native byte order, addresses network byte order.
    pub fn canonical_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Value::Bool(v) => Cow::Owned(vec![*v as u8]),
            Value::U8(v) => Cow::Owned(vec![*v]),
            Value::U16(v) => Cow::Owned(v.to_ne_bytes().to_vec()),
            Value::U32(v) => Cow::Owned(v.to_ne_bytes().to_vec()),
            Value::U64(v) => Cow::Owned(v.to_ne_bytes().to_vec()),
            Value::Ipv4(v) => Cow::Owned(v.octets().to_vec()),
            Value::Ipv6(v) => Cow::Owned(v.octets().to_vec()),
            Value::String(s) => Cow::Borrowed(s.as_bytes()),
            Value::Bytes(b) => Cow::Borrowed(b.as_slice()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", if *v { "yes" } else { "no" }),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Ipv4(v) => write!(f, "{}", v),
            Value::Ipv6(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<Ipv4Addr> for Value {
    fn from(v: Ipv4Addr) -> Self {
        Value::Ipv4(v)
    }
}

impl From<Ipv6Addr> for Value {
    fn from(v: Ipv6Addr) -> Self {
        Value::Ipv6(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_typed() {
        assert_eq!(Value::U32(5), Value::U32(5));
        assert_ne!(Value::U32(5), Value::U64(5));
        assert_ne!(Value::from("a"), Value::Bytes(b"a".to_vec()));
    }

    #[test]
    fn test_value_size_matches_canonical_bytes() {
        let values = [
            Value::Bool(true),
            Value::U16(80),
            Value::U32(1),
            Value::U64(1),
            Value::Ipv4(Ipv4Addr::new(10, 0, 0, 1)),
            Value::Ipv6(Ipv6Addr::LOCALHOST),
            Value::from("imap"),
        ];
        for v in &values {
            assert_eq!(v.value_size(), v.canonical_bytes().len(), "{:?}", v);
        }
    }

    #[test]
    fn test_ipv4_canonical_is_network_order() {
        let v = Value::Ipv4(Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(v.canonical_bytes().as_ref(), &[192, 168, 1, 2]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "dead");
        assert_eq!(Value::U64(42).to_string(), "42");
        assert_eq!(Value::from("OK").to_string(), "OK");
    }
}
