//! Conversion between structured values and the binary attribute stream.
//!
//! Each attribute on the wire is laid out as:
//!
//! ```text
//! +--------+---------------+------------+--------+---------+---------+
//! | kind:8 | length:24 (BE)| name_len:16| name   | payload | padding |
//! +--------+---------------+------------+--------+---------+---------+
//! ```
//!
//! `length` covers the header, name and payload but not the padding that
//! aligns the next attribute to four bytes. Tables and arrays carry nested
//! attributes as their payload; array members have empty names. A message is
//! the member stream of one top-level table.

use crate::config::BusConfig;
use crate::value::{Value, ValueKind};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;

const HEADER_LEN: usize = 6;
const MAX_ATTR_LEN: usize = 0x00FF_FFFF;
const MAX_DEPTH: usize = 64;

/// Errors produced while encoding or decoding an attribute stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("attribute stream truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("unknown attribute kind {0}")]
    InvalidKind(u8),

    #[error("attribute contains invalid UTF-8")]
    InvalidUtf8,

    #[error("top-level message must be a table, got {0}")]
    NotATable(ValueKind),

    #[error("message of {size} bytes exceeds the limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("attribute name of {0} bytes is too long")]
    NameTooLong(usize),

    #[error("{kind} payload has invalid size {len}")]
    BadPayload { kind: ValueKind, len: usize },

    #[error("attributes nested more than 64 levels deep")]
    TooDeep,
}

/// Name and kind of one top-level attribute, read without decoding its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub kind: ValueKind,
}

/// Converts between structured values and encoded messages.
pub trait Codec {
    /// Encode a table into a message.
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError>;

    /// Decode a message into a table.
    fn decode(&self, data: &[u8]) -> Result<Value, CodecError>;

    /// List the top-level attributes of a message in wire order.
    fn attributes(&self, data: &[u8]) -> Result<Vec<Attribute>, CodecError>;
}

/// The binary attribute codec used on the bus.
#[derive(Debug, Clone)]
pub struct BlobCodec {
    max_size: usize,
}

impl Default for BlobCodec {
    fn default() -> Self {
        Self {
            max_size: BusConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl BlobCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the size of encoded messages.
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Codec for BlobCodec {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        let map = match value {
            Value::Table(map) => map,
            other => return Err(CodecError::NotATable(other.kind())),
        };

        let mut buf = BytesMut::new();
        for (name, member) in map {
            put_attr(&mut buf, name, member, 0)?;
            if buf.len() > self.max_size {
                return Err(CodecError::TooLarge {
                    size: buf.len(),
                    max: self.max_size,
                });
            }
        }
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.len() > self.max_size {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        decode_table(data, 0)
    }

    fn attributes(&self, data: &[u8]) -> Result<Vec<Attribute>, CodecError> {
        let mut reader = AttrReader::new(data);
        let mut attrs = Vec::new();
        while let Some(raw) = reader.next_attr()? {
            attrs.push(Attribute {
                name: raw.name.to_string(),
                kind: raw.kind,
            });
        }
        Ok(attrs)
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn put_attr(buf: &mut BytesMut, name: &str, value: &Value, depth: usize) -> Result<(), CodecError> {
    if depth >= MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let name_len = u16::try_from(name.len()).map_err(|_| CodecError::NameTooLong(name.len()))?;

    let start = buf.len();
    buf.put_u32(0);
    buf.put_u16(name_len);
    buf.put_slice(name.as_bytes());

    match value {
        Value::Unspec => {}
        Value::Array(items) => {
            for item in items {
                put_attr(buf, "", item, depth + 1)?;
            }
        }
        Value::Table(map) => {
            for (key, member) in map {
                put_attr(buf, key, member, depth + 1)?;
            }
        }
        Value::String(s) => buf.put_slice(s.as_bytes()),
        Value::Int64(v) => buf.put_i64(*v),
        Value::Int32(v) => buf.put_i32(*v),
        Value::Int16(v) => buf.put_i16(*v),
        Value::Int8(v) => buf.put_i8(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
    }

    let len = buf.len() - start;
    if len > MAX_ATTR_LEN {
        return Err(CodecError::TooLarge {
            size: len,
            max: MAX_ATTR_LEN,
        });
    }
    let header = (u32::from(value.kind().tag()) << 24) | len as u32;
    buf[start..start + 4].copy_from_slice(&header.to_be_bytes());
    buf.put_bytes(0, padding(len));
    Ok(())
}

struct RawAttr<'a> {
    kind: ValueKind,
    name: &'a str,
    payload: &'a [u8],
}

struct AttrReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AttrReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next_attr(&mut self) -> Result<Option<RawAttr<'a>>, CodecError> {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        let truncated = CodecError::Truncated { offset: self.pos };
        if rest.len() < HEADER_LEN {
            return Err(truncated);
        }

        let header = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let tag = (header >> 24) as u8;
        let kind = ValueKind::from_tag(tag).ok_or(CodecError::InvalidKind(tag))?;
        let len = (header & MAX_ATTR_LEN as u32) as usize;
        let name_len = u16::from_be_bytes([rest[4], rest[5]]) as usize;
        if len < HEADER_LEN + name_len || len > rest.len() {
            return Err(truncated);
        }

        let name = std::str::from_utf8(&rest[HEADER_LEN..HEADER_LEN + name_len])
            .map_err(|_| CodecError::InvalidUtf8)?;
        let payload = &rest[HEADER_LEN + name_len..len];

        self.pos = (self.pos + len + padding(len)).min(self.data.len());
        Ok(Some(RawAttr {
            kind,
            name,
            payload,
        }))
    }
}

fn decode_table(data: &[u8], depth: usize) -> Result<Value, CodecError> {
    let mut reader = AttrReader::new(data);
    let mut map = BTreeMap::new();
    while let Some(raw) = reader.next_attr()? {
        let value = decode_value(raw.kind, raw.payload, depth)?;
        map.insert(raw.name.to_string(), value);
    }
    Ok(Value::Table(map))
}

fn decode_array(data: &[u8], depth: usize) -> Result<Value, CodecError> {
    let mut reader = AttrReader::new(data);
    let mut items = Vec::new();
    while let Some(raw) = reader.next_attr()? {
        items.push(decode_value(raw.kind, raw.payload, depth)?);
    }
    Ok(Value::Array(items))
}

fn fixed<const N: usize>(kind: ValueKind, payload: &[u8]) -> Result<[u8; N], CodecError> {
    payload.try_into().map_err(|_| CodecError::BadPayload {
        kind,
        len: payload.len(),
    })
}

fn decode_value(kind: ValueKind, payload: &[u8], depth: usize) -> Result<Value, CodecError> {
    if depth >= MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let value = match kind {
        ValueKind::Unspec => {
            if !payload.is_empty() {
                return Err(CodecError::BadPayload {
                    kind,
                    len: payload.len(),
                });
            }
            Value::Unspec
        }
        ValueKind::Array => decode_array(payload, depth + 1)?,
        ValueKind::Table => decode_table(payload, depth + 1)?,
        ValueKind::String => Value::String(
            std::str::from_utf8(payload)
                .map_err(|_| CodecError::InvalidUtf8)?
                .to_string(),
        ),
        ValueKind::Int64 => Value::Int64(i64::from_be_bytes(fixed(kind, payload)?)),
        ValueKind::Int32 => Value::Int32(i32::from_be_bytes(fixed(kind, payload)?)),
        ValueKind::Int16 => Value::Int16(i16::from_be_bytes(fixed(kind, payload)?)),
        ValueKind::Int8 => Value::Int8(i8::from_be_bytes(fixed(kind, payload)?)),
        ValueKind::Double => Value::Double(f64::from_be_bytes(fixed(kind, payload)?)),
        ValueKind::Bool => Value::Bool(fixed::<1>(kind, payload)?[0] != 0),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::table([
            ("name", Value::from("eth0")),
            ("up", Value::Bool(true)),
            ("flags", Value::Int8(3)),
            ("mtu", Value::Int16(1500)),
            ("id", Value::Int32(-7)),
            ("bytes", Value::Int64(1 << 40)),
            ("load", Value::Double(0.25)),
            ("none", Value::Unspec),
            (
                "addrs",
                Value::Array(vec![
                    Value::from("10.0.0.1"),
                    Value::table([("prefix", Value::Int32(24))]),
                ]),
            ),
        ])
    }

    #[test]
    fn test_roundtrip_nested() {
        let codec = BlobCodec::new();
        let encoded = codec.encode(&sample()).unwrap();
        assert_eq!(encoded.len() % 4, 0);
        assert_eq!(codec.decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_empty_message() {
        let codec = BlobCodec::new();
        let encoded = codec.encode(&Value::empty_table()).unwrap();
        assert!(encoded.is_empty());
        assert_eq!(codec.decode(&[]).unwrap(), Value::empty_table());
    }

    #[test]
    fn test_top_level_must_be_table() {
        let codec = BlobCodec::new();
        assert_eq!(
            codec.encode(&Value::from("x")),
            Err(CodecError::NotATable(ValueKind::String))
        );
    }

    #[test]
    fn test_attribute_layout() {
        let codec = BlobCodec::new();
        let encoded = codec
            .encode(&Value::table([("a", Value::Int32(1))]))
            .unwrap();
        // header(4) + name_len(2) + "a"(1) + i32(4) = 11, padded to 12
        assert_eq!(
            &encoded[..],
            &[5, 0, 0, 11, 0, 1, b'a', 0, 0, 0, 1, 0][..]
        );
    }

    #[test]
    fn test_attributes_scan() {
        let codec = BlobCodec::new();
        let encoded = codec.encode(&sample()).unwrap();
        let attrs = codec.attributes(&encoded).unwrap();
        assert_eq!(attrs.len(), 9);
        let addrs = attrs.iter().find(|a| a.name == "addrs").unwrap();
        assert_eq!(addrs.kind, ValueKind::Array);
        let up = attrs.iter().find(|a| a.name == "up").unwrap();
        assert_eq!(up.kind, ValueKind::Bool);
    }

    #[test]
    fn test_truncated_input() {
        let codec = BlobCodec::new();
        let encoded = codec.encode(&sample()).unwrap();
        let err = codec.decode(&encoded[..encoded.len() - 6]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
        assert!(matches!(
            codec.decode(&[0, 0]),
            Err(CodecError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn test_invalid_kind() {
        let codec = BlobCodec::new();
        let data = [42, 0, 0, 6, 0, 0, 0, 0];
        assert_eq!(codec.decode(&data), Err(CodecError::InvalidKind(42)));
    }

    #[test]
    fn test_bad_payload_size() {
        let codec = BlobCodec::new();
        // int32 attribute carrying two payload bytes
        let data = [5, 0, 0, 9, 0, 1, b'a', 0, 1, 0, 0, 0];
        assert_eq!(
            codec.decode(&data),
            Err(CodecError::BadPayload {
                kind: ValueKind::Int32,
                len: 2
            })
        );
    }

    #[test]
    fn test_invalid_utf8_name() {
        let codec = BlobCodec::new();
        let data = [0, 0, 0, 7, 0, 1, 0xff, 0];
        assert_eq!(codec.decode(&data), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_size_limit() {
        let codec = BlobCodec::with_max_size(16);
        let big = Value::table([("blob", Value::from("x".repeat(64)))]);
        assert!(matches!(
            codec.encode(&big),
            Err(CodecError::TooLarge { max: 16, .. })
        ));
    }
}
