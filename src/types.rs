//! Tagged value union and record encoding.
//!
//! The storage engine treats rows as opaque byte strings; this module is the
//! shared vocabulary between the SQL layer and the engine. A record is a
//! sequence of tagged values:
//!
//!   [value_count: u16] then per value: [tag: u8] [payload]
//!
//! All multi-byte integers are big-endian.

use std::fmt;

use crate::error::{Result, TurError};

const TAG_NULL: u8 = 0;
const TAG_SMALL_INT: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_SERIAL: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_BLOB: u8 = 6;
const TAG_VECTOR: u8 = 7;
const TAG_DATE: u8 = 8;
const TAG_TIME: u8 = 9;
const TAG_TIMESTAMP: u8 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// 32-bit integer.
    SmallInt(i32),
    /// 64-bit integer; integer primary keys alias the rowid.
    Int(i64),
    /// Monotonic unsigned identity (rowid-shaped).
    Serial(u64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Dense f32 vector, L2-normalized before it reaches the HNSW index.
    Vector(Vec<f32>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SmallInt(v) => Some(*v as i64),
            Value::Int(v) => Some(*v),
            Value::Serial(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::SmallInt(_) => TAG_SMALL_INT,
            Value::Int(_) => TAG_INT,
            Value::Serial(_) => TAG_SERIAL,
            Value::Float(_) => TAG_FLOAT,
            Value::Text(_) => TAG_TEXT,
            Value::Blob(_) => TAG_BLOB,
            Value::Vector(_) => TAG_VECTOR,
            Value::Date(_) => TAG_DATE,
            Value::Time(_) => TAG_TIME,
            Value::Timestamp(_) => TAG_TIMESTAMP,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Serial(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Blob(v) => write!(f, "<blob {} bytes>", v.len()),
            Value::Vector(v) => write!(f, "<vector dim={}>", v.len()),
            Value::Date(v) => write!(f, "date({})", v),
            Value::Time(v) => write!(f, "time({})", v),
            Value::Timestamp(v) => write!(f, "timestamp({})", v),
        }
    }
}

/// Encode a record (sequence of values) into bytes.
pub fn encode_record(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + values.len() * 9);
    buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        buf.push(value.tag());
        match value {
            Value::Null => {}
            Value::SmallInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Serial(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Float(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Text(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
            Value::Blob(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
                buf.extend_from_slice(v);
            }
            Value::Vector(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
                for &x in v {
                    buf.extend_from_slice(&x.to_bits().to_be_bytes());
                }
            }
            Value::Date(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Time(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Timestamp(v) => buf.extend_from_slice(&v.to_be_bytes()),
        }
    }
    buf
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if data.len() < *pos + n {
        return Err(TurError::Corruption("truncated record".into()));
    }
    let out = &data[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

/// Decode a record previously produced by [`encode_record`].
pub fn decode_record(data: &[u8]) -> Result<Vec<Value>> {
    let mut pos = 0usize;
    let count = u16::from_be_bytes(take(data, &mut pos, 2)?.try_into().unwrap()) as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = take(data, &mut pos, 1)?[0];
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_SMALL_INT => {
                Value::SmallInt(i32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap()))
            }
            TAG_INT => Value::Int(i64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap())),
            TAG_SERIAL => {
                Value::Serial(u64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap()))
            }
            TAG_FLOAT => Value::Float(f64::from_bits(u64::from_be_bytes(
                take(data, &mut pos, 8)?.try_into().unwrap(),
            ))),
            TAG_TEXT => {
                let len =
                    u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap()) as usize;
                let bytes = take(data, &mut pos, len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| TurError::Corruption("invalid UTF-8 in text value".into()))?;
                Value::Text(text.to_string())
            }
            TAG_BLOB => {
                let len =
                    u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap()) as usize;
                Value::Blob(take(data, &mut pos, len)?.to_vec())
            }
            TAG_VECTOR => {
                let dim =
                    u32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap()) as usize;
                let bytes = take(data, &mut pos, dim * 4)?;
                let mut vec = Vec::with_capacity(dim);
                for chunk in bytes.chunks_exact(4) {
                    vec.push(f32::from_bits(u32::from_be_bytes(chunk.try_into().unwrap())));
                }
                Value::Vector(vec)
            }
            TAG_DATE => {
                Value::Date(i32::from_be_bytes(take(data, &mut pos, 4)?.try_into().unwrap()))
            }
            TAG_TIME => {
                Value::Time(i64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap()))
            }
            TAG_TIMESTAMP => {
                Value::Timestamp(i64::from_be_bytes(take(data, &mut pos, 8)?.try_into().unwrap()))
            }
            other => {
                return Err(TurError::Corruption(format!("unknown value tag {}", other)));
            }
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let values = vec![
            Value::Null,
            Value::SmallInt(-7),
            Value::Int(i64::MIN),
            Value::Serial(42),
            Value::Float(2.5),
            Value::Text("hello".into()),
            Value::Blob(vec![0xDE, 0xAD]),
            Value::Vector(vec![0.1, 0.2, 0.3]),
            Value::Date(19000),
            Value::Time(12 * 3_600 * 1_000_000),
            Value::Timestamp(1_700_000_000_000_000),
        ];
        let encoded = encode_record(&values);
        let decoded = decode_record(&encoded).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn truncated_record_is_error() {
        let encoded = encode_record(&[Value::Text("hello world".into())]);
        assert!(decode_record(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn int_accessors() {
        assert_eq!(Value::SmallInt(5).as_i64(), Some(5));
        assert_eq!(Value::Int(-5).as_i64(), Some(-5));
        assert_eq!(Value::Serial(5).as_i64(), Some(5));
        assert_eq!(Value::Text("x".into()).as_i64(), None);
    }
}
