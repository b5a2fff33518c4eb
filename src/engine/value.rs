//! Column values and their binary encoding
//!
//! The wire format is hand-rolled: a tag byte followed by the value
//! bytes, integers little-endian, strings and blobs length-prefixed.
//! Decoding failures inside a checksummed frame are corruption, not
//! recoverable I/O conditions.

use super::errors::{EngineError, EngineResult};

/// The declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// 64-bit signed integer
    Int,
    /// UTF-8 text
    Text,
    /// Opaque byte blob
    Bytes,
}

/// A single column value inside a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// One table row, column values in schema order.
pub type Row = Vec<Value>;

const TAG_INT: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_BYTES: u8 = 2;

impl Value {
    /// The column kind this value satisfies.
    pub fn kind(&self) -> ColumnKind {
        match self {
            Value::Int(_) => ColumnKind::Int,
            Value::Text(_) => ColumnKind::Text,
            Value::Bytes(_) => ColumnKind::Bytes,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Appends the encoded form of this value to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(TAG_BYTES);
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    /// Decodes one value from `data` starting at `*pos`, advancing
    /// `*pos` past the consumed bytes.
    pub fn decode(data: &[u8], pos: &mut usize) -> EngineResult<Value> {
        let tag = *take(data, pos, 1)?
            .first()
            .ok_or_else(|| corruption("empty value tag"))?;
        match tag {
            TAG_INT => {
                let bytes = take(data, pos, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Int(i64::from_le_bytes(raw)))
            }
            TAG_TEXT => {
                let len = decode_len(data, pos)?;
                let bytes = take(data, pos, len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| corruption(&format!("invalid UTF-8 in text value: {}", e)))?;
                Ok(Value::Text(text.to_string()))
            }
            TAG_BYTES => {
                let len = decode_len(data, pos)?;
                Ok(Value::Bytes(take(data, pos, len)?.to_vec()))
            }
            other => Err(corruption(&format!("unknown value tag {}", other))),
        }
    }
}

fn decode_len(data: &[u8], pos: &mut usize) -> EngineResult<usize> {
    let bytes = take(data, pos, 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw) as usize)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> EngineResult<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .ok_or_else(|| corruption("value length overflow"))?;
    if end > data.len() {
        return Err(corruption("value truncated"));
    }
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn corruption(detail: &str) -> EngineError {
    EngineError::Corruption(detail.to_string())
}
