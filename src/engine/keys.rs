//! Order-preserving index key encoding
//!
//! Secondary orderings are kept as flat byte strings so composite keys
//! compare with plain memcmp. The encoding must keep two properties:
//! component boundaries never bleed into each other (a shorter text
//! value always sorts before a longer one sharing its prefix), and a
//! prefix of encoded components is a byte prefix of every full key
//! that starts with those components.
//!
//! - Integers: 64-bit big-endian with the sign bit flipped, fixed
//!   width, so numeric order equals byte order.
//! - Text: folded to lowercase (text columns collate
//!   case-insensitively), then escaped like blobs.
//! - Blobs: 0x00 bytes escape to 0x00 0xFF, terminated by 0x00 0x00.
//! - Descending components are bitwise inverted after encoding.

use super::value::Value;

const SIGN_FLIP: u64 = 1 << 63;

/// Appends one encoded key component to `buf`.
pub fn encode_component(buf: &mut Vec<u8>, value: &Value, descending: bool) {
    let start = buf.len();
    match value {
        Value::Int(v) => {
            buf.extend_from_slice(&((*v as u64) ^ SIGN_FLIP).to_be_bytes());
        }
        Value::Text(s) => {
            let folded = s.to_lowercase();
            escape_into(buf, folded.as_bytes());
        }
        Value::Bytes(b) => {
            escape_into(buf, b);
        }
    }
    if descending {
        for byte in &mut buf[start..] {
            *byte = !*byte;
        }
    }
}

/// Encodes a composite key from `(value, descending)` components.
pub fn encode_key(components: &[(&Value, bool)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (value, descending) in components {
        encode_component(&mut buf, value, *descending);
    }
    buf
}

/// Smallest byte string strictly greater than every string starting
/// with `prefix`, or `None` when the prefix is all 0xFF (the scan is
/// then unbounded above).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

fn escape_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}
