//! Order-preserving key encodings.
//!
//! Keys compare as raw bytes inside the tree, so every typed key must be
//! encoded to sort correctly under byte-lexicographic comparison:
//!
//! - i64: big-endian with the sign bit flipped (negatives sort first)
//! - u64 (rowids/serials): plain big-endian
//! - text/blob: raw bytes

/// Encode an i64 so byte comparison matches numeric order.
pub fn encode_i64(val: i64) -> [u8; 8] {
    let unsigned = (val as u64) ^ (1u64 << 63);
    unsigned.to_be_bytes()
}

pub fn decode_i64(bytes: &[u8; 8]) -> i64 {
    let unsigned = u64::from_be_bytes(*bytes);
    (unsigned ^ (1u64 << 63)) as i64
}

/// Rowids are unsigned and monotone; big-endian already sorts them.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

pub fn decode_u64(bytes: &[u8; 8]) -> u64 {
    u64::from_be_bytes(*bytes)
}
