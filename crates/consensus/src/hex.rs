//! Display-order hex helpers for 256-bit hashes.

use std::fmt;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hash length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex string into internal byte order.
///
/// Short inputs are left-padded with zeros; an optional `0x` prefix is accepted.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HexError::InvalidHex);
    }

    let mut padded = String::with_capacity(64);
    for _ in hex.len()..64 {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Strict variant used for request input: exactly 64 hex digits.
pub fn parse_hash_strict(input: &str) -> Result<Hash256, HexError> {
    if input.trim().len() != 64 {
        return Err(HexError::InvalidLength);
    }
    hash256_from_hex(input)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_display_order() {
        let hash = hash256_from_hex("01").expect("hex");
        assert_eq!(hash[0], 1);
        assert!(hash[1..].iter().all(|b| *b == 0));
        assert_eq!(
            hash256_to_hex(&hash),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
        assert_eq!(parse_hash_strict("abcd"), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex(&"f".repeat(65)), Err(HexError::InvalidLength));
    }
}
