//! Small helpers for the upper-case hex text the bus speaks.

use crate::error::{ProtocolError, Result};

/// Decode a hex string into bytes.
pub fn decode(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(ProtocolError::OddLength(hex.len()));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).map_err(|_| ProtocolError::InvalidHex(hex.to_string()))?;
            u8::from_str_radix(s, 16).map_err(|_| ProtocolError::InvalidHex(hex.to_string()))
        })
        .collect()
}

/// Encode bytes as upper-case hex.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Format `value` as upper-case hex padded to `digits`.
pub fn int_to_hex(value: u32, digits: usize) -> String {
    format!("{:0width$X}", value, width = digits)
}

/// Value of a single hex digit.
pub fn nibble(c: char) -> Option<u8> {
    c.to_digit(16).map(|d| d as u8)
}

/// Nibble at position `index` of a hex string.
pub fn nibble_at(hex: &str, index: usize) -> Option<u8> {
    hex.chars().nth(index).and_then(nibble)
}

/// Byte made of the two nibbles starting at `index`.
pub fn byte_at(hex: &str, index: usize) -> Option<u8> {
    let s = hex.get(index..index + 2)?;
    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(s, 16).ok()
}

/// Swap a 4- or 6-digit address between human and wire byte order
/// (`"4707"` -> `"0747"`, `"0D1C80"` -> `"801C0D"`).
pub fn swap_bytes(address: &str) -> Result<String> {
    if !matches!(address.len(), 4 | 6) || !is_hex(address) {
        return Err(ProtocolError::InvalidAddress(address.to_string()));
    }
    reverse_bytes(address)
}

/// Reverse the byte order of a hex string (`"A1B2C3"` -> `"C3B2A1"`).
pub fn reverse_bytes(hex: &str) -> Result<String> {
    let mut bytes = decode(hex)?;
    bytes.reverse();
    Ok(encode(&bytes))
}

/// True if every character is a hex digit.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// True for an all-`F` run, the bus' empty/terminator marker.
pub fn is_filler(hex: &str) -> bool {
    !hex.is_empty() && hex.chars().all(|c| c == 'F' || c == 'f')
}

/// Fraction of whole bytes that are `FF`.
pub fn filler_ratio(hex: &str) -> f64 {
    let total = hex.len() / 2;
    if total == 0 {
        return 0.0;
    }
    let filler = hex
        .as_bytes()
        .chunks(2)
        .filter(|pair| pair.len() == 2 && pair.eq_ignore_ascii_case(b"FF"))
        .count();
    filler as f64 / total as f64
}
