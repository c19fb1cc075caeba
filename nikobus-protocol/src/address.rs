//! Module and push-button address handling.
//!
//! Module addresses are 4 hex digits written big-endian by humans (`"4707"`)
//! and little-endian on the wire (`"0747"`). Button addresses are 24-bit
//! values; the address printed on a push button is derived from the raw bus
//! address by a 21-bit bit reversal (see [`encode_address`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::hex;

/// Width of the reversed part of a button address.
const REVERSED_BITS: u32 = 21;

/// Largest value a 24-bit bus address can hold.
pub const MAX_BUS_ADDRESS: u32 = 0x00FF_FFFF;

/// Transform a raw 24-bit bus address into push-button form, as an integer.
///
/// Bits 0..=20 are reversed and shifted left by one; the three top bits
/// (21..=23) are the button slot and are added to the result.
pub fn encode_address_value(raw: u32) -> u32 {
    let raw = raw & MAX_BUS_ADDRESS;
    let mut reversed = 0u32;
    for bit in 0..REVERSED_BITS {
        if raw & (1 << bit) != 0 {
            reversed |= 1 << (REVERSED_BITS - 1 - bit);
        }
    }
    let button = (raw >> REVERSED_BITS) & 0x7;
    ((reversed << 1) + button) & MAX_BUS_ADDRESS
}

/// Transform a raw 24-bit bus address into its 6-hex push-button form.
pub fn encode_address(raw: u32) -> String {
    hex::int_to_hex(encode_address_value(raw), 6)
}

/// Parse a 6-hex bus address.
pub fn parse_bus_address(text: &str) -> Result<u32> {
    if text.len() != 6 || !hex::is_hex(text) {
        return Err(ProtocolError::InvalidAddress(text.to_string()));
    }
    u32::from_str_radix(text, 16).map_err(|_| ProtocolError::InvalidAddress(text.to_string()))
}

/// Swap a 4- or 6-digit address between human and wire byte order.
pub fn swap_bytes(address: &str) -> Result<String> {
    hex::swap_bytes(address)
}

/// Reverse the byte order of an arbitrary hex string.
pub fn reverse_hex_bytes(hex_str: &str) -> Result<String> {
    hex::reverse_bytes(hex_str)
}

/// A 4- or 6-hex-digit module address in human (big-endian) order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleAddress(String);

impl ModuleAddress {
    /// Parse and normalize to upper case.
    pub fn new(address: &str) -> Result<Self> {
        let address = address.trim();
        if !matches!(address.len(), 4 | 6) || !hex::is_hex(address) {
            return Err(ProtocolError::InvalidAddress(address.to_string()));
        }
        Ok(Self(address.to_uppercase()))
    }

    /// Address as written by humans.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address in wire order (low byte first).
    pub fn swapped(&self) -> String {
        self.0
            .as_bytes()
            .rchunks(2)
            .flat_map(|pair| pair.iter().map(|&b| b as char))
            .collect()
    }

    /// Numeric value.
    pub fn value(&self) -> u32 {
        u32::from_str_radix(&self.0, 16).unwrap_or_default()
    }
}

impl fmt::Display for ModuleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModuleAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ModuleAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<ModuleAddress> for String {
    fn from(value: ModuleAddress) -> Self {
        value.0
    }
}
