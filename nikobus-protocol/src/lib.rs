//! Frame codec for the Nikobus home automation bus.
//!
//! The bus is a shared half-duplex line reached through a PC-Link or
//! PC-Logic interface. Everything on it is carriage-return terminated text;
//! commands and answers use a checksummed envelope:
//!
//! ```text
//! $ LL DATA... CCCC cc
//! ```
//!
//! - `LL`: data hex length + 10
//! - `CCCC`: CRC16 of the data
//! - `cc`: CRC8 of everything before it
//!
//! # Example
//!
//! ```rust
//! use nikobus_protocol::{make_command, validate_crc, encode_address};
//!
//! let frame = make_command(0x11, "0000", None).unwrap();
//! assert_eq!(frame, "$10110000B8CF9D");
//! assert!(validate_crc(&frame).is_ok());
//!
//! assert_eq!(encode_address(0x000001), "200000");
//! ```

pub mod address;
pub mod codec;
pub mod crc;
pub mod error;
pub mod hex;
pub mod types;

pub use address::{
    encode_address, encode_address_value, parse_bus_address, reverse_hex_bytes, swap_bytes,
    ModuleAddress,
};
pub use codec::{make_command, make_raw_command, parse_frame, validate_crc, Frame};
pub use crc::{append_crc16, append_crc8, crc16, crc8};
pub use error::{ProtocolError, Result};
pub use hex::is_filler;
pub use types::*;
