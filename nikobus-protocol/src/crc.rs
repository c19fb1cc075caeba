//! Checksums used by the bus frame envelope.
//!
//! Every frame carries two checksums:
//!
//! - **CRC16** (CCITT, poly `0x1021`, init `0xFFFF`, no final XOR) over the
//!   binary value of the data hex digits.
//! - **CRC8** (poly `0x99`, init `0x00`) over the *characters* of
//!   `"$" + length + data + CRC16`.

use crate::error::Result;
use crate::hex;

const CRC16_POLY: u16 = 0x1021;
const CRC16_INIT: u16 = 0xFFFF;
const CRC8_POLY: u8 = 0x99;

/// CRC16 over the bytes encoded by `data_hex`.
pub fn crc16(data_hex: &str) -> Result<u16> {
    let bytes = hex::decode(data_hex)?;
    let mut crc = CRC16_INIT;
    for byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    Ok(crc)
}

/// CRC8 over the character codes of `text`.
pub fn crc8(text: &str) -> u8 {
    let mut crc: u8 = 0;
    for byte in text.bytes() {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// `data_hex` followed by its 4-digit CRC16.
pub fn append_crc16(data_hex: &str) -> Result<String> {
    let crc = crc16(data_hex)?;
    Ok(format!("{}{}", data_hex, hex::int_to_hex(crc as u32, 4)))
}

/// `text` followed by its 2-digit CRC8.
pub fn append_crc8(text: &str) -> String {
    format!("{}{}", text, hex::int_to_hex(crc8(text) as u32, 2))
}
