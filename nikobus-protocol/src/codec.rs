//! Building and validating bus frames.
//!
//! Frame format (all fields upper-case hex text):
//! ```text
//! +-----+--------+-----------------+--------+-------+
//! | "$" | Length |      Data       | CRC16  | CRC8  |
//! +-----+--------+-----------------+--------+-------+
//! |  1  |   2    |  Length - 10    |   4    |   2   |
//! +-----+--------+-----------------+--------+-------+
//! ```
//!
//! CRC16 covers the data digits, CRC8 covers every character before it.
//! Some lines carry an ack followed by an embedded frame
//! (`$0512$1C0747...`); validation always applies to the last frame.

use crate::crc;
use crate::error::{ProtocolError, Result};
use crate::hex;
use crate::types::{FRAME_OVERHEAD, FRAME_START};

/// Shortest complete frame: `$`, length, CRC16 and CRC8 with no data.
const MIN_FRAME_LEN: usize = FRAME_OVERHEAD - 1;

/// Wrap `data_hex` in the frame envelope.
pub fn make_raw_command(data_hex: &str) -> Result<String> {
    if !data_hex.is_empty() && !hex::is_hex(data_hex) {
        return Err(ProtocolError::InvalidHex(data_hex.to_string()));
    }
    let length = data_hex.len() + FRAME_OVERHEAD;
    if length > 0xFF {
        return Err(ProtocolError::InvalidFrame(format!(
            "data too long for a frame: {} hex digits",
            data_hex.len()
        )));
    }
    let data = data_hex.to_uppercase();
    let body = format!(
        "{}{}{}",
        FRAME_START,
        hex::int_to_hex(length as u32, 2),
        crc::append_crc16(&data)?
    );
    Ok(crc::append_crc8(&body))
}

/// Build a command frame: function code, address low byte, address high
/// byte, then `args_hex`.
pub fn make_command(function: u8, address: &str, args_hex: Option<&str>) -> Result<String> {
    let swapped = hex::swap_bytes(address)?;
    let data = format!(
        "{}{}{}",
        hex::int_to_hex(function as u32, 2),
        swapped,
        args_hex.unwrap_or("")
    );
    make_raw_command(&data)
}

/// Check the length field and both checksums of `message`.
///
/// When the line contains more than one `$`, the last embedded frame is the
/// one validated.
pub fn validate_crc(message: &str) -> Result<()> {
    let message = message.trim();
    match message.rfind(FRAME_START) {
        Some(0) => validate_single(message),
        Some(idx) => validate_crc(&message[idx..]),
        None => Err(ProtocolError::InvalidFrame(message.to_string())),
    }
}

fn validate_single(frame: &str) -> Result<()> {
    split_frame(frame).map(|_| ())
}

/// Verify `frame` and return its parts.
fn split_frame(frame: &str) -> Result<Frame> {
    if frame.len() < MIN_FRAME_LEN || !frame.starts_with(FRAME_START) || !frame.is_ascii() {
        return Err(ProtocolError::InvalidFrame(frame.to_string()));
    }
    let declared = hex::byte_at(frame, 1)
        .ok_or_else(|| ProtocolError::InvalidHex(frame[1..3].to_string()))?;
    let actual = frame.len() + 1;
    if declared as usize != actual {
        return Err(ProtocolError::LengthMismatch {
            declared: declared as usize,
            actual,
        });
    }

    let data_end = frame.len() - 6;
    let data = &frame[3..data_end];
    let crc16_text = &frame[data_end..data_end + 4];
    let crc8_text = &frame[data_end + 4..];

    let received16 = u16::from_str_radix(crc16_text, 16)
        .map_err(|_| ProtocolError::InvalidHex(crc16_text.to_string()))?;
    let expected16 = crc::crc16(data)?;
    if received16 != expected16 {
        return Err(ProtocolError::CrcMismatch {
            kind: "CRC16",
            expected: hex::int_to_hex(expected16 as u32, 4),
            actual: crc16_text.to_uppercase(),
        });
    }

    let received8 = u8::from_str_radix(crc8_text, 16)
        .map_err(|_| ProtocolError::InvalidHex(crc8_text.to_string()))?;
    let expected8 = crc::crc8(&frame[..data_end + 4]);
    if received8 != expected8 {
        return Err(ProtocolError::CrcMismatch {
            kind: "CRC8",
            expected: hex::int_to_hex(expected8 as u32, 2),
            actual: crc8_text.to_uppercase(),
        });
    }

    Ok(Frame {
        length: declared,
        data: data.to_uppercase(),
        crc16: received16,
        crc8: received8,
    })
}

/// A validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the length field.
    pub length: u8,
    /// Data digits between the length field and the CRC16.
    pub data: String,
    pub crc16: u16,
    pub crc8: u8,
}

impl Frame {
    /// First data byte.
    pub fn function(&self) -> Option<u8> {
        hex::byte_at(&self.data, 0)
    }

    /// Module address carried in data bytes 1..3, in human order.
    pub fn address(&self) -> Option<String> {
        let wire = self.data.get(2..6)?;
        hex::swap_bytes(wire).ok()
    }

    /// Data following the function code and address.
    pub fn args(&self) -> &str {
        self.data.get(6..).unwrap_or("")
    }
}

/// Validate `message` and split its last frame into parts.
pub fn parse_frame(message: &str) -> Result<Frame> {
    let message = message.trim();
    match message.rfind(FRAME_START) {
        Some(idx) => split_frame(&message[idx..]),
        None => Err(ProtocolError::InvalidFrame(message.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RESET_FRAME;

    #[test]
    fn test_make_command_reproduces_reset_frame() {
        assert_eq!(make_command(0x11, "0000", None).unwrap(), RESET_FRAME);
        assert!(validate_crc(RESET_FRAME).is_ok());
    }

    #[test]
    fn test_make_command_layout() {
        let frame = make_command(0x12, "4707", None).unwrap();
        assert!(frame.starts_with("$1012074"));
        assert_eq!(frame.len(), 0x10 - 1);

        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.function(), Some(0x12));
        assert_eq!(parsed.address().as_deref(), Some("4707"));
        assert_eq!(parsed.args(), "");
    }

    #[test]
    fn test_make_command_with_args() {
        let frame = make_command(0x15, "4707", Some("FF00FF0000FFFF")).unwrap();
        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.args(), "FF00FF0000FFFF");
        assert_eq!(parsed.length as usize, frame.len() + 1);
    }

    #[test]
    fn test_make_raw_command_rejects_non_hex() {
        assert!(make_raw_command("12ZZ").is_err());
        assert!(make_command(0x12, "47", None).is_err());
    }

    #[test]
    fn test_validate_round_trip_and_mutation() {
        let frame = make_command(0x17, "C9A5", Some("A304")).unwrap();
        assert!(validate_crc(&frame).is_ok());

        let data_end = frame.len() - 6;
        for idx in 3..data_end {
            let original = frame.as_bytes()[idx] as char;
            let replacement = if original == '0' { '1' } else { '0' };
            let mut mutated = frame.clone();
            mutated.replace_range(idx..idx + 1, &replacement.to_string());
            assert!(
                validate_crc(&mutated).is_err(),
                "mutation at {} was accepted: {}",
                idx,
                mutated
            );
        }
    }

    #[test]
    fn test_validate_embedded_frame() {
        let answer = make_raw_command("07470012345678ABCD").unwrap();
        let line = format!("$0512{}", answer);
        assert!(validate_crc(&line).is_ok());

        // Flip a data digit of the embedded frame.
        let mut broken = line.clone();
        let idx = 5 + 3;
        let replacement = if &line[idx..idx + 1] == "0" { "1" } else { "0" };
        broken.replace_range(idx..idx + 1, replacement);
        assert!(validate_crc(&broken).is_err());
    }

    #[test]
    fn test_validate_length_mismatch() {
        let frame = make_command(0x12, "4707", None).unwrap();
        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(
            validate_crc(truncated),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_garbage() {
        assert!(validate_crc("").is_err());
        assert!(validate_crc("#N123456").is_err());
        assert!(validate_crc("$05").is_err());
    }
}
