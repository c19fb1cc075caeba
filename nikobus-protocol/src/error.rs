//! Error types for the Nikobus frame codec.

use thiserror::Error;

/// Protocol-level errors raised while building or checking frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input contained a character that is not a hex digit.
    #[error("Invalid hex string: {0:?}")]
    InvalidHex(String),

    /// Hex input must describe whole bytes.
    #[error("Hex string has odd length: {0}")]
    OddLength(usize),

    /// Frame does not follow the `$` + length + data + CRC16 + CRC8 layout.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Length field disagrees with the amount of data in the frame.
    #[error("Length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// A checksum did not match.
    #[error("{kind} mismatch: expected {expected}, got {actual}")]
    CrcMismatch {
        kind: &'static str,
        expected: String,
        actual: String,
    },

    /// Address is not a 4 or 6 digit hex value.
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),
}

/// Result alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;
