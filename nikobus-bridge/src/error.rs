//! Error types for the bus engine.

use std::time::Duration;

use nikobus_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the transport, command handler, discovery and storage.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The connection could not be established or the handshake failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Writing to the bus failed.
    #[error("Send error: {0}")]
    Send(String),

    /// Reading from the bus failed.
    #[error("Read error: {0}")]
    Read(String),

    /// Ack and answer were not both observed.
    #[error("No ack/answer after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// Connection setup took too long.
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Malformed frame, record or document.
    #[error("Data error: {0}")]
    Data(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required configuration document is missing.
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// The command was dropped because the handler is stopping.
    #[error("Command cancelled")]
    Cancelled,

    /// The transport or a channel has been closed.
    #[error("Connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Transient errors are retried inside a command's attempt loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Send(_) | BridgeError::Read(_) | BridgeError::Timeout { .. }
        )
    }
}

/// Result alias for the bridge crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::Send("broken pipe".into()).is_transient());
        assert!(BridgeError::Timeout { attempts: 3 }.is_transient());
        assert!(!BridgeError::Cancelled.is_transient());
        assert!(!BridgeError::MissingConfig("module".into()).is_transient());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: BridgeError = ProtocolError::OddLength(3).into();
        assert!(matches!(err, BridgeError::Protocol(ProtocolError::OddLength(3))));
        assert_eq!(err.to_string(), "Protocol error: Hex string has odd length: 3");
    }
}
