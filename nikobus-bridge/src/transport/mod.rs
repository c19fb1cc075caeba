//! Physical connection to the bus interface.
//!
//! A single connection string selects the kind of link:
//!
//! - `host:port` with a numeric port: TCP (serial-over-IP bridges)
//! - anything else (`/dev/ttyUSB0`, `COM3`): a local serial port
//!
//! After the link is up the interface is reset with a fixed handshake
//! ([`HANDSHAKE`]).

pub mod codec;
pub mod connection;
#[cfg(test)]
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use nikobus_protocol::HANDSHAKE;

use crate::error::{BridgeError, Result};

pub use codec::BusLineCodec;
pub use connection::LineTransport;
#[cfg(test)]
pub use mock::MockTransport;

/// Default serial speed of the PC-Link.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Line-oriented access to the bus.
///
/// `read` and `send` may be called concurrently from different tasks; the
/// listener is the only reader and the command worker the only writer.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Write one line; the terminator is appended.
    async fn send(&self, line: &str) -> Result<()>;

    /// Wait for the next non-empty line, without its terminator.
    async fn read(&self) -> Result<String>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host:port` or a serial device path.
    pub connection_string: String,
    /// Serial speed; ignored for TCP.
    pub baud_rate: u32,
    pub connect_timeout: Duration,
    /// Bound on each listener read so the loop notices shutdown.
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Kind of link selected by a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp { host: String, port: u16 },
    Serial { path: String },
}

impl ConnectionKind {
    /// Detect the link kind from `connection`.
    pub fn parse(connection: &str) -> Result<Self> {
        let connection = connection.trim();
        if connection.is_empty() {
            return Err(BridgeError::Connection(
                "empty connection string".to_string(),
            ));
        }
        if let Some((host, port)) = connection.rsplit_once(':') {
            if !host.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
                let port = port.parse::<u16>().map_err(|_| {
                    BridgeError::Connection(format!("invalid port in {:?}", connection))
                })?;
                return Ok(ConnectionKind::Tcp {
                    host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
                    port,
                });
            }
        }
        Ok(ConnectionKind::Serial {
            path: connection.to_string(),
        })
    }
}

/// Open the link described by `config` and run the handshake.
pub async fn connect(config: &ConnectionConfig) -> Result<LineTransport> {
    let kind = ConnectionKind::parse(&config.connection_string)?;
    info!("Connecting to Nikobus at {}", config.connection_string);

    let opening = LineTransport::open(&kind, config.baud_rate);
    let transport = match tokio::time::timeout(config.connect_timeout, opening).await {
        Ok(result) => result?,
        Err(_) => return Err(BridgeError::ConnectTimeout(config.connect_timeout)),
    };

    perform_handshake(&transport).await?;
    info!("Connected to Nikobus at {}", config.connection_string);
    Ok(transport)
}

/// Send the interface reset sequence. Any send failure aborts.
pub async fn perform_handshake(transport: &dyn BusTransport) -> Result<()> {
    for line in HANDSHAKE {
        debug!("Handshake -> {}", line);
        transport
            .send(line)
            .await
            .map_err(|e| BridgeError::Connection(format!("handshake failed at {:?}: {}", line, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_kind() {
        assert_eq!(
            ConnectionKind::parse("192.168.2.50:9999").unwrap(),
            ConnectionKind::Tcp {
                host: "192.168.2.50".into(),
                port: 9999
            }
        );
        assert_eq!(
            ConnectionKind::parse("/dev/ttyUSB0").unwrap(),
            ConnectionKind::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
        assert_eq!(
            ConnectionKind::parse("COM3").unwrap(),
            ConnectionKind::Serial { path: "COM3".into() }
        );
        assert!(matches!(
            ConnectionKind::parse("  "),
            Err(BridgeError::Connection(_))
        ));
        assert!(ConnectionKind::parse("host:99999").is_err());
    }

    #[tokio::test]
    async fn test_handshake_sequence() {
        let transport = MockTransport::new();
        perform_handshake(&transport).await.unwrap();
        assert_eq!(transport.sent(), HANDSHAKE.map(String::from).to_vec());
    }

    #[tokio::test]
    async fn test_handshake_fails_fast() {
        let transport = MockTransport::new();
        transport.fail_next_sends(1);
        let err = perform_handshake(&transport).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(transport.sent().is_empty());
    }
}
