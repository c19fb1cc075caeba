//! TCP and serial links framed by [`BusLineCodec`].

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::BusLineCodec;
use super::{BusTransport, ConnectionKind};
use crate::error::{BridgeError, Result};

type Reader = FramedRead<Pin<Box<dyn AsyncRead + Send>>, BusLineCodec>;
type Writer = FramedWrite<Pin<Box<dyn AsyncWrite + Send>>, BusLineCodec>;

/// A byte stream split into a line reader and a line writer.
pub struct LineTransport {
    description: String,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    open: AtomicBool,
    closed: CancellationToken,
}

impl LineTransport {
    /// Open a TCP or serial link.
    pub async fn open(kind: &ConnectionKind, baud_rate: u32) -> Result<Self> {
        match kind {
            ConnectionKind::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| BridgeError::Connection(format!("{}:{}: {}", host, port, e)))?;
                stream.set_nodelay(true)?;
                let (read_half, write_half) = stream.into_split();
                Ok(Self::from_halves(format!("{}:{}", host, port), read_half, write_half))
            }
            ConnectionKind::Serial { path } => {
                let port = tokio_serial::new(path, baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .stop_bits(tokio_serial::StopBits::One)
                    .parity(tokio_serial::Parity::None)
                    .open_native_async()
                    .map_err(|e| BridgeError::Connection(format!("{}: {}", path, e)))?;
                let (read_half, write_half) = tokio::io::split(port);
                Ok(Self::from_halves(path.clone(), read_half, write_half))
            }
        }
    }

    /// Wrap an already connected pair of halves.
    pub fn from_halves<R, W>(description: String, read_half: R, write_half: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let read_half: Pin<Box<dyn AsyncRead + Send>> = Box::pin(read_half);
        let write_half: Pin<Box<dyn AsyncWrite + Send>> = Box::pin(write_half);
        info!("Bus link {} open", description);
        Self {
            description,
            reader: Mutex::new(Some(FramedRead::new(read_half, BusLineCodec::new()))),
            writer: Mutex::new(Some(FramedWrite::new(write_half, BusLineCodec::new()))),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

#[async_trait]
impl BusTransport for LineTransport {
    async fn send(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::Closed)?;
        trace!("-> {}", line);
        writer
            .send(line.to_string())
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))
    }

    async fn read(&self) -> Result<String> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(BridgeError::Closed)?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(BridgeError::Closed),
            next = reader.next() => match next {
                Some(Ok(line)) => {
                    trace!("<- {}", line);
                    Ok(line)
                }
                Some(Err(e)) => Err(BridgeError::Read(e.to_string())),
                None => Err(BridgeError::Read(format!("{} closed by peer", self.description))),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!("Error flushing {} on close: {}", self.description, e);
            }
        }
        self.reader.lock().await.take();
        info!("Bus link {} closed", self.description);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
