//! Carriage-return line framing for the bus interface.

use bytes::{BufMut, BytesMut};
use log::warn;
use tokio_util::codec::{Decoder, Encoder};

use nikobus_protocol::FRAME_TERMINATOR;

/// Longest line we are willing to buffer.
pub const MAX_LINE_LENGTH: usize = 512;

/// Splits the byte stream on `\r` (a stray `\n` is treated the same) and
/// appends `\r` to outgoing lines.
#[derive(Debug, Clone)]
pub struct BusLineCodec {
    max_length: usize,
    /// Set while skipping the tail of an over-long line.
    discarding: bool,
}

impl BusLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }
}

impl Default for BusLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn is_terminator(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

impl Decoder for BusLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(pos) = buf.iter().position(|b| is_terminator(*b)) else {
                if buf.len() > self.max_length {
                    warn!("Discarding {} bytes without line terminator", buf.len());
                    buf.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = buf.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return Ok(Some(text.to_string()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() || self.discarding {
            buf.clear();
            return Ok(None);
        }
        let rest = buf.split();
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }
}

impl Encoder<String> for BusLineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(FRAME_TERMINATOR as u8);
        Ok(())
    }
}
