//! Pkt-line framing over binary streams.
//!
//! A pkt-line is a 4-hex-digit length header (the length includes the
//! header itself) followed by that many payload bytes, or one of two
//! dataless markers: flush (`0000`) and delim (`0001`). This is the framing
//! git uses for its long-running filter protocol.

use std::io::{ErrorKind, Read, Write};

use crate::error::{FilterError, Result};

/// Largest payload a single pkt-line can carry.
///
/// The length header counts itself, is capped at `0xfff0`, and spends four
/// bytes on the header: `65520 - 4`.
pub const MAX_PKT_PAYLOAD: usize = 65516;

/// Largest valid value of the length header.
const MAX_PKT_LEN: usize = 65520;

/// One frame read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A data packet; the payload may be empty (`0004`).
    Data(Vec<u8>),
    /// The flush marker `0000`, ending a list or a payload stream.
    Flush,
    /// The delim marker `0001`.
    Delim,
}

/// Reads pkt-lines from a binary stream.
#[derive(Debug)]
pub struct PktReader<R> {
    inner: R,
}

impl<R: Read> PktReader<R> {
    /// Wrap a binary input stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the stream is cleanly closed at a packet
    /// boundary, which is how the host signals end of session.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Protocol`] on a truncated or malformed frame
    /// and [`FilterError::Io`] on underlying read failures.
    pub fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut header = [0u8; 4];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(FilterError::Protocol(format!(
                    "truncated packet header: {n} of 4 bytes"
                )))
            }
        }

        let text = std::str::from_utf8(&header)
            .map_err(|_| FilterError::Protocol("packet header is not ASCII hex".to_string()))?;
        let len = usize::from_str_radix(text, 16).map_err(|_| {
            FilterError::Protocol(format!("packet header {text:?} is not hexadecimal"))
        })?;

        match len {
            0 => Ok(Some(Packet::Flush)),
            1 => Ok(Some(Packet::Delim)),
            2 | 3 => Err(FilterError::Protocol(format!(
                "reserved packet length {len:#06x}"
            ))),
            len if len > MAX_PKT_LEN => Err(FilterError::Protocol(format!(
                "oversized packet length {len} > {MAX_PKT_LEN}"
            ))),
            len => {
                let mut payload = vec![0u8; len - 4];
                self.inner.read_exact(&mut payload).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        FilterError::Protocol(format!("truncated packet payload of {} bytes", len - 4))
                    } else {
                        FilterError::Io(e)
                    }
                })?;
                Ok(Some(Packet::Data(payload)))
            }
        }
    }

    /// Read a packet that must be text, as used in the handshake and
    /// request-header phases.
    ///
    /// Returns `Ok(None)` on a flush marker; the trailing newline git
    /// appends to text packets is stripped.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Protocol`] if the stream ends, a delim
    /// arrives, or the payload is not UTF-8.
    pub fn read_text_packet(&mut self) -> Result<Option<String>> {
        match self.read_packet()? {
            Some(Packet::Flush) => Ok(None),
            Some(Packet::Delim) => Err(FilterError::Protocol(
                "unexpected delim in text phase".to_string(),
            )),
            Some(Packet::Data(payload)) => {
                let mut text = String::from_utf8(payload).map_err(|_| {
                    FilterError::Protocol("text packet is not valid UTF-8".to_string())
                })?;
                if text.ends_with('\n') {
                    text.pop();
                }
                Ok(Some(text))
            }
            None => Err(FilterError::Protocol(
                "unexpected end of stream in text phase".to_string(),
            )),
        }
    }
}

/// Writes pkt-lines to a binary stream.
#[derive(Debug)]
pub struct PktWriter<W> {
    inner: W,
}

impl<W: Write> PktWriter<W> {
    /// Wrap a binary output stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write a single data packet.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Protocol`] if the payload exceeds
    /// [`MAX_PKT_PAYLOAD`], [`FilterError::Io`] on write failure.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PKT_PAYLOAD {
            return Err(FilterError::Protocol(format!(
                "payload of {} bytes exceeds packet maximum",
                payload.len()
            )));
        }
        let header = format!("{:04x}", payload.len() + 4);
        self.inner.write_all(header.as_bytes())?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    /// Write a text packet with the newline git expects.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_packet(&line)
    }

    /// Write an arbitrarily long payload as a run of maximal packets.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        for part in payload.chunks(MAX_PKT_PAYLOAD) {
            self.write_packet(part)?;
        }
        Ok(())
    }

    /// Write the flush marker `0000`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.inner.write_all(b"0000")?;
        Ok(())
    }

    /// Write the delim marker `0001`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn delim_pkt(&mut self) -> Result<()> {
        self.inner.write_all(b"0001")?;
        Ok(())
    }

    /// Flush the underlying stream.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Like `read_exact` but reports how many bytes arrived before EOF instead
/// of failing, so a clean close at a packet boundary is distinguishable
/// from a torn header.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(FilterError::Io(e)),
        }
    }
    Ok(filled)
}
