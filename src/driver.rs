//! The long-running filter protocol driver.
//!
//! git spawns one driver per `add`/`checkout` and funnels every filtered
//! file through it over a pair of pipes, so the state machine here must
//! survive any number of clean and smudge requests, release memory
//! between them, and defer the chunk-branch commit to end of session.
//! Request-local failures are answered with `status=error` and the session
//! keeps serving; framing or I/O failures tear it down.

use std::io::{Read, Write};

use tracing::{debug, info, warn};

use crate::buffer::BlobBuffer;
use crate::chunker::Chunker;
use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::manifest::Manifest;
use crate::pktline::{Packet, PktReader, PktWriter, MAX_PKT_PAYLOAD};
use crate::store::ChunkStore;

const CLIENT_WELCOME: &str = "git-filter-client";
const SERVER_WELCOME: &str = "git-filter-server";
const PROTOCOL_VERSION: &str = "version=2";

/// Capabilities this driver can serve. `delay` is deliberately absent.
const SUPPORTED: [&str; 2] = ["clean", "smudge"];

/// One parsed request header.
#[derive(Debug)]
struct Request {
    command: String,
    pathname: String,
}

/// Protocol state machine over one pair of binary streams.
pub struct FilterDriver<R, W> {
    input: PktReader<R>,
    output: PktWriter<W>,
    store: ChunkStore,
    chunker: Chunker,
    ondisk: bool,
    capabilities: Vec<String>,
    requests_served: u64,
}

impl<R: Read, W: Write> FilterDriver<R, W> {
    /// Build a driver over raw streams; nothing is read or written until
    /// [`FilterDriver::run`].
    pub fn new(input: R, output: W, store: ChunkStore, config: FilterConfig) -> Self {
        Self {
            input: PktReader::new(input),
            output: PktWriter::new(output),
            store,
            chunker: Chunker::new(config.chunking),
            ondisk: config.ondisk,
            capabilities: Vec::new(),
            requests_served: 0,
        }
    }

    /// Serve the session to completion: handshake, requests until the
    /// host closes its end, then the final chunk-branch commit.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; per-request errors are reported to
    /// the host in-band instead.
    pub fn run(mut self) -> Result<()> {
        self.handshake()?;
        while let Some(request) = self.read_request()? {
            self.serve(&request)?;
        }
        if let Some(tip) = self.store.finalize()? {
            debug!(%tip, "chunk branch updated");
        }
        info!(requests = self.requests_served, "session complete");
        Ok(())
    }

    /// The version-2 welcome and capability exchange.
    fn handshake(&mut self) -> Result<()> {
        match self.input.read_text_packet()? {
            Some(line) if line == CLIENT_WELCOME => {}
            other => {
                return Err(FilterError::Protocol(format!(
                    "expected {CLIENT_WELCOME:?}, got {other:?}"
                )))
            }
        }
        let mut versions = Vec::new();
        while let Some(line) = self.input.read_text_packet()? {
            versions.push(line);
        }
        if !versions.iter().any(|v| v == PROTOCOL_VERSION) {
            return Err(FilterError::Protocol(format!(
                "client supports {versions:?}, need {PROTOCOL_VERSION}"
            )));
        }

        self.output.write_text(SERVER_WELCOME)?;
        self.output.write_text(PROTOCOL_VERSION)?;
        self.output.flush_pkt()?;
        self.output.flush()?;

        let mut offered = Vec::new();
        while let Some(line) = self.input.read_text_packet()? {
            match line.split_once('=') {
                Some(("capability", cap)) => offered.push(cap.to_string()),
                _ => {
                    return Err(FilterError::Protocol(format!(
                        "expected capability announcement, got {line:?}"
                    )))
                }
            }
        }
        for cap in SUPPORTED {
            if offered.iter().any(|o| o == cap) {
                self.output.write_text(&format!("capability={cap}"))?;
                self.capabilities.push(cap.to_string());
            }
        }
        self.output.flush_pkt()?;
        self.output.flush()?;
        debug!(negotiated = ?self.capabilities, "handshake complete");
        Ok(())
    }

    /// Read one request header, or `None` when the host hangs up.
    fn read_request(&mut self) -> Result<Option<Request>> {
        let first = match self.input.read_packet()? {
            None => return Ok(None),
            Some(Packet::Data(payload)) => text_line(payload)?,
            Some(marker) => {
                return Err(FilterError::Protocol(format!(
                    "expected request header, got {marker:?}"
                )))
            }
        };

        let mut command = None;
        let mut pathname = None;
        let mut line = Some(first);
        while let Some(text) = line {
            match text.split_once('=') {
                Some(("command", value)) => command = Some(value.to_string()),
                Some(("pathname", value)) => pathname = Some(value.to_string()),
                // Unknown keys (ref, treeish, blob, ...) are fine.
                Some(_) => {}
                None => {
                    return Err(FilterError::Protocol(format!(
                        "malformed request header {text:?}"
                    )))
                }
            }
            line = self.input.read_text_packet()?;
        }

        match (command, pathname) {
            (Some(command), Some(pathname)) => Ok(Some(Request { command, pathname })),
            (command, _) => Err(FilterError::Protocol(format!(
                "incomplete request header, command={command:?}"
            ))),
        }
    }

    /// Receive the payload, process it, and reply.
    fn serve(&mut self, request: &Request) -> Result<()> {
        let mut payload = self.new_buffer()?;
        loop {
            match self.input.read_packet()? {
                Some(Packet::Data(part)) => payload.append(&part)?,
                Some(Packet::Flush) => break,
                Some(Packet::Delim) => {
                    return Err(FilterError::Protocol(
                        "unexpected delim in payload".to_string(),
                    ))
                }
                None => {
                    return Err(FilterError::Protocol(
                        "end of stream inside request payload".to_string(),
                    ))
                }
            }
        }

        if !self.capabilities.iter().any(|c| *c == request.command) {
            return Err(FilterError::Protocol(format!(
                "command {:?} was not negotiated",
                request.command
            )));
        }

        debug!(
            command = %request.command,
            path = %request.pathname,
            bytes = payload.len(),
            "request"
        );

        let result = match request.command.as_str() {
            "clean" => self.clean(&mut payload),
            _ => self.smudge(&mut payload),
        };
        drop(payload);

        match result {
            Ok(mut outcome) => {
                self.output.write_text("status=success")?;
                self.output.flush_pkt()?;
                self.stream_out(&mut outcome)?;
                self.output.flush_pkt()?;
                // Empty trailing list: the success status stands.
                self.output.flush_pkt()?;
                self.output.flush()?;
                self.requests_served += 1;
                Ok(())
            }
            Err(err) if err.is_request_local() => {
                warn!(path = %request.pathname, error = %err, "request failed");
                self.output.write_text("status=error")?;
                self.output.flush_pkt()?;
                self.output.flush_pkt()?;
                self.output.flush()?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Split a blob into chunks, persist each, emit the manifest.
    fn clean(&mut self, payload: &mut BlobBuffer) -> Result<BlobBuffer> {
        let chunker = self.chunker;
        let mut manifest = Manifest::new();
        for chunk in chunker.split(payload.reader()?) {
            let chunk = chunk?;
            manifest.push(self.store.persist(&chunk)?);
        }

        let mut out = self.new_buffer()?;
        out.append(&manifest.encode())?;
        Ok(out)
    }

    /// Parse a manifest and reassemble the original bytes.
    fn smudge(&mut self, payload: &mut BlobBuffer) -> Result<BlobBuffer> {
        let manifest = Manifest::parse(&payload.read_all()?)?;
        let mut out = self.new_buffer()?;
        for digest in manifest.digests() {
            out.append(&self.store.retrieve(digest)?)?;
        }
        Ok(out)
    }

    fn new_buffer(&self) -> Result<BlobBuffer> {
        if self.ondisk {
            BlobBuffer::on_disk(self.store.git().git_dir())
        } else {
            Ok(BlobBuffer::in_memory())
        }
    }

    fn stream_out(&mut self, outcome: &mut BlobBuffer) -> Result<()> {
        let mut reader = outcome.reader()?;
        let mut buf = vec![0u8; MAX_PKT_PAYLOAD];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.output.write_packet(&buf[..n])?;
        }
    }
}

fn text_line(payload: Vec<u8>) -> Result<String> {
    let mut text = String::from_utf8(payload)
        .map_err(|_| FilterError::Protocol("header packet is not UTF-8".to_string()))?;
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}
