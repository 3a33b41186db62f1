//! XML stream framing: stanza boundary extraction from a byte channel.
//!
//! An XMPP-style connection is one never-closed root `<stream:stream>` element
//! containing a sequence of self-contained stanza elements. This module turns
//! the raw byte stream into complete top-level frames (stream header, stanza
//! element, stream close) without ever requiring the root element to close,
//! and tags each frame with the stream epoch it was read under so that a
//! stream restart can invalidate anything buffered before it.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// One complete top-level unit extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `<stream:stream ...>` header (start tag only, raw XML). Appears
    /// once per stream epoch: at connection start and after each restart.
    StreamOpen(String),
    /// One complete stanza element, raw XML.
    Element(String),
    /// The `</stream:stream>` close tag: the peer is ending the stream.
    StreamClose,
}

/// A frame stamped with the stream epoch it was buffered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedFrame {
    pub epoch: u64,
    pub frame: Frame,
}

/// State for stanza boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between top-level stanzas (or before the stream header).
    Idle,
    /// Inside a top-level stanza, tracking depth.
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_name(e: &quick_xml::events::BytesStart<'_>) -> bool {
    e.name().local_name().as_ref() == b"stream" || e.name().as_ref() == b"stream:stream"
}

/// Extract the next complete frame from `buffer`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` when a complete frame is
/// available, `Ok(None)` when the buffer ends inside a partial frame (the
/// caller should read more bytes), and `Err(FrameSyntax)` on markup the
/// framing layer cannot recover from.
pub fn extract_frame(buffer: &[u8]) -> EngineResult<Option<(Frame, usize)>> {
    // The stream close tag has no matching open tag in the buffer, so the
    // event parser would reject it; match it textually first.
    let start = buffer
        .iter()
        .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r');
    if let Some(start) = start {
        if buffer[start..].starts_with(b"</stream:stream>") {
            let tag_end = start + b"</stream:stream>".len();
            return Ok(Some((Frame::StreamClose, tag_end)));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                // Stream-level metadata preceding the header
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && is_stream_name(&e) {
                    // Stream header: return it on its own, including any
                    // leading XML declaration.
                    let tag_end = reader.buffer_position() as usize;
                    let raw = bytes_to_string(&buffer[0..tag_end]);
                    return Ok(Some((Frame::StreamOpen(raw), tag_end)));
                }

                depth += 1;

                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && is_stream_name(&e) {
                    let tag_end = reader.buffer_position() as usize;
                    let raw = bytes_to_string(&buffer[0..tag_end]);
                    return Ok(Some((Frame::StreamOpen(raw), tag_end)));
                }

                // Self-closing top-level stanza (e.g. <success/>)
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let raw = bytes_to_string(&buffer[pos..tag_end]);
                    return Ok(Some((Frame::Element(raw), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                // Text content; depth unchanged. Stray text between stanzas
                // (usually keep-alive whitespace) is skipped.
            }
            Ok(Event::End(e)) => {
                if depth == 0 {
                    if e.name().local_name().as_ref() == b"stream"
                        || e.name().as_ref() == b"stream:stream"
                    {
                        let tag_end = reader.buffer_position() as usize;
                        return Ok(Some((Frame::StreamClose, tag_end)));
                    }
                    // Close tag with no matching open: framing is corrupt.
                    return Err(EngineError::FrameSyntax(format!(
                        "unmatched close tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }

                depth -= 1;

                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let raw = bytes_to_string(&buffer[stanza_start..tag_end]);
                    return Ok(Some((Frame::Element(raw), tag_end)));
                }
            }
            Ok(Event::Eof) => {
                // Partial frame; more bytes needed from the channel
                return Ok(None);
            }
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                // Expected mid-stream: the buffer ends inside a tag that the
                // next read will complete.
                return Ok(None);
            }
            Err(e) => {
                return Err(EngineError::FrameSyntax(e.to_string()));
            }
        }
    }
}

/// Buffered frame reader over one connection's read half.
///
/// Accumulates bytes, extracts complete frames, and stamps each with the
/// current stream epoch. `restart()` begins a new epoch and discards any
/// bytes buffered under the previous one, so a client replaying pre-restart
/// framing cannot smuggle stanzas across the restart boundary.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    epoch: u64,
    max_buffer: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_buffer: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            epoch: 0,
            max_buffer,
        }
    }

    /// Current stream epoch (0 until the first restart).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Begin a new stream epoch on the same byte channel: framing state is
    /// reset, buffered pre-restart bytes are discarded.
    pub fn restart(&mut self) {
        self.epoch += 1;
        if !self.buffer.is_empty() {
            debug!(
                epoch = self.epoch,
                discarded = self.buffer.len(),
                "discarding bytes buffered before stream restart"
            );
            self.buffer.clear();
        }
    }

    /// Read the next complete frame, suspending on the channel as needed.
    ///
    /// Errors: `FrameSyntax` on corrupt markup or an over-limit buffer,
    /// `ConnectionClosed` when the peer closes the channel, `Transport` on
    /// read failure. All are fatal to this connection only.
    pub async fn next_frame(&mut self) -> EngineResult<TaggedFrame> {
        loop {
            if let Some((frame, consumed)) = extract_frame(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(TaggedFrame {
                    epoch: self.epoch,
                    frame,
                });
            }

            if self.buffer.len() > self.max_buffer {
                return Err(EngineError::FrameSyntax(format!(
                    "frame buffer exceeded {} bytes without a complete stanza",
                    self.max_buffer
                )));
            }

            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    debug!(
                        leftover = self.buffer.len(),
                        "channel closed inside a partial frame"
                    );
                }
                return Err(EngineError::ConnectionClosed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
