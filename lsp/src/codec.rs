//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameReader`] decodes frames into [`Message`]s and [`FrameWriter`]
//! encodes them. Decoding failures are split into kinds so the read loop can
//! tell a bad frame (skip it) from a dead stream (stop).

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::Message;

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_LENGTH_MARKER: &[u8] = b"Content-Length:";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Header block present but unusable. The frame is lost; the stream is not.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    /// Body is not JSON, or not a JSON-RPC message.
    #[error("invalid frame body: {0}")]
    InvalidBody(String),
    /// Stream ended inside a frame.
    #[error("stream closed mid-frame: {0}")]
    UnexpectedEof(String),
    #[error("reading frame: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the read loop may skip this frame and keep reading.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedHeader(_) | Self::InvalidBody(_))
    }
}

/// Serialize a message into one frame.
#[must_use]
pub fn encode(message: &Message) -> Vec<u8> {
    let body = message.to_value().to_string();
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Parse a frame body.
pub fn decode_body(body: &[u8]) -> Result<Message, CodecError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| CodecError::InvalidBody(e.to_string()))?;
    Message::from_value(value).map_err(|e| CodecError::InvalidBody(e.to_string()))
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    /// Set after a header block without a usable length: the body size is
    /// unknown, so skip ahead to the next `Content-Length:` marker.
    resync: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            resync: false,
        }
    }

    /// Read and parse the next message.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    pub async fn read_message(&mut self) -> Result<Option<Message>, CodecError> {
        match self.read_frame().await? {
            Some(body) => decode_body(&body).map(Some),
            None => Ok(None),
        }
    }

    /// Read the next raw frame body.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            self.discard(content_length).await?;
            return Err(CodecError::MalformedHeader(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| eof_or_io(e, content_length))?;
        Ok(Some(body))
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF before any header
    /// byte was read.
    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length: Option<usize> = None;
        let mut malformed: Option<String> = None;
        let mut saw_any_header_bytes = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_until(b'\n', &mut line).await?;

            if bytes_read == 0 {
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof(
                    "EOF while reading headers".to_string(),
                ));
            }

            let mut start = 0;
            if self.resync {
                match find_marker(&line) {
                    Some(pos) => {
                        start = pos;
                        self.resync = false;
                        tracing::debug!(skipped = pos, "resynchronised on Content-Length header");
                    }
                    None => continue,
                }
            }
            saw_any_header_bytes = true;

            let Ok(text) = std::str::from_utf8(&line[start..]) else {
                malformed = Some("header line is not UTF-8".to_string());
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                break;
            }

            match trimmed.split_once(':') {
                Some((key, value)) if key == CONTENT_LENGTH => match value.trim().parse() {
                    Ok(len) => content_length = Some(len),
                    Err(_) => {
                        malformed = Some(format!("invalid Content-Length value '{}'", value.trim()));
                    }
                },
                // Ignore other headers (e.g. Content-Type)
                Some(_) => {}
                None => malformed = Some(format!("header line without ':': {trimmed:?}")),
            }
        }

        match (content_length, malformed) {
            (Some(len), None) => Ok(Some(len)),
            (Some(len), Some(reason)) => {
                // Length is known, so the body can be skipped precisely.
                self.discard(len).await?;
                Err(CodecError::MalformedHeader(reason))
            }
            (None, reason) => {
                self.resync = true;
                Err(CodecError::MalformedHeader(
                    reason.unwrap_or_else(|| "missing Content-Length header".to_string()),
                ))
            }
        }
    }

    async fn discard(&mut self, len: usize) -> Result<(), CodecError> {
        let copied = tokio::io::copy(&mut (&mut self.reader).take(len as u64), &mut tokio::io::sink())
            .await?;
        if copied < len as u64 {
            return Err(CodecError::UnexpectedEof(format!(
                "expected {len} body bytes, got {copied}"
            )));
        }
        Ok(())
    }
}

fn find_marker(line: &[u8]) -> Option<usize> {
    line.windows(CONTENT_LENGTH_MARKER.len())
        .position(|w| w == CONTENT_LENGTH_MARKER)
}

fn eof_or_io(e: std::io::Error, expected: usize) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::UnexpectedEof(format!("expected {expected} body bytes"))
    } else {
        CodecError::Io(e)
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message as a frame and flush.
    pub async fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
        self.write_frame(&encode(message)).await
    }

    /// Write an already encoded frame and flush.
    pub async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
