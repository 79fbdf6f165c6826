//! Line Codec
//!
//! Splits an inbound byte stream into text lines and writes outbound text
//! verbatim. This is the decode and encode stage of every connection.
//!
//! ## Framing Rules
//!
//! - A line ends at `\n`, `\r\n`, or a lone `\r`.
//! - A `\r` that happens to be the last byte of a read ends the line right
//!   away. If the next read starts with `\n`, that byte is swallowed, so a
//!   CRLF split across two reads still produces a single line.
//! - Lines longer than the configured maximum (8192 bytes by default) are
//!   rejected with [`FrameError::FrameTooLarge`]. The same happens as soon as
//!   more than the maximum is buffered without any delimiter.
//! - Invalid UTF-8 is replaced with U+FFFD instead of failing the connection.
//!
//! ## Example
//!
//! ```
//! use bytes::BytesMut;
//! use hsha_echo::protocol::LineCodec;
//! use tokio_util::codec::Decoder;
//!
//! let mut codec = LineCodec::new();
//! let mut buf = BytesMut::from(&b"hello\r\nwor"[..]);
//!
//! assert_eq!(codec.decode(&mut buf).unwrap(), Some("hello".to_string()));
//! assert_eq!(codec.decode(&mut buf).unwrap(), None);
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default maximum line length in bytes, delimiter excluded.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Errors produced while framing a connection's byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A line grew past the maximum length without being terminated
    #[error("line too long: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The underlying socket failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoder/encoder for CR, LF and CRLF terminated text lines.
#[derive(Debug, Clone)]
pub struct LineCodec {
    /// Longest accepted line, delimiter excluded
    max_length: usize,

    /// Index up to which the buffer has already been scanned for a delimiter
    next_index: usize,

    /// The previous line ended on a trailing `\r`; drop a leading `\n`
    skip_lf: bool,
}

impl LineCodec {
    /// Creates a codec with the default 8192 byte line limit.
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Creates a codec with a custom line limit.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            skip_lf: false,
        }
    }

    /// Returns the longest line this codec accepts.
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if self.skip_lf && !src.is_empty() {
            if src[0] == b'\n' {
                src.advance(1);
            }
            self.skip_lf = false;
        }

        let read_to = src.len();
        let found = src[self.next_index..read_to]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r');

        match found {
            Some(offset) => {
                let line_end = self.next_index + offset;
                self.next_index = 0;

                if line_end > self.max_length {
                    return Err(FrameError::FrameTooLarge {
                        size: line_end,
                        max: self.max_length,
                    });
                }

                let line = src.split_to(line_end);
                let delimiter_len = match (src[0], src.get(1)) {
                    (b'\r', Some(b'\n')) => 2,
                    (b'\r', None) => {
                        self.skip_lf = true;
                        1
                    }
                    _ => 1,
                };
                src.advance(delimiter_len);

                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                if read_to > self.max_length {
                    return Err(FrameError::FrameTooLarge {
                        size: read_to,
                        max: self.max_length,
                    });
                }
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        // An unterminated tail is not a frame
        if !src.is_empty() {
            trace!(discarded = src.len(), "Dropping unterminated line at EOF");
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(item.len());
        dst.put(item.as_bytes());
        Ok(())
    }
}
