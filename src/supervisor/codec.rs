//! Lossy NDJSON line codec for supervised process streams.
//!
//! Frames child stdout/stderr into `\n`-delimited lines with a hard length
//! cap, decoding bytes best-effort: invalid UTF-8 sequences are replaced
//! rather than aborting the stream, because a supervised agent must never be
//! able to crash its reader with malformed output.
//!
//! Use as the codec parameter for [`tokio_util::codec::FramedRead`].

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Maximum line length accepted by the codec: 1 MiB.
///
/// Longer lines yield an error from [`StreamLineCodec::decode`] and the
/// remainder of the oversized line is discarded, protecting the reader from
/// unbounded allocation for a single message.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line codec over raw bytes with replacement-character decoding.
#[derive(Debug)]
pub struct StreamLineCodec {
    max_len: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
}

impl StreamLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_len: MAX_LINE_BYTES,
            discarding: false,
        }
    }

    /// Create a codec with a custom line-length cap.
    #[must_use]
    pub fn with_max_length(max_len: usize) -> Self {
        Self {
            max_len,
            discarding: false,
        }
    }
}

impl Default for StreamLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one buffered line, stripping the trailing `\n` (and `\r`).
fn take_line(src: &mut BytesMut, newline_at: usize) -> String {
    let mut line = src.split_to(newline_at + 1);
    line.truncate(newline_at);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    String::from_utf8_lossy(&line).into_owned()
}

impl Decoder for StreamLineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if let Some(newline_at) = src.iter().position(|b| *b == b'\n') {
                if self.discarding {
                    // Tail of an oversized line; drop it and resume framing.
                    src.advance(newline_at + 1);
                    self.discarding = false;
                    continue;
                }
                return Ok(Some(take_line(src, newline_at)));
            }

            if self.discarding {
                src.clear();
                return Ok(None);
            }

            if src.len() > self.max_len {
                self.discarding = true;
                src.clear();
                return Err(AppError::Supervise(format!(
                    "line too long: exceeded {} bytes",
                    self.max_len
                )));
            }

            return Ok(None);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() || self.discarding => Ok(None),
            None => {
                // Final unterminated line.
                let line = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(line))
            }
        }
    }
}
