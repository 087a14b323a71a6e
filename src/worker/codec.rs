//! Line codec for engine output streams.
//!
//! Engine output is free text, not always valid UTF-8, and occasionally
//! carries very long lines (stack traces, model dumps). [`OutputCodec`]
//! decodes `\n`-terminated lines lossily and truncates anything longer than
//! the configured limit instead of failing the stream, so the supervising
//! task keeps scanning until the process exits.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Lossy, length-bounded line decoder for [`tokio_util::codec::FramedRead`].
#[derive(Debug)]
pub struct OutputCodec {
    max_line_bytes: usize,
    /// Set after emitting a truncated prefix; bytes are dropped until the next newline.
    discarding: bool,
}

impl OutputCodec {
    /// Create a codec that emits at most `max_line_bytes` per line.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    fn take_line(&mut self, src: &mut BytesMut, end: usize, consumed: usize) -> Option<String> {
        let raw = src.split_to(end);
        src.advance(consumed - end);

        if std::mem::take(&mut self.discarding) {
            return None;
        }

        let mut raw = &raw[..raw.len().min(self.max_line_bytes)];
        if let Some(stripped) = raw.strip_suffix(b"\r") {
            raw = stripped;
        }
        Some(String::from_utf8_lossy(raw).into_owned())
    }
}

impl Decoder for OutputCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if let Some(pos) = src.iter().position(|b| *b == b'\n') {
                match self.take_line(src, pos, pos + 1) {
                    Some(line) => return Ok(Some(line)),
                    // Tail of an oversized line; look for the next one.
                    None => continue,
                }
            }

            if self.discarding {
                src.clear();
                return Ok(None);
            }

            if src.len() > self.max_line_bytes {
                let prefix = src.split_to(self.max_line_bytes);
                src.clear();
                self.discarding = true;
                return Ok(Some(String::from_utf8_lossy(&prefix).into_owned()));
            }

            return Ok(None);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let len = src.len();
        Ok(self.take_line(src, len, len))
    }
}
