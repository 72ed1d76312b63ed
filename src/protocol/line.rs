//! Line encoding and decoding for the sensor bridge protocol.
//!
//! The wire format is newline-delimited ASCII:
//! ```text
//! ┌──────────────────────────┬──────┐
//! │  message text (UTF-8)    │ \n   │
//! │  up to MAX_LINE_LEN      │      │
//! └──────────────────────────┴──────┘
//! ```
//! A trailing `\r` is tolerated and blank lines are skipped.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::LineError;

/// Line terminator.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Maximum line length in bytes, terminator excluded.
pub const MAX_LINE_LEN: usize = 256;

/// Encodes a message into a terminated line.
#[must_use]
pub fn encode(line: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(line.len() + 1);
    buf.put_slice(line.as_bytes());
    buf.put_u8(LINE_TERMINATOR);
    buf.freeze()
}

/// Line decoder that handles partial data.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    // Set while skipping the tail of an over-long line.
    discarding: bool,
}

impl LineDecoder {
    /// Creates a new line decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            discarding: false,
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete line.
    ///
    /// Returns `Ok(Some(line))` with the terminator stripped, `Ok(None)` if
    /// more data is needed, or an error for a line that cannot be used. The
    /// decoder stays usable after an error.
    ///
    /// # Errors
    ///
    /// Returns a `LineError` if:
    /// - The buffered line exceeds `MAX_LINE_LEN` (the rest of it is skipped)
    /// - The line is not valid UTF-8
    pub fn decode(&mut self) -> Result<Option<String>, LineError> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == LINE_TERMINATOR) else {
                if !self.discarding && self.buffer.len() > MAX_LINE_LEN {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    return Err(LineError::TooLong {
                        len,
                        max: MAX_LINE_LEN,
                    });
                }
                if self.discarding {
                    self.buffer.clear();
                }
                return Ok(None);
            };

            let raw = self.buffer.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let mut line = &raw[..pos];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            if line.len() > MAX_LINE_LEN {
                return Err(LineError::TooLong {
                    len: line.len(),
                    max: MAX_LINE_LEN,
                });
            }

            let text = std::str::from_utf8(line).map_err(|_| LineError::InvalidUtf8)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return Ok(Some(text.to_owned()));
        }
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_terminator() {
        let line = encode("open 0 5000");
        assert_eq!(&line[..], b"open 0 5000\n");
    }

    #[test]
    fn test_decode_complete_line() {
        let mut decoder = LineDecoder::new();
        decoder.feed(b"vr 0.002\n");

        assert_eq!(decoder.decode().unwrap(), Some("vr 0.002".to_string()));
        assert_eq!(decoder.decode().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_partial_line() {
        let mut decoder = LineDecoder::new();

        decoder.feed(b"vr 0.0");
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.feed(b"12\r\n");
        assert_eq!(decoder.decode().unwrap(), Some("vr 0.012".to_string()));
    }

    #[test]
    fn test_decode_skips_blank_lines() {
        let mut decoder = LineDecoder::new();
        decoder.feed(b"\n\r\n  \nok\n");

        assert_eq!(decoder.decode().unwrap(), Some("ok".to_string()));
    }

    #[test]
    fn test_decode_multiple_lines() {
        let mut decoder = LineDecoder::new();
        decoder.feed(b"ok\nvr 1\nvr 2\n");

        assert_eq!(decoder.decode().unwrap(), Some("ok".to_string()));
        assert_eq!(decoder.decode().unwrap(), Some("vr 1".to_string()));
        assert_eq!(decoder.decode().unwrap(), Some("vr 2".to_string()));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_decode_discards_long_line() {
        let mut decoder = LineDecoder::new();
        decoder.feed(&[b'x'; MAX_LINE_LEN + 10]);

        assert!(matches!(
            decoder.decode(),
            Err(LineError::TooLong { max: MAX_LINE_LEN, .. })
        ));

        // The tail of the long line is dropped, the next line survives.
        decoder.feed(b"xxxx\nvr 0.5\n");
        assert_eq!(decoder.decode().unwrap(), Some("vr 0.5".to_string()));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut decoder = LineDecoder::new();
        decoder.feed(&[0xff, 0xfe, b'\n', b'o', b'k', b'\n']);

        assert_eq!(decoder.decode(), Err(LineError::InvalidUtf8));
        assert_eq!(decoder.decode().unwrap(), Some("ok".to_string()));
    }
}
