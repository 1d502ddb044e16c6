use std::cmp;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{EnvelopeError, Result};
use crate::message::Message;

/// Default maximum line length: 4 MiB.
pub const DEFAULT_MAX_LINE: usize = 4 * 1024 * 1024;

/// Encode a message as one newline-terminated JSON line.
///
/// Wire format:
/// ```text
/// {"jsonrpc":"2.0","id":1,"method":"ping"}\n
/// ```
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let json = serde_json::to_vec(message)?;
    dst.reserve(json.len() + 1);
    dst.put_slice(&json);
    dst.put_u8(b'\n');
    Ok(())
}

/// Splits a byte stream into JSON lines, one message per line.
///
/// Lines are handed out unparsed so that a malformed message can be reported
/// without ending the stream. A line longer than the maximum is reported once
/// with [`EnvelopeError::LineTooLong`]; its bytes are then discarded up to the
/// next newline and decoding resumes with the line after it.
#[derive(Debug, Clone)]
pub struct JsonLineCodec {
    max_line_length: usize,
    // Bytes of the buffer already scanned for a newline.
    next_index: usize,
    discarding: bool,
}

impl JsonLineCodec {
    /// Create a codec with the default maximum line length.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE)
    }

    /// Create a codec with an explicit maximum line length.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
        }
    }

    /// Maximum accepted line length in bytes.
    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    /// Extract the next complete line from `src`.
    ///
    /// Returns `Ok(None)` if the buffer doesn't contain a complete line yet.
    /// On success, consumes the line and its terminator; a trailing `\r` is
    /// stripped and blank lines are skipped. `LineTooLong` is recoverable:
    /// call again with more data to continue after the offending line.
    pub fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            let read_to = cmp::min(self.max_line_length.saturating_add(1), src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(newline)) => {
                    src.advance(newline + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None); // Still inside the oversized line
                    }
                }
                (false, Some(newline)) => {
                    self.next_index = 0;
                    let mut line = src.split_to(newline + 1);
                    line.truncate(newline);
                    if line.last() == Some(&b'\r') {
                        line.truncate(newline - 1);
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Some(line.freeze()));
                }
                (false, None) if src.len() > self.max_line_length => {
                    let size = src
                        .iter()
                        .position(|b| *b == b'\n')
                        .unwrap_or(src.len());
                    self.discarding = true;
                    self.next_index = 0;
                    return Err(EnvelopeError::LineTooLong {
                        size,
                        max: self.max_line_length,
                    });
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None); // Need more data
                }
            }
        }
    }

    /// Take whatever is left at end of input as a final, unterminated line.
    pub fn decode_line_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(line) = self.decode_line(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding || src.iter().all(u8::is_ascii_whitespace) {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }
        let mut line = src.split();
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(line.freeze()))
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Each item is one line, or the error for a line that was skipped.
///
/// Per-line errors are items rather than decoder errors so the stream keeps
/// going; the decoder error is reserved for I/O failures.
#[cfg(feature = "async")]
impl tokio_util::codec::Decoder for JsonLineCodec {
    type Item = Result<Bytes>;
    type Error = EnvelopeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Result<Bytes>>> {
        Ok(self.decode_line(src).transpose())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Result<Bytes>>> {
        Ok(self.decode_line_eof(src).transpose())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encode_then_decode_line() {
        let mut buf = BytesMut::new();
        encode_message(&Message::request(1, "ping", None), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let line = JsonLineCodec::new().decode_line(&mut buf).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_line_waits_for_more_data() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\","[..]);
        assert!(codec.decode_line(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"method\":\"x\"}\n{\"part");
        let line = codec.decode_line(&mut buf).unwrap().unwrap();
        assert_eq!(line.as_ref(), br#"{"jsonrpc":"2.0","method":"x"}"#);
        assert_eq!(buf.as_ref(), b"{\"part");
    }

    #[test]
    fn line_arriving_byte_by_byte() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::new();
        let input = b"{\"a\":1}\n";
        for (i, byte) in input.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode_line(&mut buf).unwrap();
            if i + 1 < input.len() {
                assert!(decoded.is_none());
                assert_eq!(codec.next_index, i + 1);
            } else {
                assert_eq!(decoded.unwrap().as_ref(), b"{\"a\":1}");
            }
        }
        assert_eq!(codec.next_index, 0);
    }

    #[test]
    fn strips_carriage_return_and_skips_blank_lines() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"\n  \r\n{\"a\":1}\r\n"[..]);
        let line = codec.decode_line(&mut buf).unwrap().unwrap();
        assert_eq!(line.as_ref(), b"{\"a\":1}");
        assert!(codec.decode_line(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_line_does_not_affect_next_line() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"{not json}\n{\"ok\":true}\n"[..]);
        let bad = codec.decode_line(&mut buf).unwrap().unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&bad).is_err());
        let good = codec.decode_line(&mut buf).unwrap().unwrap();
        assert_eq!(good.as_ref(), b"{\"ok\":true}");
    }

    #[test]
    fn long_line_reported_then_skipped() {
        let mut codec = JsonLineCodec::with_max_line_length(4);
        let mut buf = BytesMut::from(&b"0123456789\n{}\n"[..]);
        assert!(matches!(
            codec.decode_line(&mut buf),
            Err(EnvelopeError::LineTooLong { size: 10, max: 4 })
        ));
        assert_eq!(codec.decode_line(&mut buf).unwrap().unwrap().as_ref(), b"{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn long_line_split_across_reads_is_skipped() {
        let mut codec = JsonLineCodec::with_max_line_length(4);
        let mut buf = BytesMut::from(&b"0123456"[..]);
        assert!(matches!(
            codec.decode_line(&mut buf),
            Err(EnvelopeError::LineTooLong { size: 7, max: 4 })
        ));
        assert!(codec.decode_line(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"789");
        assert!(codec.decode_line(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n[1]\n");
        assert_eq!(codec.decode_line(&mut buf).unwrap().unwrap().as_ref(), b"[1]");
    }

    #[test]
    fn line_of_exactly_max_length_accepted() {
        let mut codec = JsonLineCodec::with_max_line_length(4);
        let mut buf = BytesMut::from(&b"1234\n"[..]);
        assert_eq!(codec.decode_line(&mut buf).unwrap().unwrap().as_ref(), b"1234");
    }

    #[test]
    fn eof_yields_unterminated_line_but_not_discarded_tail() {
        let mut codec = JsonLineCodec::with_max_line_length(4);
        let mut buf = BytesMut::from(&b"[2]"[..]);
        assert_eq!(codec.decode_line_eof(&mut buf).unwrap().unwrap().as_ref(), b"[2]");
        assert!(codec.decode_line_eof(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(codec.decode_line_eof(&mut buf).is_err());
        assert!(codec.decode_line_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn framed_read_reassembles_split_writes() {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;
        use tokio_util::codec::FramedRead;

        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            tx.write_all(b"{\"jsonrpc\":\"2.0\",").await.unwrap();
            tx.write_all(b"\"method\":\"a\"}\n{\"jsonrpc\":\"2.0\",\"method\":\"b\"}")
                .await
                .unwrap();
        });

        let mut framed = FramedRead::new(rx, JsonLineCodec::new());
        let first = framed.next().await.unwrap().unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap().unwrap();
        assert!(framed.next().await.is_none());
        writer.await.unwrap();

        let first: Message = serde_json::from_slice(&first).unwrap();
        let second: Message = serde_json::from_slice(&second).unwrap();
        assert_eq!(first.method(), Some("a"));
        assert_eq!(second.method(), Some("b"));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn framed_read_keeps_going_after_long_line() {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;
        use tokio_util::codec::FramedRead;

        let (mut tx, rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            tx.write_all(&[b'x'; 100]).await.unwrap();
            tx.write_all(b"\n{\"jsonrpc\":\"2.0\",\"method\":\"c\"}\n")
                .await
                .unwrap();
        });

        let mut framed = FramedRead::new(rx, JsonLineCodec::with_max_line_length(40));
        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            Err(EnvelopeError::LineTooLong { max: 40, .. })
        ));
        let line = framed.next().await.unwrap().unwrap().unwrap();
        let message: Message = serde_json::from_slice(&line).unwrap();
        assert_eq!(message.method(), Some("c"));
        assert!(framed.next().await.is_none());
        writer.await.unwrap();
    }
}
