//! Line framing over TCP.
//!
//! A hand-written [`Decoder`] instead of `tokio_util::codec::LinesCodec`:
//! the wire contract distinguishes a too-long single line from an
//! unterminated buffer overflow, and `LinesCodec` only exposes one
//! `max_length` knob that conflates the two.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Matches the original's fixed receive buffer: incoming bytes that would
/// push the unconsumed buffer past this many bytes are fatal.
pub const BUF_SIZE: usize = 8192;
/// A single line (including its terminator) at or beyond this length is
/// fatal, independent of total buffered bytes.
pub const LINE_MAX: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Unconsumed buffered bytes exceeded [`BUF_SIZE`] without a newline.
    BufferOverflow,
    /// A single line reached [`LINE_MAX`] bytes before its terminator.
    LineTooLong,
}

#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        let newline_at = src.iter().position(|&b| b == b'\n');

        let Some(pos) = newline_at else {
            if src.len() > BUF_SIZE {
                return Err(FrameError::BufferOverflow);
            }
            return Ok(None);
        };

        if pos + 1 >= LINE_MAX {
            return Err(FrameError::LineTooLong);
        }

        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        while line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

impl Encoder<String> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(item.as_bytes());
        if !item.ends_with('\n') {
            dst.extend_from_slice(b"\n");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_line_at_a_time() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("REQ PING\r\nREQ PONG\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("REQ PING".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("REQ PONG".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_line_waits_for_more_data() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("REQ LOG");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"IN nick=a\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("REQ LOGIN nick=a".to_string())
        );
    }

    #[test]
    fn single_line_too_long_is_fatal_once_terminated() {
        let mut codec = LineCodec;
        let mut body = vec![b'x'; LINE_MAX];
        body.push(b'\n');
        let mut buf = BytesMut::from(body.as_slice());
        assert_eq!(codec.decode(&mut buf), Err(FrameError::LineTooLong));
    }

    #[test]
    fn unterminated_line_under_line_max_waits() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(vec![b'x'; LINE_MAX - 1].as_slice());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unterminated_overflow_is_fatal() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(vec![b'x'; BUF_SIZE + 1].as_slice());
        assert_eq!(codec.decode(&mut buf), Err(FrameError::BufferOverflow));
    }
}
