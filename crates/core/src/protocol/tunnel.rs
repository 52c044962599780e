//! RTSP-over-HTTP tunneling.
//!
//! A client opens two HTTP connections sharing an `x-sessioncookie`:
//!
//! ```text
//! GET  /video/h264   -> 200 application/x-rtsp-tunneled, then server output
//! POST /video/h264   -> never answered; the body is Base64 RTSP requests
//! ```
//!
//! Requests decoded from the POST are executed against the GET connection,
//! and every reply and RTP packet leaves through the GET socket.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{ParseErrorKind, Result, StreamError};

pub const TUNNEL_CONTENT_TYPE: &str = "application/x-rtsp-tunneled";
pub const COOKIE_HEADER: &str = "x-sessioncookie";

/// `Content-Length` clients announce on the POST half. The body never ends,
/// so it must not be read to completion.
pub const POST_SENTINEL_LENGTH: usize = 32767;

const HEAD_END: &[u8] = b"\r\n\r\n";
/// Decoded bytes held while waiting for the end of a request head.
pub const MAX_PENDING: usize = 64 * 1024;

/// Incremental Base64 decoder that splits the decoded stream into RTSP
/// request heads.
///
/// Clients encode each request on its own, so padding may appear in the
/// middle of the stream. Input is decoded one 4-character quantum at a
/// time; a partial quantum waits for the next read.
#[derive(Debug, Default)]
pub struct Base64Framer {
    encoded: Vec<u8>,
    decoded: Vec<u8>,
}

impl Base64Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the POST socket.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.encoded
            .extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));

        let whole = self.encoded.len() / 4 * 4;
        let mut out = [0u8; 3];
        for quantum in self.encoded[..whole].chunks_exact(4) {
            let n = STANDARD
                .decode_slice(quantum, &mut out)
                .map_err(|_| StreamError::Parse {
                    kind: ParseErrorKind::InvalidBase64,
                })?;
            self.decoded.extend_from_slice(&out[..n]);
        }
        self.encoded.drain(..whole);

        if self.decoded.len() > MAX_PENDING && self.head_end().is_none() {
            return Err(StreamError::Parse {
                kind: ParseErrorKind::RequestTooLarge,
            });
        }
        Ok(())
    }

    fn head_end(&self) -> Option<usize> {
        self.decoded
            .windows(HEAD_END.len())
            .position(|w| w == HEAD_END)
            .map(|at| at + HEAD_END.len())
    }

    /// Take the next complete request head, blank line included.
    pub fn next_message(&mut self) -> Option<String> {
        let end = self.head_end()?;
        let head: Vec<u8> = self.decoded.drain(..end).collect();
        Some(String::from_utf8_lossy(&head).into_owned())
    }

    /// Drop up to `len` decoded body bytes following a request head.
    pub fn discard(&mut self, len: usize) {
        let len = len.min(self.decoded.len());
        self.decoded.drain(..len);
    }

    pub fn buffered(&self) -> usize {
        self.decoded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_messages_across_reads() {
        let first = STANDARD.encode("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let second = STANDARD.encode("DESCRIBE /video/h264 RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        let stream = format!("{first}{second}");
        let (a, b) = stream.as_bytes().split_at(7);

        let mut framer = Base64Framer::new();
        framer.feed(a).unwrap();
        assert!(framer.next_message().is_none());
        framer.feed(b).unwrap();
        assert_eq!(framer.next_message().unwrap(), "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert!(framer.next_message().unwrap().starts_with("DESCRIBE /video/h264"));
        assert!(framer.next_message().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn line_breaks_in_encoding_are_ignored() {
        let encoded = STANDARD.encode("PLAY /video/h264 RTSP/1.0\r\nCSeq: 4\r\n\r\n");
        let wrapped = format!("{}\r\n{}", &encoded[..8], &encoded[8..]);
        let mut framer = Base64Framer::new();
        framer.feed(wrapped.as_bytes()).unwrap();
        assert!(framer.next_message().unwrap().starts_with("PLAY"));
    }

    #[test]
    fn invalid_base64_is_an_error() {
        let mut framer = Base64Framer::new();
        assert!(matches!(
            framer.feed(b"@@@@"),
            Err(StreamError::Parse { kind: ParseErrorKind::InvalidBase64 })
        ));
    }

    #[test]
    fn unterminated_head_is_capped() {
        let filler = STANDARD.encode(vec![b'A'; 3 * 1024]);
        let mut framer = Base64Framer::new();
        let mut result = Ok(());
        for _ in 0..(MAX_PENDING / (3 * 1024) + 2) {
            result = framer.feed(filler.as_bytes());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(StreamError::Parse { kind: ParseErrorKind::RequestTooLarge })
        ));
    }

    #[test]
    fn pipelined_heads_may_exceed_the_cap() {
        let one = "GET_PARAMETER * RTSP/1.0\r\nCSeq: 9\r\n\r\n";
        let many = one.repeat(MAX_PENDING / one.len() + 10);
        let mut framer = Base64Framer::new();
        framer.feed(STANDARD.encode(&many).as_bytes()).unwrap();
        assert_eq!(framer.next_message().unwrap(), one);
    }

    #[test]
    fn discard_drops_body_bytes() {
        let encoded = STANDARD.encode("SET_PARAMETER * RTSP/1.0\r\nContent-Length: 3\r\n\r\nabc");
        let mut framer = Base64Framer::new();
        framer.feed(encoded.as_bytes()).unwrap();
        framer.next_message().unwrap();
        assert_eq!(framer.buffered(), 3);
        framer.discard(10);
        assert_eq!(framer.buffered(), 0);
    }
}
