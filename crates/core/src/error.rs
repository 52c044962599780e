//! Error types for the streaming server.

use std::fmt;

/// Errors that can occur in the streaming server.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), malformed HTTP/RTSP messages.
/// - **Transport**: [`Io`](Self::Io), socket/network failures.
/// - **Session**: [`Session`](Self::Session), RTSP session contract violations.
/// - **Media**: [`AccessUnitTooLarge`](Self::AccessUnitTooLarge),
///   [`Encode`](Self::Encode).
/// - **Lifecycle**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`AlreadyStarted`](Self::AlreadyStarted).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a request message.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The RTSP session state does not allow the operation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An audio access unit does not fit in one RTP packet. AAC fragmentation
    /// across packets is not supported.
    #[error("access unit of {size} bytes exceeds the {max} byte packet limit")]
    AccessUnitTooLarge { size: usize, max: usize },

    /// Track index outside `1..=2`.
    #[error("invalid track index: {0}")]
    InvalidTrack(u8),

    /// Image compression failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// A packetizer was started twice.
    #[error("packetizer already started")]
    AlreadyStarted,
}

/// RTSP session contract violations.
///
/// Kept distinct from "not found" so handlers can answer with the right
/// status code instead of a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No RTSP session is open on the connection.
    #[error("RTSP session not opened")]
    NotOpened,

    /// A session is already open on the connection.
    #[error("RTSP session already opened")]
    AlreadyOpened,

    /// The caller's session id does not match the open session.
    #[error("RTSP session not found")]
    NotFound,

    /// The track was already set up in this session.
    #[error("track already configured")]
    AlreadyConfigured,
}

impl SessionError {
    /// RTSP status code and reason phrase for this error.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::NotFound => (454, "Session Not Found"),
            Self::NotOpened | Self::AlreadyOpened | Self::AlreadyConfigured => {
                (455, "Method Not Valid in This State")
            }
        }
    }
}

/// Specific kind of request parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// The Request-URI could not be split into path and query.
    InvalidUri,
    /// A tunneled request was not valid Base64.
    InvalidBase64,
    /// A request head grew past the buffering limit without ending.
    RequestTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidUri => write!(f, "invalid request URI"),
            Self::InvalidBase64 => write!(f, "invalid base64 payload"),
            Self::RequestTooLarge => write!(f, "request head too large"),
        }
    }
}

impl From<ParseErrorKind> for StreamError {
    fn from(kind: ParseErrorKind) -> Self {
        StreamError::Parse { kind }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_distinct_codes() {
        assert_eq!(SessionError::NotFound.status().0, 454);
        assert_eq!(SessionError::NotOpened.status().0, 455);
        assert_eq!(SessionError::AlreadyConfigured.status().0, 455);
    }

    #[test]
    fn session_error_converts() {
        let err: StreamError = SessionError::NotOpened.into();
        assert!(matches!(err, StreamError::Session(SessionError::NotOpened)));
        assert_eq!(err.to_string(), "RTSP session not opened");
    }
}
