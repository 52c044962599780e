//! HTTP and RTSP signaling on the shared TCP port.
//!
//! Requests on both protocols follow HTTP/1.1 syntax and are told apart by
//! the version field of the request line:
//!
//! ```text
//! DESCRIBE rtsp://server/video/h264 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! \r\n
//! ```
//!
//! ## Endpoints
//!
//! | Protocol | Method | Path | Purpose |
//! |----------|--------|------|---------|
//! | HTTP | GET | `/status`, `/sensors`, `/video`, `/audio` | JSON reports |
//! | HTTP | GET | `/video/mjpeg?quality=&fps=` | Multipart JPEG stream |
//! | HTTP | GET/POST | `/video/h264` | RTSP-over-HTTP tunnel halves |
//! | HTTP | POST | `/control` | `key=value` control actions |
//! | HTTP | GET | anything else | Static assets |
//! | RTSP | OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER, TEARDOWN | `/video/h264[/trackID=1\|2]` | RFC 2326 §10 |

pub(crate) mod dispatcher;
pub(crate) mod handler;
pub(crate) mod http;
pub mod request;
pub mod response;
pub mod sdp;
pub mod tunnel;

use std::io;

pub use request::{Protocol, Request};
pub use response::Response;

use crate::transport::Connection;

/// What the request loop does after a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

pub(crate) fn send(conn: &Connection, response: &Response) -> io::Result<()> {
    tracing::trace!(
        peer = %conn.peer_addr(),
        protocol = %response.protocol,
        status = response.status_code,
        "reply"
    );
    conn.write_all(&response.serialize())
}
