//! The per-connection request loop.
//!
//! ```text
//! read head (raw lines, or Base64 once the socket is a tunnel POST)
//!   -> skip '$' interleaved frames
//!   -> drain body (413 past MAX_BODY_LEN)
//!   -> Basic auth (401 and retry)
//!   -> HTTP routes | RTSP methods
//! ```

use std::io;
use std::sync::Arc;
use std::thread;

use super::handler::MethodHandler;
use super::request::{Protocol, Request};
use super::response::Response;
use super::tunnel::{Base64Framer, COOKIE_HEADER, POST_SENTINEL_LENGTH, TUNNEL_CONTENT_TYPE};
use super::{Flow, http, send};
use crate::error::StreamError;
use crate::server::Shared;
use crate::session::StreamConnection;
use crate::transport::{Connection, ConnectionHandler};

/// Interleaved-frame marker (RFC 2326 §10.12).
const INTERLEAVED_MARKER: u8 = b'$';
const READ_CHUNK: usize = 4096;
/// Largest request body accepted; `/control` payloads are a few lines.
const MAX_BODY_LEN: usize = 64 * 1024;

enum Incoming {
    Request(Request),
    /// An interleaved RTCP/RTP frame from the client, already drained.
    Interleaved,
    Malformed(StreamError),
}

enum Body {
    Read(Vec<u8>),
    /// `Content-Length` is not a number.
    Invalid,
    TooLarge(usize),
}

enum Framing {
    Raw,
    Tunneled(Base64Framer),
}

/// Routes every accepted socket through the HTTP/RTSP request loop.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    auth_token: Option<String>,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>) -> Self {
        let auth_token = shared.config.credentials.as_ref().map(|c| c.token());
        Self { shared, auth_token }
    }
}

impl ConnectionHandler for Dispatcher {
    fn on_open(&self, conn: &Arc<Connection>) {
        let expired = self.shared.tunnels.sweep_expired();
        if expired > 0 {
            tracing::debug!(expired, "expired tunnels removed");
        }
        let stream = StreamConnection::new(
            conn.clone(),
            self.shared.config.queue,
            self.shared.events.clone(),
        );
        self.shared.connections.insert(Arc::new(stream));
    }

    fn handle(&self, conn: &Arc<Connection>) -> io::Result<()> {
        let Some(stream) = self.shared.connections.get(conn.id()) else {
            return Ok(());
        };
        conn.set_read_timeout(self.shared.config.socket_timeout)?;
        RequestLoop {
            shared: &self.shared,
            auth_token: self.auth_token.as_deref(),
            stream,
            framing: Framing::Raw,
            cookie: None,
        }
        .run()
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        if let Some(stream) = self.shared.connections.remove(conn.id()) {
            stream.close();
        }
    }
}

struct RequestLoop<'a> {
    shared: &'a Shared,
    auth_token: Option<&'a str>,
    stream: Arc<StreamConnection>,
    framing: Framing,
    /// Set once this socket became the POST half of a tunnel.
    cookie: Option<String>,
}

impl RequestLoop<'_> {
    fn conn(&self) -> &Arc<Connection> {
        self.stream.connection()
    }

    fn run(mut self) -> io::Result<()> {
        loop {
            let request = match self.read_incoming()? {
                None => return Ok(()),
                Some(Incoming::Interleaved) => continue,
                Some(Incoming::Malformed(e)) => {
                    tracing::warn!(peer = %self.conn().peer_addr(), error = %e, "malformed request");
                    send(self.conn(), &Response::error(Protocol::Http, 400, "Bad Request"))?;
                    return Ok(());
                }
                Some(Incoming::Request(request)) => request,
            };
            tracing::debug!(
                peer = %self.conn().peer_addr(),
                method = %request.method,
                uri = %request.uri,
                version = %request.version,
                "request"
            );

            // The body is consumed even when the request is then rejected.
            let body = match self.read_body(&request)? {
                Body::Read(body) => body,
                Body::Invalid => {
                    tracing::warn!(peer = %self.conn().peer_addr(), "invalid Content-Length");
                    self.reject(&request, 400, "Bad Request")?;
                    return Ok(());
                }
                Body::TooLarge(len) => {
                    tracing::warn!(peer = %self.conn().peer_addr(), len, max = MAX_BODY_LEN, "request body too large");
                    self.reject(&request, 413, "Request Entity Too Large")?;
                    return Ok(());
                }
            };

            if let Some(token) = self.auth_token
                && !request.is_authorized(token)
            {
                tracing::warn!(peer = %self.conn().peer_addr(), path = %request.path, "authorization failed");
                let challenge = match request.protocol() {
                    Some(Protocol::Rtsp) => {
                        Response::unauthorized(Protocol::Rtsp, &self.shared.config.realm)
                            .with_cseq(request.cseq())
                    }
                    _ => Response::unauthorized(Protocol::Http, &self.shared.config.realm),
                };
                send(self.conn(), &challenge)?;
                continue;
            }

            let flow = match request.protocol() {
                Some(Protocol::Http) => self.serve_http(&request, &body)?,
                Some(Protocol::Rtsp) => self.serve_rtsp(&request)?,
                None => {
                    tracing::warn!(version = %request.version, "unsupported protocol");
                    send(self.conn(), &Response::error(Protocol::Http, 400, "Bad Request"))?;
                    Flow::Close
                }
            };
            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    fn read_incoming(&mut self) -> io::Result<Option<Incoming>> {
        match &mut self.framing {
            Framing::Raw => read_raw(self.stream.connection()),
            Framing::Tunneled(framer) => read_tunneled(self.stream.connection(), framer),
        }
    }

    /// Read the body announced by `Content-Length`, except for the endless
    /// body of a tunnel POST.
    fn read_body(&mut self, request: &Request) -> io::Result<Body> {
        let Some(len) = request.content_length() else {
            return Ok(Body::Invalid);
        };
        if len == 0 || len == POST_SENTINEL_LENGTH {
            return Ok(Body::Read(Vec::new()));
        }
        if len > MAX_BODY_LEN {
            return Ok(Body::TooLarge(len));
        }
        match &mut self.framing {
            Framing::Raw => {
                let mut body = vec![0u8; len];
                self.stream.connection().read_exact(&mut body)?;
                Ok(Body::Read(body))
            }
            Framing::Tunneled(framer) => {
                framer.discard(len);
                Ok(Body::Read(Vec::new()))
            }
        }
    }

    /// Error reply in the request's own protocol.
    fn reject(&self, request: &Request, status: u16, reason: &str) -> io::Result<()> {
        let response = match request.protocol() {
            Some(Protocol::Rtsp) => {
                Response::error(Protocol::Rtsp, status, reason).with_cseq(request.cseq())
            }
            _ => Response::error(Protocol::Http, status, reason),
        };
        send(self.conn(), &response)
    }

    fn serve_http(&mut self, request: &Request, body: &[u8]) -> io::Result<Flow> {
        let shared = self.shared;
        let conn = self.stream.connection().clone();
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/status") => http::status(shared, &conn, request),
            ("GET", "/sensors") => http::sensors(shared, &conn),
            ("GET", "/video") => http::video_list(shared, &conn),
            ("GET", "/audio") => http::audio_list(shared, &conn),
            ("GET", "/video/mjpeg") => {
                if !shared.can_stream("/video/mjpeg") {
                    send(&conn, &Response::error(Protocol::Http, 503, "Service Unavailable"))?;
                    return Ok(Flow::Close);
                }
                http::mjpeg(shared, &self.stream, request)
            }
            ("GET", "/video/h264") => self.tunnel_get(request),
            ("GET", _) => http::static_file(shared, &conn, request),
            ("POST", "/control") => http::control(shared, &conn, request, body),
            ("POST", "/video/h264") => self.tunnel_post(request),
            ("POST", _) => {
                send(&conn, &Response::error(Protocol::Http, 404, "Not Found"))?;
                Ok(Flow::Close)
            }
            (method, _) => {
                tracing::warn!(method, "unsupported HTTP method");
                send(&conn, &Response::error(Protocol::Http, 400, "Bad Request"))?;
                Ok(Flow::Close)
            }
        }
    }

    /// GET half of a tunnel: answer, register the cookie, then park until
    /// the cookie goes away. Output on this socket is driven by the POST half.
    fn tunnel_get(&mut self, request: &Request) -> io::Result<Flow> {
        let conn = self.stream.connection().clone();
        if !self.shared.can_stream("/video/h264") {
            send(&conn, &Response::error(Protocol::Http, 503, "Service Unavailable"))?;
            return Ok(Flow::Close);
        }
        let Some(cookie) = request.get_header(COOKIE_HEADER) else {
            send(&conn, &Response::error(Protocol::Http, 400, "Bad Request"))?;
            return Ok(Flow::Close);
        };
        send(
            &conn,
            &Response::ok_no_cache(Protocol::Http).add_header("Content-Type", TUNNEL_CONTENT_TYPE),
        )?;
        self.shared.tunnels.insert(cookie, self.stream.clone());
        tracing::info!(
            peer = %conn.peer_addr(),
            cookie,
            ttl_secs = self.shared.tunnels.ttl().as_secs(),
            "RTSP tunnel opened"
        );

        while self.shared.tunnels.contains(cookie) && !conn.is_closed() {
            thread::sleep(self.shared.config.tunnel_poll_interval);
        }
        tracing::info!(peer = %conn.peer_addr(), cookie, "RTSP tunnel closed");
        Ok(Flow::Close)
    }

    /// POST half of a tunnel: from now on this socket carries Base64 RTSP.
    fn tunnel_post(&mut self, request: &Request) -> io::Result<Flow> {
        let Some(cookie) = request.get_header(COOKIE_HEADER) else {
            return Ok(Flow::Close);
        };
        if !self.shared.tunnels.contains(cookie) {
            tracing::warn!(cookie, "tunnel POST for unknown cookie");
            return Ok(Flow::Close);
        }
        self.conn().set_read_timeout(self.shared.config.rtsp_safe_timeout())?;
        tracing::debug!(peer = %self.conn().peer_addr(), cookie, "tunnel POST paired");
        self.cookie = Some(cookie.to_string());
        self.framing = Framing::Tunneled(Base64Framer::new());
        Ok(Flow::Continue)
    }

    fn serve_rtsp(&mut self, request: &Request) -> io::Result<Flow> {
        let target = match &self.cookie {
            Some(cookie) => match self.shared.tunnels.get(cookie) {
                Some(target) => {
                    self.shared.tunnels.refresh(cookie);
                    target
                }
                None => {
                    tracing::debug!(cookie, "tunnel gone, closing POST");
                    return Ok(Flow::Close);
                }
            },
            None => self.stream.clone(),
        };

        let had_session = target.session_id().is_some();
        let flow = MethodHandler::new(self.shared, &target).handle(request)?;

        // Only a TEARDOWN that ended the whole session releases the GET half.
        if request.method == "TEARDOWN"
            && had_session
            && target.session_id().is_none()
            && let Some(cookie) = &self.cookie
        {
            self.shared.tunnels.remove(cookie);
        }
        Ok(flow)
    }
}

/// Read one request in raw framing. `None` at end of stream.
fn read_raw(conn: &Connection) -> io::Result<Option<Incoming>> {
    let mut lead = [0u8; 4];
    // Blank lines between requests are ignored.
    loop {
        if !read_or_eof(conn, &mut lead[..1])? {
            return Ok(None);
        }
        if !matches!(lead[0], b'\r' | b'\n') {
            break;
        }
    }
    if !read_or_eof(conn, &mut lead[1..])? {
        return Ok(None);
    }

    if lead[0] == INTERLEAVED_MARKER {
        let len = u16::from_be_bytes([lead[2], lead[3]]) as usize;
        tracing::trace!(channel = lead[1], len, "interleaved frame from client dropped");
        conn.skip(len)?;
        return Ok(Some(Incoming::Interleaved));
    }

    let mut head = String::from_utf8_lossy(&lead).into_owned();
    match conn.read_line()? {
        Some(rest) => head.push_str(&rest),
        None => return Ok(None),
    }
    head.push_str("\r\n");
    while let Some(line) = conn.read_line()? {
        if line.is_empty() {
            break;
        }
        head.push_str(&line);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    Ok(Some(match Request::parse(&head) {
        Ok(request) => Incoming::Request(request),
        Err(e) => Incoming::Malformed(e),
    }))
}

/// `false` when the peer closed before `buf` was filled.
fn read_or_eof(conn: &Connection, buf: &mut [u8]) -> io::Result<bool> {
    match conn.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read one Base64-wrapped request from a tunnel POST.
fn read_tunneled(conn: &Connection, framer: &mut Base64Framer) -> io::Result<Option<Incoming>> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if let Some(head) = framer.next_message() {
            return Ok(Some(match Request::parse(&head) {
                Ok(request) => Incoming::Request(request),
                Err(e) => Incoming::Malformed(e),
            }));
        }
        let n = conn.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if let Err(e) = framer.feed(&buf[..n]) {
            return Ok(Some(Incoming::Malformed(e)));
        }
    }
}
