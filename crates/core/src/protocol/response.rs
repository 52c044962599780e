use super::request::Protocol;

/// An HTTP or RTSP response head plus optional body.
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
pub struct Response {
    pub protocol: Protocol,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Server identification string included in every response.
pub const SERVER_AGENT: &str = "camstream/0.1";

impl Response {
    pub fn new(protocol: Protocol, status_code: u16, status_text: &str) -> Self {
        Response {
            protocol,
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok(protocol: Protocol) -> Self {
        Self::new(protocol, 200, "OK")
    }

    /// 200 OK that clients and proxies must not cache.
    pub fn ok_no_cache(protocol: Protocol) -> Self {
        Self::ok(protocol).no_cache()
    }

    /// Error reply whose plain-text body repeats the reason phrase.
    pub fn error(protocol: Protocol, status_code: u16, reason: &str) -> Self {
        Self::new(protocol, status_code, reason)
            .no_cache()
            .add_header("Content-Type", "text/plain")
            .with_body(reason.as_bytes().to_vec())
    }

    /// 401 with a Basic challenge (RFC 7617).
    pub fn unauthorized(protocol: Protocol, realm: &str) -> Self {
        Self::new(protocol, 401, "Unauthorized")
            .add_header("WWW-Authenticate", &format!("Basic realm=\"{realm}\""))
            .no_cache()
    }

    pub fn no_cache(self) -> Self {
        self.add_header("Cache-Control", "no-cache")
            .add_header("Pragma", "no-cache")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_cseq(self, cseq: u32) -> Self {
        self.add_header("CSeq", &cseq.to_string())
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize to the text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically.
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.protocol, self.status_code, self.status_text);

        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }

        match &self.body {
            Some(body) => {
                head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                let mut out = head.into_bytes();
                out.extend_from_slice(body);
                out
            }
            None => {
                head.push_str("\r\n");
                head.into_bytes()
            }
        }
    }
}
