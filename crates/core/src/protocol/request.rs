use std::collections::HashMap;
use std::fmt;

use crate::error::{ParseErrorKind, Result, StreamError};

/// Protocol named in the request line's version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Rtsp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP/1.1",
            Self::Rtsp => "RTSP/1.0",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legacy paths some IP camera clients use, and the endpoint each maps to.
const ALIASES: &[(&str, &str)] = &[
    ("/h264", "/video/h264"),
    ("/H264", "/video/h264"),
    ("/live", "/video/h264"),
    ("/live.sdp", "/video/h264"),
    ("/live/h264", "/video/h264"),
    ("/live/0/h264.sdp", "/video/h264"),
    ("/h264/trackID=1", "/video/h264/trackID=1"),
    ("/H264/trackID=1", "/video/h264/trackID=1"),
    ("/live/trackID=1", "/video/h264/trackID=1"),
    ("/live.sdp/trackID=1", "/video/h264/trackID=1"),
    ("/live/h264/trackID=1", "/video/h264/trackID=1"),
    ("/live/0/h264.sdp/trackID=1", "/video/h264/trackID=1"),
    ("/h264/trackID=2", "/video/h264/trackID=2"),
    ("/H264/trackID=2", "/video/h264/trackID=2"),
    ("/live/trackID=2", "/video/h264/trackID=2"),
    ("/live.sdp/trackID=2", "/video/h264/trackID=2"),
    ("/live/h264/trackID=2", "/video/h264/trackID=2"),
    ("/live/0/h264.sdp/trackID=2", "/video/h264/trackID=2"),
    ("/mjpeg", "/video/mjpeg"),
    ("/live/mjpeg", "/video/mjpeg"),
    ("/video.mjpg", "/video/mjpeg"),
    ("/mjpg/video.mjpg", "/video/mjpeg"),
    ("/live/0/mjpeg.jpg", "/video/mjpeg"),
    ("/live/0/mjpeg.sdp", "/video/mjpeg"),
];

/// Map a legacy alias to its canonical endpoint; other paths pass through.
pub fn canonical_path(path: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == path)
        .map_or(path, |(_, canonical)| canonical)
}

/// A parsed HTTP or RTSP request head.
///
/// Both protocols share HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// Header lookup is case-insensitive (RFC 2326 §4.2). The body, if any, is
/// read separately by the dispatcher.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// Request-URI as received.
    pub uri: String,
    pub version: String,
    /// Path of the URI without a trailing `/`, aliases resolved.
    pub path: String,
    /// Query parameters, keys lowercased.
    pub query: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Parse a complete request head (request line, headers, blank line).
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(StreamError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(StreamError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(StreamError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let (path, query) = parse_uri(&uri)?;
        let path = canonical_path(&path).to_string();

        Ok(Request {
            method,
            uri,
            version,
            path,
            query,
            headers,
        })
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self.version.as_str() {
            "HTTP/1.1" | "HTTP/1.0" => Some(Protocol::Http),
            "RTSP/1.0" => Some(Protocol::Rtsp),
            _ => None,
        }
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// CSeq header (RFC 2326 §12.17). Missing or unparsable values read as 1.
    pub fn cseq(&self) -> u32 {
        self.get_header("CSeq")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// `Some(0)` without the header, `None` when it is not a number.
    pub fn content_length(&self) -> Option<usize> {
        match self.get_header("Content-Length") {
            None => Some(0),
            Some(value) => value.trim().parse().ok(),
        }
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// `Connection: keep-alive` was requested.
    pub fn keep_alive(&self) -> bool {
        self.get_header("Connection") == Some("keep-alive")
    }

    /// Check `Authorization: Basic <token>` against an expected token.
    pub fn is_authorized(&self, token: &str) -> bool {
        let Some(value) = self.get_header("Authorization") else {
            return false;
        };
        let parts: Vec<&str> = value.split(' ').collect();
        matches!(parts.as_slice(), ["Basic", t] if *t == token)
    }
}

/// Split a Request-URI into its path (trailing `/` removed, percent-decoded)
/// and its query parameters.
///
/// Absolute URIs (`rtsp://host:port/path`) are reduced to their path. `*`
/// is accepted as-is for `OPTIONS *`.
pub fn parse_uri(uri: &str) -> Result<(String, HashMap<String, String>)> {
    let invalid = || StreamError::Parse {
        kind: ParseErrorKind::InvalidUri,
    };

    if uri.chars().any(|c| !c.is_ascii_graphic() || "\"<>\\^`{|}".contains(c)) {
        return Err(invalid());
    }
    if uri == "*" {
        return Ok(("*".to_string(), HashMap::new()));
    }

    let uri = uri.split('#').next().unwrap_or("");
    let relative = match uri.find("://") {
        Some(pos) => {
            let after = &uri[pos + 3..];
            match after.find('/') {
                Some(slash) => &after[slash..],
                None => "/",
            }
        }
        None => uri,
    };
    let (raw_path, raw_query) = match relative.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (relative, None),
    };
    if !raw_path.starts_with('/') {
        return Err(invalid());
    }

    let mut path = percent_decode(raw_path).ok_or_else(invalid)?;
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    let mut query = HashMap::new();
    if let Some(q) = raw_query {
        for pair in q.split('&') {
            let kv: Vec<&str> = pair.split('=').collect();
            if let [k, v] = kv.as_slice() {
                let k = percent_decode(k).ok_or_else(invalid)?;
                let v = percent_decode(v).ok_or_else(invalid)?;
                query.insert(k.to_lowercase(), v);
            }
        }
    }
    Ok((path, query))
}

fn percent_decode(s: &str) -> Option<String> {
    if !s.contains('%') {
        return Some(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
