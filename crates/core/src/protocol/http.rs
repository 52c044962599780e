//! Plain HTTP endpoints: JSON reports, remote control, static assets and
//! the MJPEG stream.

use std::io;
use std::path::{Component, Path};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use super::request::{Protocol, Request};
use super::response::Response;
use super::{Flow, send};
use crate::media::StreamKind;
use crate::media::mjpeg::{BOUNDARY, MIN_FPS, MIN_QUALITY, MjpegParams, encode_jpeg};
use crate::server::{BatteryStatus, Location, Shared};
use crate::session::StreamConnection;
use crate::transport::Connection;

const HTTP: Protocol = Protocol::Http;

fn send_json(conn: &Connection, value: &impl Serialize) -> io::Result<Flow> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "JSON serialization failed");
            send(conn, &Response::error(HTTP, 500, "Internal Error"))?;
            return Ok(Flow::Close);
        }
    };
    send(
        conn,
        &Response::ok_no_cache(HTTP)
            .add_header("Content-Type", "application/json")
            .with_body(body),
    )?;
    Ok(Flow::Close)
}

#[derive(Serialize)]
struct ConnectionReport {
    client_address: String,
    #[serde(rename = "MJPEG_stream")]
    mjpeg_stream: bool,
    #[serde(rename = "H264_stream")]
    h264_stream: bool,
    #[serde(rename = "AAC_stream")]
    aac_stream: bool,
    #[serde(rename = "RTSP_session_ID")]
    rtsp_session_id: Option<String>,
}

#[derive(Serialize)]
struct StatusReport {
    location: Location,
    connections: Vec<ConnectionReport>,
    streams: usize,
    #[serde(rename = "WiFi")]
    wifi: bool,
    mobile: bool,
    #[serde(rename = "H264")]
    h264: bool,
    audio: bool,
}

/// `GET /status`
pub(crate) fn status(shared: &Shared, conn: &Connection, request: &Request) -> io::Result<Flow> {
    if let Some(mode) = request.get_header("gps-mode") {
        shared.events.control("gps-mode", mode);
    }
    let connections = shared
        .connections
        .all()
        .iter()
        .map(|c| {
            let state = c.state();
            ConnectionReport {
                client_address: c.connection().peer_addr().ip().to_string(),
                mjpeg_stream: state.is_streaming(StreamKind::Mjpeg),
                h264_stream: state.is_streaming(StreamKind::H264),
                aac_stream: state.is_streaming(StreamKind::Aac),
                rtsp_session_id: c.session_id(),
            }
        })
        .collect();
    let report = StatusReport {
        location: shared.location(),
        connections,
        streams: shared.events.active_streams(),
        wifi: shared.wifi_available(),
        mobile: shared.mobile_available(),
        h264: shared.h264_available(),
        audio: shared.audio_available(),
    };
    send_json(conn, &report)
}

#[derive(Serialize)]
struct SensorsReport {
    battery: BatteryStatus,
    torch: bool,
}

/// `GET /sensors`
pub(crate) fn sensors(shared: &Shared, conn: &Connection) -> io::Result<Flow> {
    let report = SensorsReport {
        battery: shared.battery(),
        torch: shared.torch(),
    };
    send_json(conn, &report)
}

/// `GET /video`
pub(crate) fn video_list(shared: &Shared, conn: &Connection) -> io::Result<Flow> {
    let config = &shared.config;
    let list = json!({
        "streams": [
            {
                "url": "/video/mjpeg",
                "mime": "image/jpeg",
                "available": shared.can_stream("/video/mjpeg"),
                "parameters": [
                    { "name": "quality", "min": MIN_QUALITY, "max": config.mjpeg_max_quality },
                    { "name": "fps", "min": MIN_FPS, "max": config.mjpeg_max_fps },
                ],
            },
            {
                "url": "/video/h264",
                "mime": "video/avc",
                "available": shared.can_stream("/video/h264"),
                "parameters": [],
            },
        ]
    });
    send_json(conn, &list)
}

/// `GET /audio`
pub(crate) fn audio_list(shared: &Shared, conn: &Connection) -> io::Result<Flow> {
    let list = json!({
        "streams": [
            {
                "url": "/video/h264",
                "mime": "audio/mp4a-latm",
                "available": shared.can_stream("/video/h264") && shared.audio_available(),
                "parameters": [],
            },
        ]
    });
    send_json(conn, &list)
}

/// Split a control body into `(action, params)` pairs.
///
/// Pairs are separated by line breaks or `&`. Keys are trimmed and
/// lowercased; only segments with exactly one `=` count.
pub fn parse_control_body(body: &str) -> Vec<(String, String)> {
    let mut commands = Vec::new();
    for line in body.split('\n') {
        let line = line.replace('\r', "");
        for command in line.split('&') {
            let parts: Vec<&str> = command.split('=').collect();
            if let [key, value] = parts.as_slice() {
                commands.push((key.trim().to_lowercase(), value.trim().to_string()));
            }
        }
    }
    commands
}

/// `POST /control`
pub(crate) fn control(
    shared: &Shared,
    conn: &Connection,
    request: &Request,
    body: &[u8],
) -> io::Result<Flow> {
    let is_text = request
        .get_header("Content-Type")
        .is_some_and(|t| t.contains("text/plain"));
    if is_text {
        for (action, params) in parse_control_body(&String::from_utf8_lossy(body)) {
            shared.events.control(&action, &params);
        }
    } else {
        tracing::debug!(content_type = ?request.get_header("Content-Type"), "control body ignored");
    }
    send(conn, &Response::ok_no_cache(HTTP))?;
    Ok(Flow::Close)
}

/// Content type by file extension.
pub fn content_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Serve a file under the asset root. `/` maps to `/index.html`.
pub(crate) fn static_file(shared: &Shared, conn: &Connection, request: &Request) -> io::Result<Flow> {
    let path = if request.path == "/" {
        "/index.html"
    } else {
        request.path.as_str()
    };
    let relative = Path::new(path.trim_start_matches('/'));
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    let contents = match (&shared.config.asset_root, safe) {
        (Some(root), true) => std::fs::read(root.join(relative)).ok(),
        _ => None,
    };
    match contents {
        Some(data) => {
            tracing::debug!(path, len = data.len(), "static file");
            send(
                conn,
                &Response::ok(HTTP)
                    .add_header("Content-Type", content_type(path))
                    .with_body(data),
            )?;
        }
        None => {
            tracing::debug!(path, "static file not found");
            send(conn, &Response::error(HTTP, 404, "Not Found"))?;
        }
    }
    Ok(if request.keep_alive() {
        Flow::Continue
    } else {
        Flow::Close
    })
}

/// `GET /video/mjpeg`: stream frames until the client leaves or the
/// network goes away.
pub(crate) fn mjpeg(shared: &Shared, stream: &Arc<StreamConnection>, request: &Request) -> io::Result<Flow> {
    let conn = stream.connection();
    let params = MjpegParams::from_query(
        request.query_param("quality"),
        request.query_param("fps"),
        shared.config.mjpeg_max_quality,
        shared.config.mjpeg_max_fps,
    );
    let interval = params.frame_interval_us();
    send(
        conn,
        &Response::ok_no_cache(HTTP).add_header(
            "Content-Type",
            &format!("multipart/x-mixed-replace;boundary={BOUNDARY}"),
        ),
    )?;

    let state = stream.state();
    state.frames().clear();
    let guard = state.begin_stream(StreamKind::Mjpeg);
    tracing::info!(peer = %conn.peer_addr(), id = guard.id(), quality = params.quality, fps = params.fps, "MJPEG stream started");

    let part_header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut last: Option<u64> = None;
    while !conn.is_closed() && shared.can_stream("/video/mjpeg") {
        let Some(frame) = state.frames().pop() else {
            continue;
        };
        if last.is_some_and(|t| frame.timestamp_us < t + interval) {
            continue;
        }
        last = Some(frame.timestamp_us);

        let jpeg = match encode_jpeg(&frame, params.quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "frame dropped");
                continue;
            }
        };
        if let Err(e) = conn.write_vectored_all(&[part_header.as_bytes(), jpeg.as_slice(), b"\r\n".as_slice()]) {
            tracing::debug!(peer = %conn.peer_addr(), error = %e, "MJPEG client gone");
            break;
        }
        tracing::trace!(len = jpeg.len(), ts = frame.timestamp_us, "JPEG frame sent");
    }
    Ok(Flow::Close)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_body_lines_and_ampersands() {
        let cmds = parse_control_body("Torch=on\r\nzoom = 2&focus=auto\nbad\na=b=c&&\n");
        assert_eq!(
            cmds,
            vec![
                ("torch".to_string(), "on".to_string()),
                ("zoom".to_string(), "2".to_string()),
                ("focus".to_string(), "auto".to_string()),
            ]
        );
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type("/index.html"), "text/html");
        assert_eq!(content_type("/img/logo.PNG"), "image/png");
        assert_eq!(content_type("/blob"), "application/octet-stream");
    }

    #[test]
    fn status_report_key_names() {
        let report = StatusReport {
            location: Location::default(),
            connections: vec![ConnectionReport {
                client_address: "10.0.0.7".to_string(),
                mjpeg_stream: true,
                h264_stream: false,
                aac_stream: false,
                rtsp_session_id: None,
            }],
            streams: 1,
            wifi: true,
            mobile: false,
            h264: false,
            audio: false,
        };
        let v: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(v["WiFi"], true);
        assert_eq!(v["H264"], false);
        assert_eq!(v["location"]["provider"], "none");
        assert_eq!(v["location"]["accuracy"], -1.0);
        assert_eq!(v["connections"][0]["MJPEG_stream"], true);
        assert!(v["connections"][0]["RTSP_session_ID"].is_null());
    }
}
