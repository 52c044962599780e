use std::io;

use super::request::{Protocol, Request};
use super::response::Response;
use super::{Flow, sdp, send};
use crate::error::StreamError;
use crate::server::Shared;
use crate::session::{StreamConnection, Track, TransportSpec};

const PUBLIC_METHODS: &str = "DESCRIBE, SETUP, PLAY, GET_PARAMETER, TEARDOWN";
const RTSP: Protocol = Protocol::Rtsp;
const AGGREGATE_PATH: &str = "/video/h264";
const TRACK_PREFIX: &str = "/video/h264/trackID=";

/// Track of a `.../trackID=N` path.
fn track_of(path: &str) -> crate::error::Result<Track> {
    let index = path
        .strip_prefix(TRACK_PREFIX)
        .and_then(|index| index.parse().ok())
        .unwrap_or(0);
    Track::from_index(index)
}

/// Tracks addressed by a request path.
fn tracks_for(path: &str) -> Option<&'static [Track]> {
    if path == AGGREGATE_PATH {
        return Some(&[Track::Video, Track::Audio]);
    }
    match track_of(path).ok()? {
        Track::Video => Some(&[Track::Video]),
        Track::Audio => Some(&[Track::Audio]),
    }
}

/// Executes RTSP methods against one connection's session.
///
/// For a tunneled request, `target` is the GET half of the tunnel: replies
/// and media leave through its socket, not the one the request came in on.
pub(crate) struct MethodHandler<'a> {
    shared: &'a Shared,
    target: &'a StreamConnection,
}

impl<'a> MethodHandler<'a> {
    pub fn new(shared: &'a Shared, target: &'a StreamConnection) -> Self {
        Self { shared, target }
    }

    pub fn handle(&self, request: &Request) -> io::Result<Flow> {
        let cseq = request.cseq();
        tracing::debug!(
            peer = %self.target.connection().peer_addr(),
            method = %request.method,
            path = %request.path,
            cseq,
            "RTSP request"
        );

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, request),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, cseq, "unsupported RTSP method");
                self.send(
                    Response::new(RTSP, 405, "Method Not Allowed")
                        .with_cseq(cseq)
                        .add_header("Allow", PUBLIC_METHODS),
                )?;
                Ok(Flow::Close)
            }
        }
    }

    fn send(&self, response: Response) -> io::Result<()> {
        send(self.target.connection(), &response)
    }

    fn reply_error(&self, cseq: u32, code: u16, reason: &str) -> io::Result<Flow> {
        self.send(Response::error(RTSP, code, reason).with_cseq(cseq))?;
        Ok(Flow::Continue)
    }

    fn session_header(&self) -> Option<String> {
        let id = self.target.session_id()?;
        Some(format!("{id};timeout={}", self.shared.config.rtsp_session_timeout_secs))
    }

    fn handle_options(&self, cseq: u32) -> io::Result<Flow> {
        self.send(
            Response::ok(RTSP)
                .with_cseq(cseq)
                .add_header("Public", PUBLIC_METHODS),
        )?;
        Ok(Flow::Continue)
    }

    fn handle_describe(&self, cseq: u32, request: &Request) -> io::Result<Flow> {
        if request.path != "/video/h264" {
            tracing::warn!(path = %request.path, "DESCRIBE for unknown stream");
            return self.reply_error(cseq, 404, "Not Found");
        }
        let Some(video) = self.shared.video_track() else {
            tracing::warn!(cseq, "DESCRIBE before SPS/PPS are known");
            return self.reply_error(cseq, 503, "Service Unavailable");
        };
        let audio = self.shared.audio_track();

        let host = self.target.connection().local_addr().ip();
        let body = sdp::generate_sdp(host, &self.shared.config.sdp_session_name, &video, audio.as_ref());

        let mut base = request.uri.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        self.send(
            Response::ok(RTSP)
                .with_cseq(cseq)
                .add_header("Content-Type", "application/sdp")
                .add_header("Content-Base", &base)
                .with_body(body),
        )?;
        Ok(Flow::Continue)
    }

    fn handle_setup(&self, cseq: u32, request: &Request) -> io::Result<Flow> {
        if !self.shared.can_stream(&request.path) {
            self.send(Response::error(RTSP, 503, "Service Unavailable").with_cseq(cseq))?;
            return Ok(Flow::Close);
        }
        let track = match track_of(&request.path) {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!(path = %request.path, error = %e, "SETUP for unknown track");
                return self.reply_error(cseq, 404, "Not Found");
            }
        };
        let clock_rate = match track {
            Track::Video => 90_000,
            Track::Audio => match self.shared.audio_clock_rate() {
                Some(rate) => rate,
                None => {
                    tracing::warn!(cseq, "audio SETUP without a usable audio config");
                    return self.reply_error(cseq, 503, "Service Unavailable");
                }
            },
        };

        if self.target.session_id().is_none()
            && let Err(e) = self.target.open_session()
        {
            let (code, reason) = e.status();
            return self.reply_error(cseq, code, reason);
        }

        let Some(header) = request.get_header("Transport") else {
            tracing::warn!(cseq, "SETUP missing Transport header");
            return self.reply_error(cseq, 400, "Bad Request");
        };
        let spec = match TransportSpec::parse(header) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(cseq, transport = header, error = ?e, "SETUP invalid Transport header");
                return self.reply_error(cseq, 400, "Bad Request");
            }
        };

        let ports = match self.target.setup(track, spec, clock_rate) {
            Ok(ports) => ports,
            Err(StreamError::Session(e)) => {
                tracing::warn!(cseq, track = track.index(), error = %e, "SETUP rejected");
                let (code, reason) = e.status();
                return self.reply_error(cseq, code, reason);
            }
            Err(e) => {
                tracing::error!(cseq, track = track.index(), error = %e, "transport setup failed");
                return self.reply_error(cseq, 500, "Internal Server Error");
            }
        };

        self.target
            .connection()
            .set_read_timeout(self.shared.config.rtsp_safe_timeout())?;

        let mut response = Response::ok(RTSP)
            .with_cseq(cseq)
            .add_header("Transport", &spec.reply(ports));
        if let Some(session) = self.session_header() {
            response = response.add_header("Session", &session);
        }
        self.send(response)?;
        Ok(Flow::Continue)
    }

    /// Shared validation of PLAY, GET_PARAMETER and TEARDOWN. Returns the
    /// error reply to send, if any.
    fn check_session(&self, cseq: u32, request: &Request) -> Option<Response> {
        let Some(header) = request.get_header("Session") else {
            tracing::warn!(cseq, method = %request.method, "missing Session header");
            return Some(Response::error(RTSP, 400, "Bad Request").with_cseq(cseq));
        };
        match self.target.validate_session(header) {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(cseq, method = %request.method, session = header, error = %e, "session check failed");
                let (code, reason) = e.status();
                Some(Response::error(RTSP, code, reason).with_cseq(cseq))
            }
        }
    }

    fn handle_play(&self, cseq: u32, request: &Request) -> io::Result<Flow> {
        let Some(tracks) = tracks_for(&request.path) else {
            return self.reply_error(cseq, 404, "Not Found");
        };
        if let Some(error) = self.check_session(cseq, request) {
            self.send(error)?;
            return Ok(Flow::Continue);
        }

        let mut response = Response::ok(RTSP)
            .with_cseq(cseq)
            .add_header(
                "RTP-Info",
                &format!("url={};seq={}", request.uri, self.target.rtp_seq()),
            );
        if let Some(session) = self.session_header() {
            response = response.add_header("Session", &session);
        }
        self.send(response)?;

        for track in tracks {
            match self.target.play(*track) {
                Ok(true) => tracing::info!(
                    peer = %self.target.connection().peer_addr(),
                    track = track.index(),
                    "track playing"
                ),
                Ok(false) => {}
                Err(e) => tracing::warn!(track = track.index(), error = %e, "cannot start track"),
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_get_parameter(&self, cseq: u32, request: &Request) -> io::Result<Flow> {
        tracing::trace!(cseq, "GET_PARAMETER keepalive");
        if request.path != "/video/h264" {
            return self.reply_error(cseq, 404, "Not Found");
        }
        if let Some(error) = self.check_session(cseq, request) {
            self.send(error)?;
            return Ok(Flow::Continue);
        }
        let mut response = Response::ok(RTSP).with_cseq(cseq);
        if let Some(session) = self.session_header() {
            response = response.add_header("Session", &session);
        }
        self.send(response)?;
        Ok(Flow::Continue)
    }

    fn handle_teardown(&self, cseq: u32, request: &Request) -> io::Result<Flow> {
        let Some(tracks) = tracks_for(&request.path) else {
            return self.reply_error(cseq, 404, "Not Found");
        };
        if let Some(error) = self.check_session(cseq, request) {
            self.send(error)?;
            return Ok(Flow::Continue);
        }
        let mut response = Response::ok(RTSP).with_cseq(cseq);
        if let Some(session) = self.session_header() {
            response = response.add_header("Session", &session);
        }
        self.send(response)?;

        for track in tracks {
            self.target.stop(*track);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_paths() {
        assert_eq!(tracks_for("/video/h264"), Some(&[Track::Video, Track::Audio][..]));
        assert_eq!(tracks_for("/video/h264/trackID=2"), Some(&[Track::Audio][..]));
        assert_eq!(tracks_for("/video/mjpeg"), None);
        assert_eq!(tracks_for("/video/h264/trackID=3"), None);
    }

    #[test]
    fn track_ids_come_from_the_path_suffix() {
        assert_eq!(track_of("/video/h264/trackID=1").unwrap(), Track::Video);
        assert_eq!(track_of("/video/h264/trackID=2").unwrap(), Track::Audio);
        assert!(matches!(track_of("/video/h264/trackID=7"), Err(StreamError::InvalidTrack(7))));
        assert!(matches!(track_of("/video/h264/trackID=x"), Err(StreamError::InvalidTrack(0))));
        assert!(matches!(track_of("/video/h264"), Err(StreamError::InvalidTrack(0))));
    }
}
