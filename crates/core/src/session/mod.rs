//! Per-connection stream state and RTSP session bookkeeping
//! (RFC 2326 §3, §12.37).
//!
//! Every accepted socket gets a [`StreamConnection`]. It owns:
//!
//! - A [`StreamState`]: one bounded queue per media kind plus the
//!   "streaming" flags that gate the push side.
//! - An optional RTSP session: id, RTP sequence base, and up to one
//!   packetizer per track (video = trackID 1, audio = trackID 2).
//!
//! ## Session lifecycle
//!
//! ```text
//! SETUP track      -> session opened (first SETUP), packetizer built
//! PLAY             -> packetizer thread started
//! TEARDOWN track   -> packetizer stopped; session closed once no track is left
//! socket closed    -> every packetizer stopped
//! ```

pub mod queue;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SessionError, StreamError};
use crate::events::EventHub;
use crate::media::aac::AacPayloader;
use crate::media::h264::H264Payloader;
use crate::media::packetizer::Packetizer;
use crate::media::{AudioBuffer, EncodedUnit, RawFrame, StreamKind, VideoBuffer};
use crate::transport::{Connection, InterleavedSink, RtpSink, UdpSink};
pub use queue::{BoundedQueue, Popped, QueueConfig};
pub use transport::TransportSpec;

/// RTSP track index as used in `trackID=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Video = 1,
    Audio = 2,
}

impl Track {
    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            1 => Ok(Self::Video),
            2 => Ok(Self::Audio),
            other => Err(StreamError::InvalidTrack(other)),
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }
}

/// Queues and streaming flags shared by a connection's threads.
///
/// The flags are the only synchronization between the fan-out push path
/// and the consumer threads: a queue accepts data only while its kind is
/// marked as streaming.
#[derive(Debug)]
pub struct StreamState {
    frames: BoundedQueue<RawFrame>,
    slices: BoundedQueue<EncodedUnit>,
    audio: BoundedQueue<EncodedUnit>,
    mjpeg: AtomicBool,
    h264: AtomicBool,
    aac: AtomicBool,
    events: Arc<EventHub>,
}

impl StreamState {
    pub fn new(config: QueueConfig, events: Arc<EventHub>) -> Self {
        Self {
            frames: BoundedQueue::new(config),
            slices: BoundedQueue::new(config),
            audio: BoundedQueue::new(config),
            mjpeg: AtomicBool::new(false),
            h264: AtomicBool::new(false),
            aac: AtomicBool::new(false),
            events,
        }
    }

    fn flag(&self, kind: StreamKind) -> &AtomicBool {
        match kind {
            StreamKind::Mjpeg => &self.mjpeg,
            StreamKind::H264 => &self.h264,
            StreamKind::Aac => &self.aac,
        }
    }

    pub fn is_streaming(&self, kind: StreamKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    /// Offer a video buffer. Returns `true` if it was queued.
    pub fn push_video(&self, buffer: &VideoBuffer) -> bool {
        let queued = match buffer {
            VideoBuffer::Raw(frame) => {
                self.is_streaming(StreamKind::Mjpeg) && self.frames.push(frame.clone())
            }
            VideoBuffer::Unit(unit) => {
                self.is_streaming(StreamKind::H264) && self.slices.push(unit.clone())
            }
            VideoBuffer::Config { .. } => return false,
        };
        if !queued && self.is_streaming(kind_of(buffer)) {
            tracing::trace!(kind = %kind_of(buffer), "queue full, buffer dropped");
        }
        queued
    }

    /// Offer an audio buffer. Returns `true` if it was queued.
    pub fn push_audio(&self, buffer: &AudioBuffer) -> bool {
        match buffer {
            AudioBuffer::Unit(unit) => {
                if !self.is_streaming(StreamKind::Aac) {
                    return false;
                }
                let queued = self.audio.push(unit.clone());
                if !queued {
                    tracing::trace!("audio queue full, buffer dropped");
                }
                queued
            }
            AudioBuffer::Config { .. } => false,
        }
    }

    pub fn frames(&self) -> &BoundedQueue<RawFrame> {
        &self.frames
    }

    /// Queue of compressed units consumed by the packetizer of `kind`.
    pub fn encoded_queue(&self, kind: StreamKind) -> Option<&BoundedQueue<EncodedUnit>> {
        match kind {
            StreamKind::H264 => Some(&self.slices),
            StreamKind::Aac => Some(&self.audio),
            StreamKind::Mjpeg => None,
        }
    }

    pub fn notify_started(&self, kind: StreamKind, id: u64) {
        self.flag(kind).store(true, Ordering::SeqCst);
        self.events.stream_started(kind, id);
    }

    pub fn notify_stopped(&self, kind: StreamKind, id: u64) {
        self.flag(kind).store(false, Ordering::SeqCst);
        self.events.stream_stopped(kind, id);
    }

    pub fn request_control(&self, action: &str, params: &str) {
        self.events.control(action, params);
    }

    /// Mark `kind` as streaming under a fresh stream id. The returned guard
    /// reports the stream as stopped when dropped.
    pub fn begin_stream(self: &Arc<Self>, kind: StreamKind) -> StreamGuard {
        let id = crate::events::next_stream_id();
        self.notify_started(kind, id);
        StreamGuard {
            state: self.clone(),
            kind,
            id,
        }
    }
}

/// Fires "stream stopped" exactly once, whichever way a stream loop exits.
pub struct StreamGuard {
    state: Arc<StreamState>,
    kind: StreamKind,
    id: u64,
}

impl StreamGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.notify_stopped(self.kind, self.id);
    }
}

fn kind_of(buffer: &VideoBuffer) -> StreamKind {
    match buffer {
        VideoBuffer::Raw(_) => StreamKind::Mjpeg,
        _ => StreamKind::H264,
    }
}

#[derive(Default)]
struct RtspSession {
    id: Option<String>,
    rtp_seq: u16,
    video: Option<Packetizer<H264Payloader>>,
    audio: Option<Packetizer<AacPayloader>>,
}

impl RtspSession {
    fn has_tracks(&self) -> bool {
        self.video.is_some() || self.audio.is_some()
    }
}

/// A client socket together with its media queues and RTSP session.
pub struct StreamConnection {
    conn: Arc<Connection>,
    state: Arc<StreamState>,
    rtsp: Mutex<RtspSession>,
}

impl StreamConnection {
    pub fn new(conn: Arc<Connection>, queue: QueueConfig, events: Arc<EventHub>) -> Self {
        Self {
            conn,
            state: Arc::new(StreamState::new(queue, events)),
            rtsp: Mutex::new(RtspSession::default()),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    pub fn push_video(&self, buffer: &VideoBuffer) -> bool {
        self.state.push_video(buffer)
    }

    pub fn push_audio(&self, buffer: &AudioBuffer) -> bool {
        self.state.push_audio(buffer)
    }

    pub fn session_id(&self) -> Option<String> {
        self.rtsp.lock().id.clone()
    }

    /// RTP sequence base shared by both tracks of the session.
    pub fn rtp_seq(&self) -> u16 {
        self.rtsp.lock().rtp_seq
    }

    /// Open the RTSP session, fixing its id and RTP sequence base.
    pub fn open_session(&self) -> std::result::Result<String, SessionError> {
        let mut rtsp = self.rtsp.lock();
        if rtsp.id.is_some() {
            return Err(SessionError::AlreadyOpened);
        }
        let id = format!("{:016X}", rand::random::<u64>());
        rtsp.id = Some(id.clone());
        rtsp.rtp_seq = rand::random();
        tracing::info!(peer = %self.conn.peer_addr(), session_id = %id, "RTSP session opened");
        Ok(id)
    }

    /// Check a `Session` header value (`id` or `id;timeout=N`) against the
    /// open session.
    pub fn validate_session(&self, header: &str) -> std::result::Result<(), SessionError> {
        let rtsp = self.rtsp.lock();
        let Some(id) = rtsp.id.as_deref() else {
            return Err(SessionError::NotOpened);
        };
        let requested = header.split(';').next().unwrap_or("").trim();
        if requested != id {
            return Err(SessionError::NotFound);
        }
        Ok(())
    }

    pub fn is_configured(&self, track: Track) -> bool {
        let rtsp = self.rtsp.lock();
        match track {
            Track::Video => rtsp.video.is_some(),
            Track::Audio => rtsp.audio.is_some(),
        }
    }

    /// Build the transport and packetizer of a track. Returns the local
    /// UDP ports, if the transport has any.
    pub fn setup(
        &self,
        track: Track,
        spec: TransportSpec,
        clock_rate: u32,
    ) -> Result<Option<(u16, u16)>> {
        let mut rtsp = self.rtsp.lock();
        if rtsp.id.is_none() {
            return Err(SessionError::NotOpened.into());
        }
        let configured = match track {
            Track::Video => rtsp.video.is_some(),
            Track::Audio => rtsp.audio.is_some(),
        };
        if configured {
            return Err(SessionError::AlreadyConfigured.into());
        }

        let sink: Box<dyn RtpSink> = match spec {
            TransportSpec::Udp {
                rtp_port,
                rtcp_port,
            } => Box::new(UdpSink::bind(self.conn.peer_addr().ip(), rtp_port, rtcp_port)?),
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => Box::new(InterleavedSink::new(self.conn.clone(), rtp_channel, rtcp_channel)),
        };

        let seq = rtsp.rtp_seq;
        let (ports, ssrc) = match track {
            Track::Video => {
                let p = Packetizer::new(H264Payloader::new(), sink, self.state.clone(), clock_rate, seq);
                let configured = (p.local_ports(), p.ssrc());
                rtsp.video = Some(p);
                configured
            }
            Track::Audio => {
                let p = Packetizer::new(AacPayloader::new(), sink, self.state.clone(), clock_rate, seq);
                let configured = (p.local_ports(), p.ssrc());
                rtsp.audio = Some(p);
                configured
            }
        };
        tracing::debug!(
            peer = %self.conn.peer_addr(),
            track = track.index(),
            ?spec,
            ssrc,
            clock_rate,
            "track configured"
        );
        Ok(ports)
    }

    /// Start a configured track. Returns `false` when the track was never
    /// set up or is already playing.
    pub fn play(&self, track: Track) -> Result<bool> {
        let mut rtsp = self.rtsp.lock();
        if rtsp.id.is_none() {
            return Err(SessionError::NotOpened.into());
        }
        let started = match track {
            Track::Video => rtsp.video.as_mut().map(|p| p.start()),
            Track::Audio => rtsp.audio.as_mut().map(|p| p.start()),
        };
        match started {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(StreamError::AlreadyStarted)) => {
                tracing::debug!(track = track.index(), "track already playing");
                Ok(false)
            }
            Some(Err(e)) => Err(e),
        }
    }

    /// Stop and release a track. The session closes once no track is left.
    pub fn stop(&self, track: Track) {
        let (video, audio) = {
            let mut rtsp = self.rtsp.lock();
            let taken = match track {
                Track::Video => (rtsp.video.take(), None),
                Track::Audio => (None, rtsp.audio.take()),
            };
            if !rtsp.has_tracks()
                && let Some(id) = rtsp.id.take()
            {
                tracing::info!(peer = %self.conn.peer_addr(), session_id = %id, "RTSP session closed");
            }
            taken
        };
        // Dropping a packetizer joins its thread; never under the lock.
        if video.is_some() || audio.is_some() {
            let was_playing = video.as_ref().is_some_and(Packetizer::is_running)
                || audio.as_ref().is_some_and(Packetizer::is_running);
            drop(video);
            drop(audio);
            tracing::debug!(
                peer = %self.conn.peer_addr(),
                track = track.index(),
                was_playing,
                "track released"
            );
        }
    }

    /// Stop both tracks and shut the socket down.
    pub fn close(&self) {
        self.stop(Track::Video);
        self.stop(Track::Audio);
        self.conn.close();
    }
}
