use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, StreamError};
use crate::events::{EventHub, ServerEvent};
use crate::media::aac::AudioSpecificConfig;
use crate::media::h264::ParameterSets;
use crate::media::{AudioBuffer, VideoBuffer};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::sdp::{AudioTrack, VideoTrack};
use crate::registry::{ConnectionRegistry, TunnelCache};
use crate::session::QueueConfig;
use crate::transport::Listener;

/// Basic authentication credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Base64 `username:password`, as sent after `Basic `.
    pub fn token(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Size of the connection worker pool.
    pub max_connections: usize,
    pub credentials: Option<Credentials>,
    /// Initial read timeout of every accepted socket.
    pub socket_timeout: Duration,
    /// Advertised in the `Session` header. Sockets carrying an RTSP session
    /// (and tunnel cookies) time out 5 s later.
    pub rtsp_session_timeout_secs: u64,
    pub mjpeg_max_quality: u8,
    pub mjpeg_max_fps: f64,
    /// Directory served for unknown GET paths. `None` serves nothing.
    pub asset_root: Option<std::path::PathBuf>,
    pub realm: String,
    pub sdp_session_name: String,
    pub tunnel_poll_interval: Duration,
    pub queue: QueueConfig,
}

impl ServerConfig {
    /// Read timeout of a socket once an RTSP session is set up.
    pub fn rtsp_safe_timeout(&self) -> Duration {
        Duration::from_secs(self.rtsp_session_timeout_secs + 5)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_connections: 10,
            credentials: None,
            socket_timeout: Duration::from_secs(5),
            rtsp_session_timeout_secs: 30,
            mjpeg_max_quality: 90,
            mjpeg_max_fps: 10.0,
            asset_root: None,
            realm: "camstream".to_string(),
            sdp_session_name: "Live".to_string(),
            tunnel_poll_interval: Duration::from_secs(1),
            queue: QueueConfig::default(),
        }
    }
}

/// Last known device position, reported by `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Fix time, milliseconds since the Unix epoch.
    pub time: i64,
    pub accuracy: f32,
    pub provider: String,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            time: 0,
            accuracy: -1.0,
            provider: "none".to_string(),
        }
    }
}

/// Battery state, reported by `/sensors`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryStatus {
    /// `AC`, `USB`, `unplugged` or `unknown`.
    pub connection: String,
    /// Charge percentage, `-1` when unknown.
    pub level: i32,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self {
            connection: "unknown".to_string(),
            level: -1,
        }
    }
}

#[derive(Default)]
struct Availability {
    wifi: AtomicBool,
    mobile: AtomicBool,
    h264: AtomicBool,
    audio: AtomicBool,
    torch: AtomicBool,
}

#[derive(Default)]
struct CodecState {
    parameter_sets: ParameterSets,
    audio_config: Option<Bytes>,
    audio: Option<AudioSpecificConfig>,
}

/// State shared by the server handle and every connection handler.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub events: Arc<EventHub>,
    pub connections: ConnectionRegistry,
    pub tunnels: TunnelCache,
    availability: Availability,
    codecs: Mutex<CodecState>,
    location: Mutex<Location>,
    battery: Mutex<BatteryStatus>,
}

impl Shared {
    fn new(config: ServerConfig) -> Self {
        let tunnels = TunnelCache::new(config.rtsp_safe_timeout());
        Self {
            config,
            events: Arc::new(EventHub::new()),
            connections: ConnectionRegistry::new(),
            tunnels,
            availability: Availability::default(),
            codecs: Mutex::new(CodecState::default()),
            location: Mutex::new(Location::default()),
            battery: Mutex::new(BatteryStatus::default()),
        }
    }

    pub fn wifi_available(&self) -> bool {
        self.availability.wifi.load(Ordering::SeqCst)
    }

    pub fn mobile_available(&self) -> bool {
        self.availability.mobile.load(Ordering::SeqCst)
    }

    pub fn h264_available(&self) -> bool {
        self.availability.h264.load(Ordering::SeqCst)
    }

    pub fn audio_available(&self) -> bool {
        self.availability.audio.load(Ordering::SeqCst)
    }

    pub fn torch(&self) -> bool {
        self.availability.torch.load(Ordering::SeqCst)
    }

    pub fn location(&self) -> Location {
        self.location.lock().clone()
    }

    pub fn battery(&self) -> BatteryStatus {
        self.battery.lock().clone()
    }

    /// Whether the stream behind a canonical path can be served right now.
    pub fn can_stream(&self, path: &str) -> bool {
        let network = self.wifi_available() || self.mobile_available();
        match path {
            "/video/mjpeg" => network,
            "/video/h264" | "/video/h264/trackID=1" | "/video/h264/trackID=2" => {
                network && self.h264_available()
            }
            _ => false,
        }
    }

    /// SDP video track, once both SPS and PPS are known.
    pub fn video_track(&self) -> Option<VideoTrack> {
        let codecs = self.codecs.lock();
        Some(VideoTrack {
            sprop_parameter_sets: codecs.parameter_sets.sprop_parameter_sets()?,
            profile_level_id: codecs.parameter_sets.profile_level_id(),
        })
    }

    /// SDP audio track, when audio is available and its config is usable.
    pub fn audio_track(&self) -> Option<AudioTrack> {
        if !self.audio_available() {
            return None;
        }
        let codecs = self.codecs.lock();
        let config = codecs.audio_config.as_ref()?;
        let parsed = codecs.audio.as_ref()?;
        if parsed.sampling_frequency == 0 || parsed.channels == 0 {
            return None;
        }
        Some(AudioTrack {
            sampling_frequency: parsed.sampling_frequency,
            channels: parsed.channels,
            config: config.to_vec(),
        })
    }

    /// RTP clock rate of the audio track: its sampling frequency.
    pub fn audio_clock_rate(&self) -> Option<u32> {
        self.codecs
            .lock()
            .audio
            .as_ref()
            .map(|a| a.sampling_frequency)
            .filter(|f| *f > 0)
    }

    fn push_video(&self, buffer: &VideoBuffer) {
        match buffer {
            VideoBuffer::Config { key, data, .. } => {
                self.codecs.lock().parameter_sets.set(*key, data);
                return;
            }
            VideoBuffer::Unit(unit) => {
                self.codecs.lock().parameter_sets.capture_in_band(&unit.data);
            }
            VideoBuffer::Raw(_) => {}
        }
        for conn in self.connections.all() {
            conn.push_video(buffer);
        }
    }

    fn push_audio(&self, buffer: &AudioBuffer) {
        match buffer {
            AudioBuffer::Config { data, .. } => {
                let parsed = AudioSpecificConfig::parse(data);
                match &parsed {
                    Some(cfg) => tracing::debug!(
                        object_type = cfg.object_type,
                        sampling_frequency = cfg.sampling_frequency,
                        channels = cfg.channels,
                        "audio config updated"
                    ),
                    None => tracing::warn!(config = %hex::encode(data), "unusable audio config"),
                }
                let mut codecs = self.codecs.lock();
                codecs.audio_config = Some(data.clone());
                codecs.audio = parsed;
            }
            AudioBuffer::Unit(_) => {
                for conn in self.connections.all() {
                    conn.push_audio(buffer);
                }
            }
        }
    }

    fn close_all(&self) {
        for conn in self.connections.clear() {
            conn.close();
        }
        self.tunnels.clear();
    }
}

/// The streaming server.
///
/// One TCP port serves HTTP status and MJPEG, RTSP, and RTSP tunneled over
/// HTTP. Capture code feeds it through [`push_video`](Self::push_video) and
/// [`push_audio`](Self::push_audio); each buffer is offered to every
/// connection currently streaming its media kind.
pub struct Server {
    shared: Arc<Shared>,
    listener: Option<Listener>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            listener: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn start(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        let config = &self.shared.config;
        let dispatcher = Arc::new(Dispatcher::new(self.shared.clone()));
        let listener = Listener::bind(config.bind_addr.as_str(), config.max_connections, dispatcher)?;
        tracing::info!(
            addr = %listener.local_addr(),
            auth = config.credentials.is_some(),
            "stream server started"
        );
        self.listener = Some(listener);
        Ok(())
    }

    /// Stop accepting, close every connection and drop all tunnels.
    pub fn stop(&mut self) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        listener.close();
        self.shared.close_all();
        tracing::info!("stream server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(Listener::local_addr)
    }

    /// Receive stream and control events.
    pub fn subscribe(&self) -> Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn push_video(&self, buffer: &VideoBuffer) {
        self.shared.push_video(buffer);
    }

    pub fn push_audio(&self, buffer: &AudioBuffer) {
        self.shared.push_audio(buffer);
    }

    pub fn set_wifi_available(&self, available: bool) {
        self.shared.availability.wifi.store(available, Ordering::SeqCst);
    }

    pub fn set_mobile_available(&self, available: bool) {
        self.shared.availability.mobile.store(available, Ordering::SeqCst);
    }

    pub fn set_h264_available(&self, available: bool) {
        self.shared.availability.h264.store(available, Ordering::SeqCst);
    }

    pub fn set_audio_available(&self, available: bool) {
        self.shared.availability.audio.store(available, Ordering::SeqCst);
    }

    pub fn set_torch(&self, on: bool) {
        self.shared.availability.torch.store(on, Ordering::SeqCst);
    }

    pub fn set_location(&self, location: Location) {
        *self.shared.location.lock() = location;
    }

    pub fn set_battery(&self, battery: BatteryStatus) {
        *self.shared.battery.lock() = battery;
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn active_streams(&self) -> usize {
        self.shared.events.active_streams()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
