use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use camstream::{Credentials, PixelFormat, Server, ServerConfig, ServerEvent, VideoBuffer, timestamp_us};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "camstream-server",
    about = "HTTP/MJPEG and RTSP live media server on a single port"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Connection worker pool size
    #[arg(long, default_value_t = 10)]
    max_connections: usize,

    /// Require Basic authentication with this user name
    #[arg(long, requires = "password")]
    user: Option<String>,

    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Directory served for static GET requests
    #[arg(long)]
    assets: Option<PathBuf>,

    #[arg(long, default_value_t = 90)]
    mjpeg_quality: u8,

    #[arg(long, default_value_t = 10.0)]
    mjpeg_fps: f64,

    /// Feed a synthetic gradient so `/video/mjpeg` has something to show
    #[arg(long)]
    test_pattern: bool,
}

const PATTERN_WIDTH: u32 = 320;
const PATTERN_HEIGHT: u32 = 240;

/// Moving gray ramp, one byte per pixel.
fn test_frame(step: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((PATTERN_WIDTH * PATTERN_HEIGHT) as usize);
    for y in 0..PATTERN_HEIGHT {
        for x in 0..PATTERN_WIDTH {
            data.push(((x + y + step) % 256) as u8);
        }
    }
    data
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let credentials = match (&args.user, &args.password) {
        (Some(user), Some(password)) => Some(Credentials::new(user, password)),
        _ => None,
    };
    let config = ServerConfig {
        bind_addr: args.bind.clone(),
        max_connections: args.max_connections,
        credentials,
        asset_root: args.assets.clone(),
        mjpeg_max_quality: args.mjpeg_quality,
        mjpeg_max_fps: args.mjpeg_fps,
        ..ServerConfig::default()
    };

    let mut server = Server::new(config);
    if let Err(e) = server.start() {
        tracing::error!(error = %e, "failed to start server");
        return;
    }
    server.set_wifi_available(true);

    let events = server.subscribe();
    thread::spawn(move || {
        for event in events {
            match event {
                ServerEvent::StreamStarted { kind, id } => tracing::info!(%kind, id, "event: stream started"),
                ServerEvent::StreamStopped { kind, id } => tracing::info!(%kind, id, "event: stream stopped"),
                ServerEvent::ControlRequest { action, params } => {
                    tracing::info!(action, params, "event: control request")
                }
            }
        }
    });

    let server = Arc::new(server);
    let running = Arc::new(AtomicBool::new(true));
    let feeder = args.test_pattern.then(|| {
        let server = server.clone();
        let running = running.clone();
        let interval = Duration::from_secs_f64(1.0 / args.mjpeg_fps.max(0.1));
        thread::spawn(move || {
            let mut step = 0u32;
            while running.load(Ordering::SeqCst) {
                let frame = test_frame(step);
                server.push_video(&VideoBuffer::raw(
                    &frame,
                    PATTERN_WIDTH,
                    PATTERN_HEIGHT,
                    PixelFormat::Gray8,
                    timestamp_us(),
                ));
                step = step.wrapping_add(4);
                thread::sleep(interval);
            }
        })
    });

    match server.local_addr() {
        Some(addr) => println!("camstream listening on {addr}, press Enter to stop"),
        None => println!("camstream running, press Enter to stop"),
    }
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "cannot read stdin");
    }

    running.store(false, Ordering::SeqCst);
    if let Some(feeder) = feeder {
        let _ = feeder.join();
    }
    match Arc::try_unwrap(server) {
        Ok(mut server) => server.stop(),
        Err(_) => tracing::warn!("server still referenced at shutdown"),
    }
}
