//! Media buffers, codecs and RTP/RTCP packetization.
//!
//! Capture and encoder code hands the server one of two buffer types:
//!
//! - [`VideoBuffer`]: a raw frame (for MJPEG), an encoded H.264 access unit,
//!   or an SPS/PPS configuration NAL.
//! - [`AudioBuffer`]: an encoded AAC access unit or the AudioSpecificConfig.
//!
//! Buffers copy their payload on construction so the producer's storage is
//! never aliased by a queue reader.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Transport |
//! |-------|--------|-----|-----------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | RTP (single NAL / FU-A) |
//! | AAC   | [`aac`]  | [RFC 3640](https://tools.ietf.org/html/rfc3640) | RTP (AAC-hbr) |
//! | JPEG  | [`mjpeg`] | - | HTTP multipart |

pub mod aac;
pub mod h264;
pub mod mjpeg;
pub mod packetizer;
pub mod rtcp;
pub mod rtp;

use std::fmt;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

/// Media kinds a connection can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Mjpeg,
    H264,
    Aac,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mjpeg => "mjpeg",
            Self::H264 => "h264",
            Self::Aac => "aac",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel layout of a raw video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0, full Y plane followed by interleaved V/U.
    Nv21,
    /// YUV 4:2:2 packed as `Y0 U Y1 V`.
    Yuyv,
    Rgb24,
    Gray8,
}

/// Identifies an H.264 configuration NAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    Sps,
    Pps,
}

/// Uncompressed picture, consumed by the MJPEG encoder.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp_us: u64,
}

/// One compressed access unit (H.264 Annex B or raw AAC).
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub timestamp_us: u64,
}

impl EncodedUnit {
    pub fn new(data: &[u8], timestamp_us: u64) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            timestamp_us,
        }
    }
}

/// A buffer produced by the video pipeline.
#[derive(Debug, Clone)]
pub enum VideoBuffer {
    Raw(RawFrame),
    Unit(EncodedUnit),
    Config {
        key: ConfigKey,
        data: Bytes,
        timestamp_us: u64,
    },
}

impl VideoBuffer {
    pub fn raw(data: &[u8], width: u32, height: u32, format: PixelFormat, timestamp_us: u64) -> Self {
        Self::Raw(RawFrame {
            data: Bytes::copy_from_slice(data),
            width,
            height,
            format,
            timestamp_us,
        })
    }

    pub fn unit(data: &[u8], timestamp_us: u64) -> Self {
        Self::Unit(EncodedUnit::new(data, timestamp_us))
    }

    pub fn config(key: ConfigKey, data: &[u8], timestamp_us: u64) -> Self {
        Self::Config {
            key,
            data: Bytes::copy_from_slice(data),
            timestamp_us,
        }
    }
}

/// A buffer produced by the audio pipeline.
#[derive(Debug, Clone)]
pub enum AudioBuffer {
    Unit(EncodedUnit),
    Config { data: Bytes, timestamp_us: u64 },
}

impl AudioBuffer {
    pub fn unit(data: &[u8], timestamp_us: u64) -> Self {
        Self::Unit(EncodedUnit::new(data, timestamp_us))
    }

    pub fn config(data: &[u8], timestamp_us: u64) -> Self {
        Self::Config {
            data: Bytes::copy_from_slice(data),
            timestamp_us,
        }
    }
}

/// Accessors shared by every buffer variant.
pub trait MediaBuffer {
    /// Capture time in monotonic microseconds (see [`timestamp_us`]).
    fn timestamp_us(&self) -> u64;
    fn payload(&self) -> &[u8];
    fn is_config(&self) -> bool;
}

impl MediaBuffer for RawFrame {
    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
    fn payload(&self) -> &[u8] {
        &self.data
    }
    fn is_config(&self) -> bool {
        false
    }
}

impl MediaBuffer for EncodedUnit {
    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
    fn payload(&self) -> &[u8] {
        &self.data
    }
    fn is_config(&self) -> bool {
        false
    }
}

impl MediaBuffer for VideoBuffer {
    fn timestamp_us(&self) -> u64 {
        match self {
            Self::Raw(f) => f.timestamp_us,
            Self::Unit(u) => u.timestamp_us,
            Self::Config { timestamp_us, .. } => *timestamp_us,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Raw(f) => &f.data,
            Self::Unit(u) => &u.data,
            Self::Config { data, .. } => data,
        }
    }

    fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

impl MediaBuffer for AudioBuffer {
    fn timestamp_us(&self) -> u64 {
        match self {
            Self::Unit(u) => u.timestamp_us,
            Self::Config { timestamp_us, .. } => *timestamp_us,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Unit(u) => &u.data,
            Self::Config { data, .. } => data,
        }
    }

    fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the first call in this process.
///
/// Producers should stamp buffers with this clock so RTP and RTCP
/// timestamps share one time base.
pub fn timestamp_us() -> u64 {
    let origin = CLOCK_ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_micros() as u64
}

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01.
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Current wall clock as a 64-bit NTP timestamp (RFC 1305): seconds in the
/// upper 32 bits, fraction in the lower 32.
pub fn ntp_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() + NTP_UNIX_OFFSET_SECS;
    let frac = ((now.subsec_micros() as u64) << 32) / 1_000_000;
    (secs << 32) | (frac & 0xFFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_copy_payload() {
        let mut source = vec![1u8, 2, 3];
        let buf = VideoBuffer::unit(&source, 42);
        source[0] = 9;
        assert_eq!(buf.payload(), &[1, 2, 3]);
        assert_eq!(buf.timestamp_us(), 42);
        assert!(!buf.is_config());
    }

    #[test]
    fn config_discriminant() {
        let v = VideoBuffer::config(ConfigKey::Sps, &[0x67], 0);
        let a = AudioBuffer::config(&[0x12, 0x10], 0);
        assert!(v.is_config());
        assert!(a.is_config());
        assert!(!AudioBuffer::unit(&[1], 0).is_config());
    }

    #[test]
    fn clock_is_monotonic() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(b >= a);
    }

    #[test]
    fn ntp_is_after_1970() {
        assert!(ntp_timestamp() >> 32 > NTP_UNIX_OFFSET_SECS);
    }
}
