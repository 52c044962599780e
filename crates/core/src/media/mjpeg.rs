//! JPEG compression of raw frames for the HTTP MJPEG stream.
//!
//! Frames arrive as NV21, YUYV, RGB24 or GRAY8 and are converted to
//! RGB (or kept as luma) before going through the `image` JPEG encoder.
//! Conversion uses the BT.601 limited-range matrix.

use image::ColorType;
use image::codecs::jpeg::JpegEncoder;

use super::{PixelFormat, RawFrame};
use crate::error::{Result, StreamError};

/// Multipart boundary of the `multipart/x-mixed-replace` response.
pub const BOUNDARY: &str = "jpegboundary";
pub const MIN_QUALITY: u8 = 10;
pub const MIN_FPS: f64 = 0.1;

/// Client-requested stream parameters, clamped to server bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MjpegParams {
    pub quality: u8,
    pub fps: f64,
}

impl MjpegParams {
    /// Build from the `quality` and `fps` query values. Missing or
    /// unparsable values fall back to the server maximum; out-of-range
    /// values are clamped, never rejected.
    pub fn from_query(
        quality: Option<&str>,
        fps: Option<&str>,
        max_quality: u8,
        max_fps: f64,
    ) -> Self {
        let max_quality = max_quality.clamp(MIN_QUALITY, 100);
        let max_fps = max_fps.max(MIN_FPS);

        let quality = quality
            .and_then(|q| q.trim().parse::<i64>().ok())
            .unwrap_or(max_quality as i64)
            .clamp(MIN_QUALITY as i64, max_quality as i64) as u8;
        let fps = fps
            .and_then(|f| f.trim().parse::<f64>().ok())
            .filter(|f| f.is_finite())
            .unwrap_or(max_fps)
            .clamp(MIN_FPS, max_fps);

        Self { quality, fps }
    }

    /// Minimum spacing between two emitted frames, in microseconds.
    pub fn frame_interval_us(&self) -> u64 {
        (1_000_000.0 / self.fps) as u64
    }
}

/// Compress a raw frame to a baseline JPEG.
pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Vec<u8>> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let pixels = w * h;
    let mut out = Vec::with_capacity(pixels / 4);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);

    match frame.format {
        PixelFormat::Gray8 => {
            let data = checked(&frame.data, pixels)?;
            encoder.encode(data, frame.width, frame.height, ColorType::L8)
        }
        PixelFormat::Rgb24 => {
            let data = checked(&frame.data, pixels * 3)?;
            encoder.encode(data, frame.width, frame.height, ColorType::Rgb8)
        }
        PixelFormat::Nv21 => {
            let data = checked(&frame.data, pixels + 2 * w.div_ceil(2) * h.div_ceil(2))?;
            let rgb = nv21_to_rgb(data, w, h);
            encoder.encode(&rgb, frame.width, frame.height, ColorType::Rgb8)
        }
        PixelFormat::Yuyv => {
            let data = checked(&frame.data, 2 * w.div_ceil(2) * h)?;
            let rgb = yuyv_to_rgb(data, w, h);
            encoder.encode(&rgb, frame.width, frame.height, ColorType::Rgb8)
        }
    }
    .map_err(|e| StreamError::Encode(e.to_string()))?;
    drop(encoder);
    Ok(out)
}

fn checked(data: &[u8], expected: usize) -> Result<&[u8]> {
    if expected == 0 || data.len() < expected {
        return Err(StreamError::Encode(format!(
            "frame holds {} bytes, {} expected",
            data.len(),
            expected
        )));
    }
    Ok(&data[..expected])
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

fn nv21_to_rgb(data: &[u8], w: usize, h: usize) -> Vec<u8> {
    let (luma, chroma) = data.split_at(w * h);
    let stride = 2 * w.div_ceil(2);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let y = luma[row * w + col];
            let c = (row / 2) * stride + (col / 2) * 2;
            // NV21 interleaves V before U
            let (v, u) = (chroma[c], chroma[c + 1]);
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

fn yuyv_to_rgb(data: &[u8], w: usize, h: usize) -> Vec<u8> {
    let stride = 2 * w.div_ceil(2);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let line = &data[row * stride..(row + 1) * stride];
        for col in 0..w {
            let pair = (col / 2) * 4;
            let y = line[pair + (col % 2) * 2];
            let (u, v) = (line[pair + 1], line[pair + 3]);
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(format: PixelFormat, w: u32, h: u32, data: Vec<u8>) -> RawFrame {
        RawFrame {
            data: Bytes::from(data),
            width: w,
            height: h,
            format,
            timestamp_us: 0,
        }
    }

    fn is_jpeg(bytes: &[u8]) -> bool {
        bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
    }

    #[test]
    fn quality_above_max_is_clamped() {
        let p = MjpegParams::from_query(Some("200"), None, 90, 10.0);
        assert_eq!(p.quality, 90);
        assert_eq!(p.fps, 10.0);
    }

    #[test]
    fn values_below_min_are_clamped() {
        let p = MjpegParams::from_query(Some("1"), Some("0.001"), 90, 10.0);
        assert_eq!(p.quality, MIN_QUALITY);
        assert_eq!(p.fps, MIN_FPS);
        let p = MjpegParams::from_query(Some("-5"), Some("-1"), 90, 10.0);
        assert_eq!(p.quality, MIN_QUALITY);
        assert_eq!(p.fps, MIN_FPS);
    }

    #[test]
    fn garbage_falls_back_to_max() {
        let p = MjpegParams::from_query(Some("high"), Some("NaN"), 80, 5.0);
        assert_eq!(p.quality, 80);
        assert_eq!(p.fps, 5.0);
        assert_eq!(p.frame_interval_us(), 200_000);
    }

    #[test]
    fn encodes_each_pixel_format() {
        let (w, h) = (16u32, 8u32);
        let n = (w * h) as usize;
        let frames = [
            frame(PixelFormat::Gray8, w, h, vec![128; n]),
            frame(PixelFormat::Rgb24, w, h, vec![200; n * 3]),
            frame(PixelFormat::Nv21, w, h, vec![100; n * 3 / 2]),
            frame(PixelFormat::Yuyv, w, h, vec![90; n * 2]),
        ];
        for f in &frames {
            let jpeg = encode_jpeg(f, 75).unwrap();
            assert!(is_jpeg(&jpeg), "{:?} did not produce a JPEG", f.format);
        }
    }

    #[test]
    fn short_frame_is_an_encode_error() {
        let f = frame(PixelFormat::Rgb24, 4, 4, vec![0; 10]);
        assert!(matches!(encode_jpeg(&f, 75), Err(StreamError::Encode(_))));
    }

    #[test]
    fn yuv_white_and_black() {
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
    }
}
