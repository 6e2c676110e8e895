//! Per-frame capture state shared by every backend: the pending request slot,
//! region policy, pixel conversion and encoding.

use crate::error::CaptureError;
use crate::protocol::{ImageFormat, PixelFormat, Rect, Screenshot, ScreenshotData, ScreenshotRequest, Size};
use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub const JPEG_QUALITY: u8 = 90;

/// Holds at most one outstanding screenshot request.
#[derive(Default)]
pub struct PendingRequest {
    slot: Mutex<Option<ScreenshotRequest>>,
}

impl PendingRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `request`, returning the one it replaced.
    pub fn set(&self, request: ScreenshotRequest) -> Option<ScreenshotRequest> {
        self.slot.lock().replace(request)
    }

    /// Clears the slot as the capture begins, so a request is served at most once.
    pub fn take(&self) -> Option<ScreenshotRequest> {
        self.slot.lock().take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    RequestPending,
    Capturing,
    Encoding,
    Delivered,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub requested: u64,
    pub captured: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Tracks the most recent phase of the capture pipeline plus running totals.
pub struct CaptureState {
    inner: Mutex<(CapturePhase, CaptureStats)>,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((CapturePhase::Idle, CaptureStats::default())),
        }
    }

    pub fn advance(&self, phase: CapturePhase) {
        let mut inner = self.inner.lock();
        match phase {
            CapturePhase::RequestPending => inner.1.requested += 1,
            CapturePhase::Capturing => inner.1.captured += 1,
            CapturePhase::Delivered => inner.1.delivered += 1,
            CapturePhase::Dropped => inner.1.dropped += 1,
            CapturePhase::Idle | CapturePhase::Encoding => {}
        }
        // Terminal phases fall straight back to Idle
        inner.0 = match phase {
            CapturePhase::Delivered | CapturePhase::Dropped => CapturePhase::Idle,
            other => other,
        };
    }

    pub fn phase(&self) -> CapturePhase {
        self.inner.lock().0
    }

    pub fn stats(&self) -> CaptureStats {
        self.inner.lock().1
    }
}

/// Intersects the requested region with the backbuffer. `None` or an empty
/// request selects the whole frame; an empty intersection yields `None`.
pub fn resolve_region(region: Option<Rect>, bounds: Size) -> Option<Rect> {
    if bounds.is_empty() {
        return None;
    }
    let full = Rect::new(0, 0, bounds.width, bounds.height);
    let region = match region {
        Some(r) if !r.is_empty() => r,
        _ => return Some(full),
    };

    let left = (region.x as i64).max(0);
    let top = (region.y as i64).max(0);
    let right = region.right().min(bounds.width as i64);
    let bottom = region.bottom().min(bounds.height as i64);

    if right <= left || bottom <= top {
        return None;
    }
    Some(Rect::new(left as i32, top as i32, (right - left) as u32, (bottom - top) as u32))
}

/// Target size of the GPU blit, if the request asks for a usable one.
pub fn resolve_resize(resize: Option<Size>) -> Option<Size> {
    resize.filter(|s| !s.is_empty())
}

/// CPU copy of a mapped staging resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReadback {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

impl FrameReadback {
    /// Copies `height` rows of `row_bytes` from a mapped pointer with `pitch`.
    ///
    /// # Safety
    /// `src` must be valid for `pitch * height` bytes.
    pub unsafe fn from_mapped(
        src: *const u8,
        pitch: usize,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    ) -> Result<Self, CaptureError> {
        let bpp = pixel_format
            .bytes_per_pixel()
            .ok_or_else(|| CaptureError::Encode(format!("unsupported pixel format {:?}", pixel_format)))?;
        let row_bytes = width as usize * bpp;
        if pitch < row_bytes {
            return Err(CaptureError::Encode(format!("row pitch {} below row size {}", pitch, row_bytes)));
        }

        let mut data = vec![0u8; row_bytes * height as usize];
        for y in 0..height as usize {
            std::ptr::copy_nonoverlapping(src.add(y * pitch), data.as_mut_ptr().add(y * row_bytes), row_bytes);
        }

        Ok(Self {
            width,
            height,
            stride: row_bytes as u32,
            pixel_format,
            data,
        })
    }
}

fn expand5(v: u16) -> u8 {
    let v = (v & 0x1f) as u8;
    (v << 3) | (v >> 2)
}

fn expand6(v: u16) -> u8 {
    let v = (v & 0x3f) as u8;
    (v << 2) | (v >> 4)
}

/// Converts any supported layout to tightly packed RGBA8.
pub fn convert_to_rgba8(frame: &FrameReadback) -> Result<Vec<u8>, CaptureError> {
    let bpp = frame
        .pixel_format
        .bytes_per_pixel()
        .ok_or_else(|| CaptureError::Encode(format!("unsupported pixel format {:?}", frame.pixel_format)))?;
    let (width, height, stride) = (frame.width as usize, frame.height as usize, frame.stride as usize);
    if height > 0 && frame.data.len() < stride * (height - 1) + width * bpp {
        return Err(CaptureError::Encode("readback buffer shorter than its dimensions".into()));
    }

    let mut out = Vec::with_capacity(width * height * 4);
    for y in 0..height {
        let row = &frame.data[y * stride..y * stride + width * bpp];
        match frame.pixel_format {
            PixelFormat::Rgba8 => out.extend_from_slice(row),
            PixelFormat::Bgra8 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
            PixelFormat::Bgrx8 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0], 255]);
                }
            }
            PixelFormat::Rgb10A2 => {
                for px in row.chunks_exact(4) {
                    let v = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                    out.extend_from_slice(&[
                        ((v & 0x3ff) >> 2) as u8,
                        (((v >> 10) & 0x3ff) >> 2) as u8,
                        (((v >> 20) & 0x3ff) >> 2) as u8,
                        ((v >> 30) * 85) as u8,
                    ]);
                }
            }
            PixelFormat::B5G6R5 => {
                for px in row.chunks_exact(2) {
                    let v = u16::from_le_bytes([px[0], px[1]]);
                    out.extend_from_slice(&[expand5(v >> 11), expand6(v >> 5), expand5(v), 255]);
                }
            }
            PixelFormat::B5G5R5A1 => {
                for px in row.chunks_exact(2) {
                    let v = u16::from_le_bytes([px[0], px[1]]);
                    let a = if v & 0x8000 != 0 { 255 } else { 0 };
                    out.extend_from_slice(&[expand5(v >> 10), expand5(v >> 5), expand5(v), a]);
                }
            }
            PixelFormat::Rgba16F | PixelFormat::Unknown(_) => {
                return Err(CaptureError::Encode(format!(
                    "cannot convert {:?} to RGBA8",
                    frame.pixel_format
                )))
            }
        }
    }
    Ok(out)
}

fn encode_error(e: image::ImageError) -> CaptureError {
    CaptureError::Encode(e.to_string())
}

fn encode_image(format: ImageFormat, frame: &FrameReadback) -> Result<Vec<u8>, CaptureError> {
    let rgba = convert_to_rgba8(frame)?;
    let (w, h) = (frame.width, frame.height);
    let mut buf = Vec::new();
    match format {
        ImageFormat::Png => PngEncoder::new(&mut buf)
            .write_image(&rgba, w, h, ExtendedColorType::Rgba8)
            .map_err(encode_error)?,
        ImageFormat::Bitmap => BmpEncoder::new(&mut buf)
            .write_image(&rgba, w, h, ExtendedColorType::Rgba8)
            .map_err(encode_error)?,
        ImageFormat::Jpeg => {
            // JPEG carries no alpha channel
            let rgb: Vec<u8> = rgba.chunks_exact(4).flat_map(|px| [px[0], px[1], px[2]]).collect();
            JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
                .write_image(&rgb, w, h, ExtendedColorType::Rgb8)
                .map_err(encode_error)?
        }
        ImageFormat::PixelData => return Err(CaptureError::Encode("raw pixel data is not an image container".into())),
    }
    Ok(buf)
}

/// Turns a readback into the screenshot the request asked for.
pub fn encode(request: &ScreenshotRequest, frame: FrameReadback) -> Result<Screenshot, CaptureError> {
    let data = match request.format {
        ImageFormat::PixelData => ScreenshotData::Raw {
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            pixel_format: frame.pixel_format,
            data: frame.data,
        },
        format => ScreenshotData::Encoded(encode_image(format, &frame)?),
    };

    Ok(Screenshot {
        request_id: request.request_id,
        format: request.format,
        data,
    })
}

/// Scales a readback on the CPU for APIs without a GPU stretch blit.
/// The result is always tightly packed RGBA8.
pub fn resize_readback(frame: FrameReadback, size: Size) -> Result<FrameReadback, CaptureError> {
    if size.is_empty() || (frame.width, frame.height) == (size.width, size.height) {
        return Ok(frame);
    }
    let rgba = convert_to_rgba8(&frame)?;
    let image = image::RgbaImage::from_raw(frame.width, frame.height, rgba)
        .ok_or_else(|| CaptureError::Encode("readback does not match its dimensions".into()))?;
    let resized = image::imageops::resize(&image, size.width, size.height, image::imageops::FilterType::Triangle);
    Ok(FrameReadback {
        width: size.width,
        height: size.height,
        stride: size.width * 4,
        pixel_format: PixelFormat::Rgba8,
        data: resized.into_raw(),
    })
}

/// Frame rate over a rolling window of at least one second.
pub struct FramesPerSecond {
    window_start: Option<Instant>,
    frames: u32,
    fps: f32,
}

impl Default for FramesPerSecond {
    fn default() -> Self {
        Self::new()
    }
}

impl FramesPerSecond {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            window_start: None,
            frames: 0,
            fps: 0.0,
        }
    }

    pub fn frame(&mut self) {
        self.frame_at(Instant::now());
    }

    pub fn frame_at(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;

        let elapsed = now.duration_since(start);
        if elapsed >= Self::WINDOW {
            self.fps = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = Some(now);
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

/// Text shown in-game for a fixed duration.
#[derive(Debug, Clone)]
pub struct TextDisplay {
    pub text: String,
    expires_at: Instant,
}

impl TextDisplay {
    pub fn new(text: impl Into<String>, duration: Duration) -> Self {
        Self::starting_at(text, duration, Instant::now())
    }

    pub fn starting_at(text: impl Into<String>, duration: Duration, now: Instant) -> Self {
        Self {
            text: text.into(),
            expires_at: now + duration,
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn is_visible(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra_frame(width: u32, height: u32, stride: u32) -> FrameReadback {
        let mut data = vec![0u8; (stride * height) as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let i = y * stride as usize + x * 4;
                data[i..i + 4].copy_from_slice(&[10, 20, 30, 40]);
            }
        }
        FrameReadback {
            width,
            height,
            stride,
            pixel_format: PixelFormat::Bgra8,
            data,
        }
    }

    #[test]
    fn pending_request_is_served_once() {
        let pending = PendingRequest::new();
        let first = ScreenshotRequest::new(None, None, ImageFormat::Png);
        let second = ScreenshotRequest::new(None, None, ImageFormat::Png);

        assert!(pending.set(first.clone()).is_none());
        assert_eq!(pending.set(second.clone()), Some(first));
        assert_eq!(pending.take(), Some(second));
        assert!(pending.take().is_none());
    }

    #[test]
    fn region_is_clamped_to_backbuffer() {
        let bounds = Size::new(800, 600);
        assert_eq!(resolve_region(None, bounds), Some(Rect::new(0, 0, 800, 600)));
        assert_eq!(resolve_region(Some(Rect::default()), bounds), Some(Rect::new(0, 0, 800, 600)));
        assert_eq!(
            resolve_region(Some(Rect::new(0, 0, 100, 100)), bounds),
            Some(Rect::new(0, 0, 100, 100))
        );
        assert_eq!(
            resolve_region(Some(Rect::new(-50, 550, 100, 100)), bounds),
            Some(Rect::new(0, 550, 50, 50))
        );
        assert_eq!(resolve_region(Some(Rect::new(900, 0, 10, 10)), bounds), None);
    }

    #[test]
    fn zero_sized_resize_is_ignored() {
        assert_eq!(resolve_resize(Some(Size::new(0, 150))), None);
        assert_eq!(resolve_resize(Some(Size::new(200, 150))), Some(Size::new(200, 150)));
    }

    #[test]
    fn bgra_rows_with_padding_convert() {
        let rgba = convert_to_rgba8(&bgra_frame(2, 2, 12)).unwrap();
        assert_eq!(rgba.len(), 16);
        assert_eq!(&rgba[..4], &[30, 20, 10, 40]);
    }

    #[test]
    fn packed_formats_expand_to_full_range() {
        let white565 = FrameReadback {
            width: 1,
            height: 1,
            stride: 2,
            pixel_format: PixelFormat::B5G6R5,
            data: 0xffffu16.to_le_bytes().to_vec(),
        };
        assert_eq!(convert_to_rgba8(&white565).unwrap(), vec![255, 255, 255, 255]);

        let red1010102 = FrameReadback {
            width: 1,
            height: 1,
            stride: 4,
            pixel_format: PixelFormat::Rgb10A2,
            data: (0x3ffu32 | 3 << 30).to_le_bytes().to_vec(),
        };
        assert_eq!(convert_to_rgba8(&red1010102).unwrap(), vec![255, 0, 0, 255]);
    }

    #[test]
    fn png_request_decodes_to_requested_size() {
        let request = ScreenshotRequest::new(None, None, ImageFormat::Png);
        let shot = encode(&request, bgra_frame(100, 100, 400)).unwrap();
        assert_eq!(shot.request_id, request.request_id);

        let decoded = image::load_from_memory(shot.bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 100));
    }

    #[test]
    fn jpeg_and_bitmap_encode() {
        for format in [ImageFormat::Jpeg, ImageFormat::Bitmap] {
            let request = ScreenshotRequest::new(None, None, format);
            let shot = encode(&request, bgra_frame(8, 8, 32)).unwrap();
            let decoded = image::load_from_memory(shot.bytes()).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (8, 8));
        }
    }

    #[test]
    fn pixel_data_is_passed_through() {
        let request = ScreenshotRequest::new(None, None, ImageFormat::PixelData);
        let frame = bgra_frame(4, 2, 16);
        let shot = encode(&request, frame.clone()).unwrap();
        match shot.data {
            ScreenshotData::Raw {
                width,
                height,
                stride,
                pixel_format,
                data,
            } => {
                assert_eq!((width, height, stride), (4, 2, 16));
                assert_eq!(pixel_format, PixelFormat::Bgra8);
                assert_eq!(data, frame.data);
            }
            other => panic!("expected raw data, got {:?}", other),
        }
    }

    #[test]
    fn float_formats_are_rejected_for_encoding() {
        let request = ScreenshotRequest::new(None, None, ImageFormat::Png);
        let frame = FrameReadback {
            width: 1,
            height: 1,
            stride: 8,
            pixel_format: PixelFormat::Rgba16F,
            data: vec![0; 8],
        };
        assert!(matches!(encode(&request, frame), Err(CaptureError::Encode(_))));
    }

    #[test]
    fn fps_counts_over_one_second() {
        let start = Instant::now();
        let mut fps = FramesPerSecond::new();
        for i in 0..=60u64 {
            fps.frame_at(start + Duration::from_micros(i * 1_000_000 / 60));
        }
        assert!((fps.fps() - 61.0).abs() < 1.0);
    }

    #[test]
    fn text_display_expires() {
        let now = Instant::now();
        let display = TextDisplay::starting_at("saved", Duration::from_secs(2), now);
        assert!(display.is_visible(now + Duration::from_secs(1)));
        assert!(!display.is_visible(now + Duration::from_secs(2)));
        assert_eq!(display.remaining(now + Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn state_counts_outcomes() {
        let state = CaptureState::new();
        state.advance(CapturePhase::RequestPending);
        state.advance(CapturePhase::Capturing);
        state.advance(CapturePhase::Encoding);
        assert_eq!(state.phase(), CapturePhase::Encoding);
        state.advance(CapturePhase::Delivered);
        assert_eq!(state.phase(), CapturePhase::Idle);
        assert_eq!(state.stats().delivered, 1);
    }

    #[test]
    fn cpu_resize_produces_requested_size() {
        let frame = bgra_frame(8, 4, 32);
        let resized = resize_readback(frame.clone(), Size::new(4, 2)).unwrap();
        assert_eq!((resized.width, resized.height, resized.stride), (4, 2, 16));
        assert_eq!(resized.pixel_format, PixelFormat::Rgba8);
        assert_eq!(&resized.data[..4], &[30, 20, 10, 40]);

        let same = resize_readback(frame.clone(), Size::new(8, 4)).unwrap();
        assert_eq!(same, frame);
    }
}
