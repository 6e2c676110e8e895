//! Wire protocol between the controller and the injected agent.
//!
//! Every message is an [`Envelope`] serialized as JSON and prefixed with its
//! length as a little-endian `u32`, the same framing the named pipes use.

use crate::config::{CaptureConfig, Direct3DVersion};
use crate::overlay::{InputEvent, Overlay};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use uuid::Uuid;

/// Largest accepted frame. Byte payloads travel as base64, so a raw 4K BGRA
/// screenshot (about 33 MB) takes about 44 MB on the wire.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Serializes `Vec<u8>` as one base64 string instead of a JSON number array.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge { size: usize },
    #[error("connection closed")]
    Closed,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// An empty rectangle selects the whole frame.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Bitmap,
    Jpeg,
    Png,
    PixelData,
}

/// Memory layout of a readback buffer, named by byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgra8,
    Bgrx8,
    Rgba8,
    /// 10-bit red in the low bits, 2-bit alpha in the high bits.
    Rgb10A2,
    B5G6R5,
    B5G5R5A1,
    Rgba16F,
    Unknown(u32),
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Bgrx8 | PixelFormat::Rgba8 | PixelFormat::Rgb10A2 => Some(4),
            PixelFormat::B5G6R5 | PixelFormat::B5G5R5A1 => Some(2),
            PixelFormat::Rgba16F => Some(8),
            PixelFormat::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotRequest {
    pub request_id: RequestId,
    /// `None` or an empty rectangle captures the full frame.
    pub region: Option<Rect>,
    pub resize: Option<Size>,
    pub format: ImageFormat,
}

impl ScreenshotRequest {
    pub fn new(region: Option<Rect>, resize: Option<Size>, format: ImageFormat) -> Self {
        Self {
            request_id: RequestId::new(),
            region,
            resize,
            format,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenshotData {
    Encoded(#[serde(with = "base64_bytes")] Vec<u8>),
    Raw {
        width: u32,
        height: u32,
        stride: u32,
        pixel_format: PixelFormat,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub request_id: RequestId,
    pub format: ImageFormat,
    pub data: ScreenshotData,
}

impl Screenshot {
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            ScreenshotData::Encoded(bytes) => bytes,
            ScreenshotData::Raw { data, .. } => data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSeverity {
    Information,
    Warning,
    Error,
    Debug,
}

impl MessageSeverity {
    pub fn label(&self) -> &'static str {
        match self {
            MessageSeverity::Information => "INFO",
            MessageSeverity::Warning => "WARN",
            MessageSeverity::Error => "ERROR",
            MessageSeverity::Debug => "DEBUG",
        }
    }
}

/// Events fired by the controller and handled inside the target process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    RecordingStarted(CaptureConfig),
    RecordingStopped,
    ScreenshotRequested(ScreenshotRequest),
    Disconnected,
    DisplayText { text: String, duration_ms: u64 },
    DrawOverlay(Option<Overlay>),
    Input(InputEvent),
}

/// Events raised by the agent and delivered to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    RemoteMessage { severity: MessageSeverity, text: String },
    ScreenshotReceived(Screenshot),
    Connected { pid: u32, direct3d_version: Direct3DVersion },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// First frame sent by the agent after it joins the channel.
    Hello { pid: u32, version: String },
    /// Reply to `Hello` carrying the capture configuration.
    Welcome(CaptureConfig),
    Ping { seq: u64 },
    Pong { seq: u64, time: chrono::DateTime<chrono::Utc> },
    Controller(ControllerEvent),
    Agent(AgentEvent),
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: body.len() });
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Envelope, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
