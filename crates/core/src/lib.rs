pub mod bus;
pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod hook;
pub mod logger;
pub mod overlay;
pub mod protocol;

pub use bus::EventBus;
pub use channel::{MemoryTransport, Transport};
pub use config::{AgentSettings, AppConfig, CaptureConfig, Config, Direct3DVersion};
pub use error::{CaptureError, CaptureResult};
pub use overlay::{Element, Overlay};
pub use protocol::{
    AgentEvent, ControllerEvent, Envelope, ImageFormat, MessageSeverity, PixelFormat, Rect, RequestId, Screenshot,
    ScreenshotData, ScreenshotRequest, Size,
};

#[cfg(windows)]
pub use channel::{PipeListener, PipeTransport};

/// Version string exchanged in the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
