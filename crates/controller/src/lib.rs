//! FrameHook controller: attaches the agent to a Direct3D process and drives
//! captures, text and overlays over the agent channel.

pub mod remote;
pub mod server;
pub mod session;

#[cfg(windows)]
pub mod injector;
#[cfg(windows)]
pub mod pipes;
#[cfg(windows)]
pub mod process;
#[cfg(windows)]
pub mod window;

pub use remote::{CaptureInterface, RemoteMessage, ScreenshotHandle};
pub use server::PipeServer;
pub use session::{
    ChannelHost, ChannelListener, Injector, ProcessWatch, Session, SessionHost, SessionManager, SessionOptions, Target,
    WindowControl,
};

/// Named pipes, user32 focus and process-handle exit watch.
#[cfg(windows)]
pub fn desktop_host() -> SessionHost {
    use std::sync::Arc;
    SessionHost {
        channels: Arc::new(pipes::PipeChannels),
        windows: Arc::new(window::DesktopWindows),
        processes: Arc::new(process::ProcessExitWatch),
    }
}
