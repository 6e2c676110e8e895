use crate::protocol::ProtocolError;
use thiserror::Error;

/// Failures callers need to tell apart.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("injection failed: {0}")]
    InjectionFailure(String),
    #[error("process {0} is already hooked")]
    AlreadyHooked(u32),
    #[error("process {0} has no window handle")]
    NoWindowHandle(u32),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;
