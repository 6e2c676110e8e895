//! Direct3D 9/10/11 backends: vtable hooks that drive the shared frame step.

pub mod d3d10;
pub mod d3d11;
pub mod d3d9;
pub mod dxgi;

use crate::context::BackendContext;
use crate::entry::{Backend, BackendFactory};
use framehook_core::protocol::PixelFormat;
use framehook_core::{CaptureError, Direct3DVersion};
use parking_lot::Mutex;
use std::sync::Arc;
use windows::Win32::Graphics::Dxgi::Common::*;

pub struct D3DBackendFactory;

impl BackendFactory for D3DBackendFactory {
    fn create(&self, version: Direct3DVersion, context: Arc<BackendContext>) -> Result<Box<dyn Backend>, CaptureError> {
        match version {
            Direct3DVersion::Direct3D9 => Ok(Box::new(d3d9::D3D9Backend::new(context))),
            Direct3DVersion::Direct3D10 | Direct3DVersion::Direct3D10_1 => {
                Ok(Box::new(d3d10::D3D10Backend::new(context, version)))
            }
            Direct3DVersion::Direct3D11 | Direct3DVersion::Direct3D11_1 => {
                Ok(Box::new(d3d11::D3D11Backend::new(context, version)))
            }
            Direct3DVersion::AutoDetect | Direct3DVersion::Unknown => Err(CaptureError::Configuration(
                "a concrete Direct3D version is required to build a backend".into(),
            )),
        }
    }
}

/// COM pointer moved to the readback worker. The device is put in
/// multithread-protected mode (10/11) or the object is CPU-only (9).
pub(crate) struct SendCom<T>(pub T);

unsafe impl<T> Send for SendCom<T> {}

/// One reusable CPU-readable copy target shared by the render thread and the worker.
pub(crate) struct StagingPool<T> {
    slot: Arc<Mutex<Option<SendCom<T>>>>,
}

impl<T> Clone for StagingPool<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> StagingPool<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Takes the pooled resource if it still fits. A busy or mismatched pool yields `None`.
    pub(crate) fn take_matching(&self, fits: impl Fn(&T) -> bool) -> Option<T> {
        let mut slot = self.slot.lock();
        match slot.take() {
            Some(SendCom(item)) if fits(&item) => Some(item),
            _ => None,
        }
    }

    pub(crate) fn put(&self, item: T) {
        *self.slot.lock() = Some(SendCom(item));
    }

    pub(crate) fn clear(&self) {
        self.slot.lock().take();
    }
}

pub(crate) fn pixel_format_from_dxgi(format: DXGI_FORMAT) -> PixelFormat {
    match format {
        DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => PixelFormat::Bgra8,
        DXGI_FORMAT_B8G8R8X8_UNORM | DXGI_FORMAT_B8G8R8X8_UNORM_SRGB => PixelFormat::Bgrx8,
        DXGI_FORMAT_R8G8B8A8_UNORM | DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => PixelFormat::Rgba8,
        DXGI_FORMAT_R10G10B10A2_UNORM => PixelFormat::Rgb10A2,
        DXGI_FORMAT_B5G6R5_UNORM => PixelFormat::B5G6R5,
        DXGI_FORMAT_B5G5R5A1_UNORM => PixelFormat::B5G5R5A1,
        DXGI_FORMAT_R16G16B16A16_FLOAT => PixelFormat::Rgba16F,
        other => PixelFormat::Unknown(other.0 as u32),
    }
}

/// Concrete format for a possibly typeless backbuffer. Staging copies and
/// render target views both need one.
pub(crate) fn typed_format(format: DXGI_FORMAT) -> DXGI_FORMAT {
    match format {
        DXGI_FORMAT_R8G8B8A8_TYPELESS => DXGI_FORMAT_R8G8B8A8_UNORM,
        DXGI_FORMAT_B8G8R8A8_TYPELESS => DXGI_FORMAT_B8G8R8A8_UNORM,
        DXGI_FORMAT_R10G10B10A2_TYPELESS => DXGI_FORMAT_R10G10B10A2_UNORM,
        other => other,
    }
}
