//! Swap chain hooks shared by the Direct3D 10 and 11 backends.
//!
//! Both APIs present through the same `IDXGISwapChain` vtable, so one set of
//! detours serves either. What differs per API sits behind [`DxgiApi`].

use super::{typed_format, SendCom, StagingPool};
use crate::context::{BackendContext, FrameTarget};
use crate::entry::Backend;
use crate::overlay::{OverlayFrame, TargetSignature};
use crate::patch::VTableSlot;
use crate::readback::ReadbackSource;
use crate::vtable::{slots, SwapChainAddresses};
use anyhow::{anyhow, Result};
use framehook_core::capture::{resize_readback, FrameReadback};
use framehook_core::hook::{Hook, HookGate, HookSet};
use framehook_core::protocol::{Rect, Size};
use framehook_core::{log_debug, log_info, Direct3DVersion};
use parking_lot::{const_rwlock, Mutex, RwLock};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use windows::core::{Interface, HRESULT};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_MODE_DESC};
use windows::Win32::Graphics::Dxgi::{IDXGISwapChain, DXGI_PRESENT_TEST};

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;
type ResizeTargetFn = unsafe extern "system" fn(*mut c_void, *const DXGI_MODE_DESC) -> HRESULT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: DXGI_FORMAT,
    pub samples: u32,
}

/// The per-API half of a DXGI backend.
pub trait DxgiApi: Sized + 'static {
    const NAME: &'static str;

    /// The device and whatever context it copies through.
    type Device: Clone + 'static;
    type Texture: Interface + Clone + 'static;
    type Query: 'static;
    type Compositor;

    fn hooks() -> &'static DxgiHooks<Self>;

    fn method_table() -> Result<SwapChainAddresses>;

    /// Fails for a swap chain owned by another API's device.
    fn open(swap_chain: &IDXGISwapChain) -> Result<Self::Device>;

    fn compositor(device: &Self::Device) -> Self::Compositor;

    fn invalidate(compositor: &mut Self::Compositor);

    fn draw_overlay(
        compositor: &mut Self::Compositor,
        frame: &OverlayFrame,
        backbuffer: &Self::Texture,
        signature: TargetSignature,
    ) -> Result<()>;

    fn describe(texture: &Self::Texture) -> TextureInfo;

    /// Single-sample texture of `info`'s size and format, GPU-only or CPU-readable.
    fn create_texture(device: &Self::Device, info: TextureInfo, staging: bool) -> Result<Self::Texture>;

    fn resolve(device: &Self::Device, target: &Self::Texture, source: &Self::Texture, format: DXGI_FORMAT);

    /// Copies `region` of `source` to the origin of `staging` and returns a
    /// query that signals once the copy has executed.
    fn copy_region(
        device: &Self::Device,
        staging: &Self::Texture,
        source: &Self::Texture,
        region: Rect,
    ) -> Result<Self::Query>;

    fn query_done(device: &Self::Device, query: &Self::Query) -> bool;

    fn map_read(device: &Self::Device, texture: &Self::Texture, width: u32, height: u32, format: DXGI_FORMAT)
        -> Result<FrameReadback>;
}

/// Trampolines and the live runtime of one API. Lives in a per-API static.
pub struct DxgiHooks<A: DxgiApi> {
    present: AtomicUsize,
    resize_target: AtomicUsize,
    runtime: RwLock<Option<Arc<Runtime<A>>>>,
}

impl<A: DxgiApi> DxgiHooks<A> {
    pub const fn new() -> Self {
        Self {
            present: AtomicUsize::new(0),
            resize_target: AtomicUsize::new(0),
            runtime: const_rwlock(None),
        }
    }
}

enum Binding<A: DxgiApi> {
    Ready(DeviceState<A>),
    /// A swap chain whose device belongs to the other API.
    Foreign(usize),
}

struct Runtime<A: DxgiApi> {
    context: Arc<BackendContext>,
    gate: Arc<HookGate>,
    binding: Mutex<Option<Binding<A>>>,
}

struct DeviceState<A: DxgiApi> {
    identity: usize,
    device: A::Device,
    compositor: A::Compositor,
    resolved: Option<A::Texture>,
    pool: StagingPool<A::Texture>,
}

// Only touched by the render thread under the runtime mutex, or by `release`.
unsafe impl<A: DxgiApi> Send for DeviceState<A> {}

impl<A: DxgiApi> DeviceState<A> {
    fn bind(swap_chain: &IDXGISwapChain) -> Result<Self> {
        let device = A::open(swap_chain)?;
        log_info!("Bound {} swap chain {:#x}", A::NAME, swap_chain.as_raw() as usize);
        Ok(Self {
            identity: swap_chain.as_raw() as usize,
            compositor: A::compositor(&device),
            device,
            resolved: None,
            pool: StagingPool::new(),
        })
    }
}

impl<A: DxgiApi> Runtime<A> {
    fn new(context: Arc<BackendContext>, gate: Arc<HookGate>) -> Self {
        Self {
            context,
            gate,
            binding: Mutex::new(None),
        }
    }

    fn on_present(&self, swap_chain: &IDXGISwapChain) {
        let identity = swap_chain.as_raw() as usize;
        let mut binding = self.binding.lock();

        let stale = match binding.as_ref() {
            Some(Binding::Ready(state)) => state.identity != identity,
            Some(Binding::Foreign(foreign)) => *foreign != identity,
            None => true,
        };
        if stale {
            *binding = Some(match DeviceState::bind(swap_chain) {
                Ok(state) => Binding::Ready(state),
                Err(e) => {
                    log_debug!("Ignoring swap chain {:#x}: {:#}", identity, e);
                    Binding::Foreign(identity)
                }
            });
        }

        if let Some(Binding::Ready(state)) = binding.as_mut() {
            let mut target = DxgiTarget { swap_chain, state };
            self.context.frame_step(&mut target);
        }
    }

    fn invalidate(&self) {
        if let Some(Binding::Ready(state)) = self.binding.lock().as_mut() {
            A::invalidate(&mut state.compositor);
            state.resolved = None;
            state.pool.clear();
        }
    }

    #[cfg(test)]
    fn is_bound(&self) -> bool {
        matches!(*self.binding.lock(), Some(Binding::Ready(_)))
    }
}

struct DxgiTarget<'a, A: DxgiApi> {
    swap_chain: &'a IDXGISwapChain,
    state: &'a mut DeviceState<A>,
}

impl<A: DxgiApi> DxgiTarget<'_, A> {
    fn backbuffer(&self) -> Result<(A::Texture, TextureInfo)> {
        let backbuffer: A::Texture = unsafe { self.swap_chain.GetBuffer(0) }?;
        let info = A::describe(&backbuffer);
        Ok((backbuffer, info))
    }

    /// Multisampled backbuffers are resolved into a cached single-sample copy first.
    fn resolve(&mut self, backbuffer: A::Texture, info: TextureInfo) -> Result<A::Texture> {
        if info.samples <= 1 {
            return Ok(backbuffer);
        }
        let wanted = TextureInfo {
            format: typed_format(info.format),
            samples: 1,
            ..info
        };
        let fits = self.state.resolved.as_ref().is_some_and(|t| A::describe(t) == wanted);
        if !fits {
            self.state.resolved = Some(A::create_texture(&self.state.device, wanted, false)?);
        }
        let resolved = self.state.resolved.clone().ok_or_else(|| anyhow!("resolve texture missing"))?;
        A::resolve(&self.state.device, &resolved, &backbuffer, wanted.format);
        Ok(resolved)
    }

    fn staging(&self, info: TextureInfo) -> Result<A::Texture> {
        if let Some(texture) = self.state.pool.take_matching(|t| A::describe(t) == info) {
            return Ok(texture);
        }
        A::create_texture(&self.state.device, info, true)
    }
}

impl<A: DxgiApi> FrameTarget for DxgiTarget<'_, A> {
    fn backbuffer_size(&self) -> Result<Size> {
        let (_, info) = self.backbuffer()?;
        Ok(Size::new(info.width, info.height))
    }

    fn capture(&mut self, region: Rect, resize: Option<Size>) -> Result<Box<dyn ReadbackSource>> {
        let (backbuffer, info) = self.backbuffer()?;
        let source = self.resolve(backbuffer, info)?;
        let format = typed_format(info.format);
        let staging = self.staging(TextureInfo {
            width: region.width,
            height: region.height,
            format,
            samples: 1,
        })?;
        let query = A::copy_region(&self.state.device, &staging, &source, region)?;

        Ok(Box::new(DxgiReadback::<A> {
            device: SendCom(self.state.device.clone()),
            texture: Some(SendCom(staging)),
            query: SendCom(query),
            pool: self.state.pool.clone(),
            width: region.width,
            height: region.height,
            format,
            resize,
        }))
    }

    fn draw_overlay(&mut self, frame: &OverlayFrame) -> Result<()> {
        let (backbuffer, info) = self.backbuffer()?;
        let signature = TargetSignature {
            identity: self.state.identity,
            size: Size::new(info.width, info.height),
            version: frame.version,
        };
        A::draw_overlay(&mut self.state.compositor, frame, &backbuffer, signature)
    }
}

struct DxgiReadback<A: DxgiApi> {
    device: SendCom<A::Device>,
    texture: Option<SendCom<A::Texture>>,
    query: SendCom<A::Query>,
    pool: StagingPool<A::Texture>,
    width: u32,
    height: u32,
    format: DXGI_FORMAT,
    resize: Option<Size>,
}

impl<A: DxgiApi> ReadbackSource for DxgiReadback<A> {
    fn is_ready(&mut self) -> Result<bool> {
        Ok(A::query_done(&self.device.0, &self.query.0))
    }

    fn read(mut self: Box<Self>) -> Result<FrameReadback> {
        let SendCom(texture) = self.texture.take().ok_or_else(|| anyhow!("staging texture already read"))?;
        let frame = A::map_read(&self.device.0, &texture, self.width, self.height, self.format);
        self.pool.put(texture);
        let frame = frame?;
        Ok(match self.resize {
            Some(size) => resize_readback(frame, size)?,
            None => frame,
        })
    }
}

unsafe extern "system" fn present<A: DxgiApi>(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let hooks = A::hooks();
    let original: PresentFn = std::mem::transmute(hooks.present.load(Ordering::Acquire));
    if flags & DXGI_PRESENT_TEST.0 == 0 {
        let runtime = hooks.runtime.read().clone();
        if let Some(runtime) = runtime {
            if let Some(_guard) = runtime.gate.enter() {
                if let Some(swap_chain) = IDXGISwapChain::from_raw_borrowed(&this) {
                    runtime.on_present(swap_chain);
                }
            }
        }
    }
    original(this, sync_interval, flags)
}

unsafe extern "system" fn resize_target<A: DxgiApi>(this: *mut c_void, params: *const DXGI_MODE_DESC) -> HRESULT {
    let hooks = A::hooks();
    let original: ResizeTargetFn = std::mem::transmute(hooks.resize_target.load(Ordering::Acquire));
    let runtime = hooks.runtime.read().clone();
    if let Some(runtime) = runtime {
        if let Some(_guard) = runtime.gate.enter() {
            runtime.invalidate();
        }
    }
    original(this, params)
}

pub struct DxgiBackend<A: DxgiApi> {
    version: Direct3DVersion,
    context: Arc<BackendContext>,
    gate: Arc<HookGate>,
    hooks: HookSet<VTableSlot>,
    hooked: bool,
    api: PhantomData<fn() -> A>,
}

impl<A: DxgiApi> DxgiBackend<A> {
    pub fn new(context: Arc<BackendContext>, version: Direct3DVersion) -> Self {
        Self {
            version,
            context,
            gate: Arc::new(HookGate::new()),
            hooks: HookSet::new(),
            hooked: false,
            api: PhantomData,
        }
    }
}

impl<A: DxgiApi> Backend for DxgiBackend<A> {
    fn version(&self) -> Direct3DVersion {
        self.version
    }

    fn hook(&mut self) -> Result<()> {
        if self.hooked {
            return Ok(());
        }
        let addresses = A::method_table()?;
        let statics = A::hooks();

        let present_hook = unsafe {
            Hook::install(
                "IDXGISwapChain::Present",
                addresses.table.slot(slots::DXGI_PRESENT),
                present::<A> as usize,
                self.gate.clone(),
            )
        };
        let resize_hook = unsafe {
            Hook::install(
                "IDXGISwapChain::ResizeTarget",
                addresses.table.slot(slots::DXGI_RESIZE_TARGET),
                resize_target::<A> as usize,
                self.gate.clone(),
            )
        };
        statics.present.store(present_hook.trampoline(), Ordering::Release);
        statics.resize_target.store(resize_hook.trampoline(), Ordering::Release);
        self.hooks.push(present_hook);
        self.hooks.push(resize_hook);

        *statics.runtime.write() = Some(Arc::new(Runtime::new(self.context.clone(), self.gate.clone())));
        self.hooked = true;
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        self.hooks.activate_all()
    }

    fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    fn unhook(&mut self, grace: Duration) {
        self.hooks.teardown(grace);
    }

    fn release(&mut self) {
        if let Some(runtime) = A::hooks().runtime.write().take() {
            runtime.binding.lock().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::d3d10::D3D10;
    use crate::backend::d3d11::D3D11;
    use crate::context::tests::collecting_context;
    use crate::vtable::DummyWindow;
    use framehook_core::protocol::{AgentEvent, ControllerEvent, ImageFormat, ScreenshotRequest};
    use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_WARP;
    use windows::Win32::Graphics::Direct3D11::{D3D11CreateDeviceAndSwapChain, D3D11_CREATE_DEVICE_FLAG, D3D11_SDK_VERSION};
    use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC};
    use windows::Win32::Graphics::Dxgi::{DXGI_SWAP_CHAIN_DESC, DXGI_USAGE_RENDER_TARGET_OUTPUT};

    fn warp_swap_chain(window: &DummyWindow) -> Option<IDXGISwapChain> {
        let desc = DXGI_SWAP_CHAIN_DESC {
            BufferDesc: DXGI_MODE_DESC {
                Width: 64,
                Height: 48,
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            },
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 1,
            OutputWindow: window.hwnd(),
            Windowed: true.into(),
            ..Default::default()
        };
        let mut swap_chain = None;
        unsafe {
            D3D11CreateDeviceAndSwapChain(
                None,
                D3D_DRIVER_TYPE_WARP,
                None,
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&desc),
                Some(&mut swap_chain),
                None,
                None,
                None,
            )
            .ok()?;
        }
        swap_chain
    }

    #[test]
    fn present_captures_requested_region() {
        let Ok(window) = DummyWindow::new() else {
            return;
        };
        let Some(swap_chain) = warp_swap_chain(&window) else {
            return;
        };
        let (context, sent) = collecting_context(false);
        let runtime = Runtime::<D3D11>::new(context.clone(), Arc::new(HookGate::new()));
        let request = ScreenshotRequest::new(Some(Rect::new(4, 4, 16, 8)), None, ImageFormat::PixelData);
        context.handle_event(&ControllerEvent::ScreenshotRequested(request));

        runtime.on_present(&swap_chain);
        context.shutdown();

        assert!(runtime.is_bound());
        let sent = sent.lock();
        let Some(AgentEvent::ScreenshotReceived(screenshot)) = sent.first() else {
            panic!("no screenshot delivered: {:?}", sent);
        };
        assert_eq!(screenshot.bytes().len(), 16 * 8 * 4);
    }

    #[test]
    fn swap_chain_of_other_api_is_left_alone() {
        let Ok(window) = DummyWindow::new() else {
            return;
        };
        let Some(swap_chain) = warp_swap_chain(&window) else {
            return;
        };
        let (context, sent) = collecting_context(false);
        let runtime = Runtime::<D3D10>::new(context.clone(), Arc::new(HookGate::new()));
        let request = ScreenshotRequest::new(None, None, ImageFormat::PixelData);
        context.handle_event(&ControllerEvent::ScreenshotRequested(request));

        runtime.on_present(&swap_chain);
        runtime.on_present(&swap_chain);
        context.shutdown();

        assert!(!runtime.is_bound());
        assert!(sent.lock().is_empty());
        assert!(context.has_pending_request());
    }
}
