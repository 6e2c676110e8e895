use super::{SendCom, StagingPool};
use crate::boundary::FrameBoundary;
use crate::context::{BackendContext, FrameTarget};
use crate::entry::Backend;
use crate::overlay::d3d9::D3D9Compositor;
use crate::overlay::{OverlayFrame, TargetSignature};
use crate::patch::VTableSlot;
use crate::readback::ReadbackSource;
use crate::vtable::{self, slots};
use anyhow::{anyhow, Result};
use framehook_core::capture::FrameReadback;
use framehook_core::hook::{Hook, HookGate, HookSet};
use framehook_core::protocol::{PixelFormat, Rect, Size};
use framehook_core::{log_debug, log_info, Direct3DVersion};
use parking_lot::{const_rwlock, Mutex, RwLock};
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use windows::core::{Interface, HRESULT};
use windows::Win32::Foundation::{HWND, RECT};
use windows::Win32::Graphics::Direct3D9::*;
use windows::Win32::Graphics::Gdi::RGNDATA;

type EndSceneFn = unsafe extern "system" fn(*mut c_void) -> HRESULT;
type PresentFn = unsafe extern "system" fn(*mut c_void, *const RECT, *const RECT, HWND, *const RGNDATA) -> HRESULT;
type PresentExFn =
    unsafe extern "system" fn(*mut c_void, *const RECT, *const RECT, HWND, *const RGNDATA, u32) -> HRESULT;
type ResetFn = unsafe extern "system" fn(*mut c_void, *mut D3DPRESENT_PARAMETERS) -> HRESULT;

static ORIGINAL_END_SCENE: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_PRESENT: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_PRESENT_EX: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_RESET: AtomicUsize = AtomicUsize::new(0);
static RUNTIME: RwLock<Option<Arc<Runtime>>> = const_rwlock(None);

static BOUNDARY: FrameBoundary = FrameBoundary::new();

thread_local! {
    /// Set while the frame step runs, so the overlay's own EndScene passes straight through.
    static IN_FRAME_STEP: Cell<bool> = const { Cell::new(false) };
}

struct Runtime {
    context: Arc<BackendContext>,
    gate: Arc<HookGate>,
    device: Mutex<Option<DeviceState>>,
}

struct DeviceState {
    identity: usize,
    device: IDirect3DDevice9,
    compositor: D3D9Compositor,
    render_target: Option<IDirect3DSurface9>,
    pool: StagingPool<IDirect3DSurface9>,
}

// Only touched by the render thread under the runtime mutex, or by `release`.
unsafe impl Send for DeviceState {}

impl DeviceState {
    fn bind(device: &IDirect3DDevice9) -> Self {
        log_info!("Bound Direct3D 9 device {:#x}", device.as_raw() as usize);
        Self {
            identity: device.as_raw() as usize,
            device: device.clone(),
            compositor: D3D9Compositor::new(device.clone()),
            render_target: None,
            pool: StagingPool::new(),
        }
    }

    fn invalidate(&mut self) {
        self.compositor.invalidate();
        self.render_target = None;
        self.pool.clear();
    }
}

impl Runtime {
    /// Runs outside any scene; the overlay opens its own.
    fn on_frame(&self, device: &IDirect3DDevice9) {
        let identity = device.as_raw() as usize;
        let mut state = self.device.lock();
        if state.as_ref().map(|s| s.identity) != Some(identity) {
            *state = Some(DeviceState::bind(device));
        }
        if let Some(state) = state.as_mut() {
            let mut target = D3D9Target { state };
            self.context.frame_step(&mut target);
        }
    }

    fn invalidate(&self) {
        if let Some(state) = self.device.lock().as_mut() {
            log_debug!("Dropping Direct3D 9 resources ahead of Reset");
            state.invalidate();
        }
    }
}

fn surface_desc(surface: &IDirect3DSurface9) -> Result<D3DSURFACE_DESC> {
    let mut desc = D3DSURFACE_DESC::default();
    unsafe { surface.GetDesc(&mut desc) }?;
    Ok(desc)
}

pub(crate) fn pixel_format_from_d3d9(format: D3DFORMAT) -> PixelFormat {
    match format {
        D3DFMT_A8R8G8B8 => PixelFormat::Bgra8,
        D3DFMT_X8R8G8B8 => PixelFormat::Bgrx8,
        D3DFMT_A8B8G8R8 => PixelFormat::Rgba8,
        D3DFMT_A2B10G10R10 => PixelFormat::Rgb10A2,
        D3DFMT_R5G6B5 => PixelFormat::B5G6R5,
        D3DFMT_A1R5G5B5 | D3DFMT_X1R5G5B5 => PixelFormat::B5G5R5A1,
        D3DFMT_A16B16G16R16F => PixelFormat::Rgba16F,
        other => PixelFormat::Unknown(other.0 as u32),
    }
}

struct D3D9Target<'a> {
    state: &'a mut DeviceState,
}

impl D3D9Target<'_> {
    fn backbuffer(&self) -> Result<(IDirect3DSurface9, D3DSURFACE_DESC)> {
        let backbuffer = unsafe { self.state.device.GetBackBuffer(0, 0, D3DBACKBUFFER_TYPE_MONO) }?;
        let desc = surface_desc(&backbuffer)?;
        Ok((backbuffer, desc))
    }

    /// Single-sampled render target that receives the (possibly scaled) region.
    fn render_target(&mut self, size: Size, format: D3DFORMAT) -> Result<IDirect3DSurface9> {
        let fits = match self.state.render_target.as_ref() {
            Some(surface) => {
                let d = surface_desc(surface)?;
                d.Width == size.width && d.Height == size.height && d.Format == format
            }
            None => false,
        };
        if !fits {
            let mut surface: Option<IDirect3DSurface9> = None;
            unsafe {
                self.state.device.CreateRenderTarget(
                    size.width,
                    size.height,
                    format,
                    D3DMULTISAMPLE_NONE,
                    0,
                    false.into(),
                    &mut surface,
                    std::ptr::null_mut(),
                )
            }?;
            self.state.render_target = surface;
        }
        self.state
            .render_target
            .clone()
            .ok_or_else(|| anyhow!("CreateRenderTarget returned nothing"))
    }

    fn system_surface(&self, size: Size, format: D3DFORMAT) -> Result<IDirect3DSurface9> {
        let fits = |s: &IDirect3DSurface9| {
            surface_desc(s).is_ok_and(|d| d.Width == size.width && d.Height == size.height && d.Format == format)
        };
        if let Some(surface) = self.state.pool.take_matching(fits) {
            return Ok(surface);
        }
        let mut surface: Option<IDirect3DSurface9> = None;
        unsafe {
            self.state.device.CreateOffscreenPlainSurface(
                size.width,
                size.height,
                format,
                D3DPOOL_SYSTEMMEM,
                &mut surface,
                std::ptr::null_mut(),
            )
        }?;
        surface.ok_or_else(|| anyhow!("CreateOffscreenPlainSurface returned nothing"))
    }
}

impl FrameTarget for D3D9Target<'_> {
    fn backbuffer_size(&self) -> Result<Size> {
        let (_, desc) = self.backbuffer()?;
        Ok(Size::new(desc.Width, desc.Height))
    }

    fn capture(&mut self, region: Rect, resize: Option<Size>) -> Result<Box<dyn ReadbackSource>> {
        let (backbuffer, desc) = self.backbuffer()?;
        let size = resize.unwrap_or(Size::new(region.width, region.height));
        let render_target = self.render_target(size, desc.Format)?;
        let source = RECT {
            left: region.x,
            top: region.y,
            right: region.x + region.width as i32,
            bottom: region.y + region.height as i32,
        };
        // StretchRect resolves multisampling and scales in one pass
        unsafe {
            self.state.device.StretchRect(
                &backbuffer,
                &source,
                &render_target,
                std::ptr::null(),
                D3DTEXF_LINEAR,
            )
        }?;

        let surface = self.system_surface(size, desc.Format)?;
        unsafe { self.state.device.GetRenderTargetData(&render_target, &surface) }?;

        Ok(Box::new(D3D9Readback {
            surface: Some(SendCom(surface)),
            pool: self.state.pool.clone(),
            size,
            format: pixel_format_from_d3d9(desc.Format),
        }))
    }

    fn draw_overlay(&mut self, frame: &OverlayFrame) -> Result<()> {
        let (_, desc) = self.backbuffer()?;
        let signature = TargetSignature {
            identity: self.state.identity,
            size: Size::new(desc.Width, desc.Height),
            version: frame.version,
        };
        let device = &self.state.device;
        unsafe { device.BeginScene() }?;
        let drawn = self.state.compositor.draw(frame, signature);
        let ended = unsafe { device.EndScene() };
        drawn?;
        Ok(ended?)
    }
}

/// `GetRenderTargetData` returns once the copy landed in system memory.
struct D3D9Readback {
    surface: Option<SendCom<IDirect3DSurface9>>,
    pool: StagingPool<IDirect3DSurface9>,
    size: Size,
    format: PixelFormat,
}

impl ReadbackSource for D3D9Readback {
    fn is_ready(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn read(mut self: Box<Self>) -> Result<FrameReadback> {
        let SendCom(surface) = self.surface.take().ok_or_else(|| anyhow!("system surface already read"))?;
        let frame = unsafe {
            let mut locked = D3DLOCKED_RECT::default();
            surface.LockRect(&mut locked, std::ptr::null(), D3DLOCK_READONLY as u32)?;
            let frame = FrameReadback::from_mapped(
                locked.pBits as *const u8,
                locked.Pitch as usize,
                self.size.width,
                self.size.height,
                self.format,
            );
            let _ = surface.UnlockRect();
            frame
        };
        self.pool.put(surface);
        Ok(frame?)
    }
}

fn runtime() -> Option<Arc<Runtime>> {
    RUNTIME.read().clone()
}

unsafe fn run_frame_step(this: *mut c_void) {
    let Some(runtime) = runtime() else {
        return;
    };
    let Some(_guard) = runtime.gate.enter() else {
        return;
    };
    if let Some(device) = IDirect3DDevice9::from_raw_borrowed(&this) {
        let outer = IN_FRAME_STEP.with(|flag| flag.replace(true));
        runtime.on_frame(device);
        IN_FRAME_STEP.with(|flag| flag.set(outer));
    }
}

unsafe extern "system" fn end_scene(this: *mut c_void) -> HRESULT {
    let original: EndSceneFn = std::mem::transmute(ORIGINAL_END_SCENE.load(Ordering::Acquire));
    let result = original(this);
    let nested = IN_FRAME_STEP.with(|flag| flag.get());
    if !nested && result.is_ok() && BOUNDARY.on_end_scene() {
        run_frame_step(this);
    }
    result
}

unsafe extern "system" fn present(
    this: *mut c_void,
    source: *const RECT,
    dest: *const RECT,
    window: HWND,
    dirty: *const RGNDATA,
) -> HRESULT {
    let original: PresentFn = std::mem::transmute(ORIGINAL_PRESENT.load(Ordering::Acquire));
    if BOUNDARY.on_present() {
        run_frame_step(this);
    }
    original(this, source, dest, window, dirty)
}

unsafe extern "system" fn present_ex(
    this: *mut c_void,
    source: *const RECT,
    dest: *const RECT,
    window: HWND,
    dirty: *const RGNDATA,
    flags: u32,
) -> HRESULT {
    let original: PresentExFn = std::mem::transmute(ORIGINAL_PRESENT_EX.load(Ordering::Acquire));
    if BOUNDARY.on_present() {
        run_frame_step(this);
    }
    original(this, source, dest, window, dirty, flags)
}

unsafe extern "system" fn reset(this: *mut c_void, params: *mut D3DPRESENT_PARAMETERS) -> HRESULT {
    let original: ResetFn = std::mem::transmute(ORIGINAL_RESET.load(Ordering::Acquire));
    if let Some(runtime) = runtime() {
        if let Some(_guard) = runtime.gate.enter() {
            runtime.invalidate();
        }
    }
    original(this, params)
}

pub struct D3D9Backend {
    context: Arc<BackendContext>,
    gate: Arc<HookGate>,
    hooks: HookSet<VTableSlot>,
    hooked: bool,
}

impl D3D9Backend {
    pub fn new(context: Arc<BackendContext>) -> Self {
        Self {
            context,
            gate: Arc::new(HookGate::new()),
            hooks: HookSet::new(),
            hooked: false,
        }
    }

    fn install(&mut self, name: &'static str, slot: VTableSlot, detour: usize, original: &AtomicUsize) {
        let hook = Hook::install(name, slot, detour, self.gate.clone());
        original.store(hook.trampoline(), Ordering::Release);
        self.hooks.push(hook);
    }
}

impl Backend for D3D9Backend {
    fn version(&self) -> Direct3DVersion {
        Direct3DVersion::Direct3D9
    }

    fn hook(&mut self) -> Result<()> {
        if self.hooked {
            return Ok(());
        }
        let addresses = vtable::direct3d9()?;
        let device = addresses.device;

        unsafe {
            self.install(
                "IDirect3DDevice9::EndScene",
                device.slot(slots::D3D9_END_SCENE),
                end_scene as usize,
                &ORIGINAL_END_SCENE,
            );
            self.install(
                "IDirect3DDevice9::Present",
                device.slot(slots::D3D9_PRESENT),
                present as usize,
                &ORIGINAL_PRESENT,
            );
            self.install(
                "IDirect3DDevice9::Reset",
                device.slot(slots::D3D9_RESET),
                reset as usize,
                &ORIGINAL_RESET,
            );
            match addresses.device_ex {
                Some(device_ex) => self.install(
                    "IDirect3DDevice9Ex::PresentEx",
                    device_ex.slot(slots::D3D9_PRESENT_EX),
                    present_ex as usize,
                    &ORIGINAL_PRESENT_EX,
                ),
                None => log_debug!("Direct3D 9Ex unavailable, PresentEx is not hooked"),
            }
        }

        BOUNDARY.reset();
        *RUNTIME.write() = Some(Arc::new(Runtime {
            context: self.context.clone(),
            gate: self.gate.clone(),
            device: Mutex::new(None),
        }));
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
        if let Some(runtime) = RUNTIME.write().take() {
            runtime.device.lock().take();
        }
    }
}
