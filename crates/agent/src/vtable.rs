//! Method tables of throwaway D3D objects, resolved once per API.

use std::ffi::c_void;

/// Reads `count` slots of the vtable whose pointer sits at the base of `object`.
///
/// # Safety
/// `object` must point at a live COM object whose vtable has at least `count` entries.
pub unsafe fn read_vtable(object: *const c_void, count: usize) -> Vec<usize> {
    let vtable = *(object as *const *const usize);
    (0..count).map(|i| *vtable.add(i)).collect()
}

/// A copy of the first `N` vtable entries plus where the table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VTable<const N: usize> {
    base: usize,
    entries: [usize; N],
}

impl<const N: usize> VTable<N> {
    /// # Safety
    /// Same contract as [`read_vtable`] with `count == N`.
    pub unsafe fn read(object: *const c_void) -> Self {
        let base = *(object as *const usize);
        let mut entries = [0usize; N];
        entries.copy_from_slice(&read_vtable(object, N));
        Self { base, entries }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn entry(&self, index: usize) -> usize {
        self.entries[index]
    }

    /// Patch site for entry `index`.
    ///
    /// # Safety
    /// The module that owns the table must stay loaded while the slot is used.
    #[cfg(windows)]
    pub unsafe fn slot(&self, index: usize) -> crate::patch::VTableSlot {
        assert!(index < N, "vtable index {} out of range", index);
        crate::patch::VTableSlot::new(self.base as *const usize, index)
    }
}

pub mod slots {
    pub const D3D9_RESET: usize = 16;
    pub const D3D9_PRESENT: usize = 17;
    pub const D3D9_END_SCENE: usize = 42;
    pub const D3D9_PRESENT_EX: usize = 121;
    pub const D3D9_DEVICE_COUNT: usize = 119;
    pub const D3D9_DEVICE_EX_COUNT: usize = 134;

    pub const DXGI_PRESENT: usize = 8;
    pub const DXGI_RESIZE_TARGET: usize = 14;
    pub const DXGI_SWAP_CHAIN_COUNT: usize = 18;
}

pub type SwapChainTable = VTable<{ slots::DXGI_SWAP_CHAIN_COUNT }>;
pub type Device9Table = VTable<{ slots::D3D9_DEVICE_COUNT }>;
pub type Device9ExTable = VTable<{ slots::D3D9_DEVICE_EX_COUNT }>;

#[derive(Debug, Clone, Copy)]
pub struct SwapChainAddresses {
    pub table: SwapChainTable,
}

impl SwapChainAddresses {
    pub fn present(&self) -> usize {
        self.table.entry(slots::DXGI_PRESENT)
    }

    pub fn resize_target(&self) -> usize {
        self.table.entry(slots::DXGI_RESIZE_TARGET)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Direct3D9Addresses {
    pub device: Device9Table,
    /// Present only when `Direct3DCreate9Ex` is available.
    pub device_ex: Option<Device9ExTable>,
}

impl Direct3D9Addresses {
    pub fn end_scene(&self) -> usize {
        self.device.entry(slots::D3D9_END_SCENE)
    }

    pub fn present(&self) -> usize {
        self.device.entry(slots::D3D9_PRESENT)
    }

    pub fn reset(&self) -> usize {
        self.device.entry(slots::D3D9_RESET)
    }

    pub fn present_ex(&self) -> Option<usize> {
        self.device_ex.map(|t| t.entry(slots::D3D9_PRESENT_EX))
    }
}

#[cfg(windows)]
pub use probe::{direct3d10, direct3d11, direct3d9, DummyWindow};

#[cfg(windows)]
mod probe {
    use super::*;
    use anyhow::{anyhow, Context, Result};
    use framehook_core::{log_debug, log_info};
    use once_cell::sync::OnceCell;
    use windows::core::{w, Interface};
    use windows::Win32::Foundation::HWND;
    use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE, D3D_DRIVER_TYPE_NULL, D3D_DRIVER_TYPE_WARP};
    use windows::Win32::Graphics::Direct3D10::{
        D3D10CreateDeviceAndSwapChain, ID3D10Device, D3D10_DRIVER_TYPE, D3D10_DRIVER_TYPE_NULL,
        D3D10_DRIVER_TYPE_WARP, D3D10_SDK_VERSION,
    };
    use windows::Win32::Graphics::Direct3D11::{
        D3D11CreateDeviceAndSwapChain, ID3D11Device, D3D11_CREATE_DEVICE_FLAG, D3D11_SDK_VERSION,
    };
    use windows::Win32::Graphics::Direct3D9::{
        Direct3DCreate9, Direct3DCreate9Ex, IDirect3DDevice9, IDirect3DDevice9Ex, D3DCREATE_SOFTWARE_VERTEXPROCESSING,
        D3DDEVTYPE, D3DDEVTYPE_HAL, D3DDEVTYPE_NULLREF, D3DFMT_UNKNOWN, D3DPRESENT_PARAMETERS, D3DSWAPEFFECT_DISCARD,
        D3D_SDK_VERSION,
    };
    use windows::Win32::Graphics::Dxgi::Common::{
        DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_MODE_DESC, DXGI_RATIONAL, DXGI_SAMPLE_DESC,
    };
    use windows::Win32::Graphics::Dxgi::{IDXGISwapChain, DXGI_SWAP_CHAIN_DESC, DXGI_USAGE_RENDER_TARGET_OUTPUT};
    use windows::Win32::UI::WindowsAndMessaging::{CreateWindowExW, DestroyWindow, WINDOW_EX_STYLE, WS_OVERLAPPED};

    /// Hidden 1x1 window used as the device focus window while probing.
    pub struct DummyWindow(HWND);

    impl DummyWindow {
        pub fn new() -> Result<Self> {
            let hwnd = unsafe {
                CreateWindowExW(
                    WINDOW_EX_STYLE(0),
                    w!("STATIC"),
                    w!("framehook-probe"),
                    WS_OVERLAPPED,
                    0,
                    0,
                    1,
                    1,
                    None,
                    None,
                    None,
                    None,
                )
            }
            .context("Failed to create probe window")?;
            Ok(Self(hwnd))
        }

        pub fn hwnd(&self) -> HWND {
            self.0
        }
    }

    impl Drop for DummyWindow {
        fn drop(&mut self) {
            unsafe {
                let _ = DestroyWindow(self.0);
            }
        }
    }

    static D3D9: OnceCell<Result<Direct3D9Addresses, String>> = OnceCell::new();
    static D3D10: OnceCell<Result<SwapChainAddresses, String>> = OnceCell::new();
    static D3D11: OnceCell<Result<SwapChainAddresses, String>> = OnceCell::new();

    fn cached<T: Copy>(cell: &OnceCell<Result<T, String>>, name: &str, probe: impl FnOnce() -> Result<T>) -> Result<T> {
        cell.get_or_init(|| {
            let resolved = probe().map_err(|e| format!("{:#}", e));
            match &resolved {
                Ok(_) => log_info!("Resolved {} method table", name),
                Err(e) => log_debug!("{} probe failed: {}", name, e),
            }
            resolved
        })
        .clone()
        .map_err(|e| anyhow!(e))
    }

    pub fn direct3d9() -> Result<Direct3D9Addresses> {
        cached(&D3D9, "Direct3D 9", probe_d3d9)
    }

    pub fn direct3d10() -> Result<SwapChainAddresses> {
        cached(&D3D10, "Direct3D 10", probe_d3d10)
    }

    pub fn direct3d11() -> Result<SwapChainAddresses> {
        cached(&D3D11, "Direct3D 11", probe_d3d11)
    }

    fn present_parameters(window: &DummyWindow) -> D3DPRESENT_PARAMETERS {
        D3DPRESENT_PARAMETERS {
            BackBufferWidth: 1,
            BackBufferHeight: 1,
            BackBufferFormat: D3DFMT_UNKNOWN,
            SwapEffect: D3DSWAPEFFECT_DISCARD,
            hDeviceWindow: window.hwnd(),
            Windowed: true.into(),
            ..Default::default()
        }
    }

    fn probe_d3d9() -> Result<Direct3D9Addresses> {
        let window = DummyWindow::new()?;
        let d3d = unsafe { Direct3DCreate9(D3D_SDK_VERSION) }.context("Direct3DCreate9 returned null")?;

        let device = [D3DDEVTYPE_NULLREF, D3DDEVTYPE_HAL]
            .into_iter()
            .find_map(|kind: D3DDEVTYPE| {
                let mut params = present_parameters(&window);
                let mut device: Option<IDirect3DDevice9> = None;
                unsafe {
                    d3d.CreateDevice(
                        0,
                        kind,
                        window.hwnd(),
                        D3DCREATE_SOFTWARE_VERTEXPROCESSING as u32,
                        &mut params,
                        &mut device,
                    )
                }
                .ok()
                .and(device)
            })
            .context("No Direct3D 9 device could be created for probing")?;
        let table = unsafe { Device9Table::read(device.as_raw()) };

        // PresentEx only exists on the Ex device's table
        let table_ex = unsafe { Direct3DCreate9Ex(D3D_SDK_VERSION) }.ok().and_then(|d3d_ex| {
            let mut params = present_parameters(&window);
            let mut device_ex: Option<IDirect3DDevice9Ex> = None;
            unsafe {
                d3d_ex.CreateDeviceEx(
                    0,
                    D3DDEVTYPE_HAL,
                    window.hwnd(),
                    D3DCREATE_SOFTWARE_VERTEXPROCESSING as u32,
                    &mut params,
                    std::ptr::null_mut(),
                    &mut device_ex,
                )
            }
            .ok()?;
            device_ex.map(|d| unsafe { Device9ExTable::read(d.as_raw()) })
        });

        Ok(Direct3D9Addresses {
            device: table,
            device_ex: table_ex,
        })
    }

    fn swap_chain_desc(window: &DummyWindow) -> DXGI_SWAP_CHAIN_DESC {
        DXGI_SWAP_CHAIN_DESC {
            BufferDesc: DXGI_MODE_DESC {
                Width: 1,
                Height: 1,
                RefreshRate: DXGI_RATIONAL {
                    Numerator: 60,
                    Denominator: 1,
                },
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            },
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 1,
            OutputWindow: window.hwnd(),
            Windowed: true.into(),
            ..Default::default()
        }
    }

    fn probe_d3d10() -> Result<SwapChainAddresses> {
        let window = DummyWindow::new()?;
        let desc = swap_chain_desc(&window);

        let swap_chain = [D3D10_DRIVER_TYPE_NULL, D3D10_DRIVER_TYPE_WARP]
            .into_iter()
            .find_map(|kind: D3D10_DRIVER_TYPE| {
                let mut swap_chain: Option<IDXGISwapChain> = None;
                let mut device: Option<ID3D10Device> = None;
                unsafe {
                    D3D10CreateDeviceAndSwapChain(
                        None,
                        kind,
                        None,
                        0,
                        D3D10_SDK_VERSION,
                        Some(&desc),
                        Some(&mut swap_chain),
                        Some(&mut device),
                    )
                }
                .ok()
                .and(swap_chain)
            })
            .context("No Direct3D 10 swap chain could be created for probing")?;

        Ok(SwapChainAddresses {
            table: unsafe { SwapChainTable::read(swap_chain.as_raw()) },
        })
    }

    fn probe_d3d11() -> Result<SwapChainAddresses> {
        let window = DummyWindow::new()?;
        let desc = swap_chain_desc(&window);

        let swap_chain = [D3D_DRIVER_TYPE_NULL, D3D_DRIVER_TYPE_WARP]
            .into_iter()
            .find_map(|kind: D3D_DRIVER_TYPE| {
                let mut swap_chain: Option<IDXGISwapChain> = None;
                let mut device: Option<ID3D11Device> = None;
                unsafe {
                    D3D11CreateDeviceAndSwapChain(
                        None,
                        kind,
                        None,
                        D3D11_CREATE_DEVICE_FLAG(0),
                        None,
                        D3D11_SDK_VERSION,
                        Some(&desc),
                        Some(&mut swap_chain),
                        Some(&mut device),
                        None,
                        None,
                    )
                }
                .ok()
                .and(swap_chain)
            })
            .context("No Direct3D 11 swap chain could be created for probing")?;

        Ok(SwapChainAddresses {
            table: unsafe { SwapChainTable::read(swap_chain.as_raw()) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct FakeObject {
        vtable: *const usize,
    }

    #[test]
    fn reads_entries_through_object_base() {
        let table: Vec<usize> = (0..20).map(|i| 0x1000 + i * 0x10).collect();
        let object = FakeObject { vtable: table.as_ptr() };
        let ptr = &object as *const FakeObject as *const c_void;

        let entries = unsafe { read_vtable(ptr, 3) };
        assert_eq!(entries, vec![0x1000, 0x1010, 0x1020]);

        let typed = unsafe { SwapChainTable::read(ptr) };
        assert_eq!(typed.base(), table.as_ptr() as usize);
        let addresses = SwapChainAddresses { table: typed };
        assert_eq!(addresses.present(), 0x1000 + 8 * 0x10);
        assert_eq!(addresses.resize_target(), 0x1000 + 14 * 0x10);
    }
}
