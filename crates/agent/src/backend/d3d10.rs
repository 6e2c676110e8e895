use super::dxgi::{DxgiApi, DxgiBackend, DxgiHooks, TextureInfo};
use super::pixel_format_from_dxgi;
use crate::overlay::d3d10::D3D10Compositor;
use crate::overlay::{OverlayFrame, TargetSignature};
use crate::vtable::{self, SwapChainAddresses};
use anyhow::{anyhow, Context, Result};
use framehook_core::capture::FrameReadback;
use framehook_core::log_warn;
use framehook_core::protocol::Rect;
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D10::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

/// Direct3D 10 and 10.1; the device executes copies itself.
pub struct D3D10;

static HOOKS: DxgiHooks<D3D10> = DxgiHooks::new();

pub type D3D10Backend = DxgiBackend<D3D10>;

impl DxgiApi for D3D10 {
    const NAME: &'static str = "Direct3D 10";

    type Device = ID3D10Device;
    type Texture = ID3D10Texture2D;
    type Query = ID3D10Query;
    type Compositor = D3D10Compositor;

    fn hooks() -> &'static DxgiHooks<Self> {
        &HOOKS
    }

    fn method_table() -> Result<SwapChainAddresses> {
        vtable::direct3d10()
    }

    fn open(swap_chain: &IDXGISwapChain) -> Result<ID3D10Device> {
        let device: ID3D10Device = unsafe { swap_chain.GetDevice() }.context("swap chain has no Direct3D 10 device")?;
        match device.cast::<ID3D10Multithread>() {
            Ok(multithread) => unsafe {
                let _ = multithread.SetMultithreadProtected(true);
            },
            Err(e) => log_warn!("ID3D10Multithread unavailable, readback shares an unprotected device: {}", e),
        }
        Ok(device)
    }

    fn compositor(device: &ID3D10Device) -> D3D10Compositor {
        D3D10Compositor::new(device.clone())
    }

    fn invalidate(compositor: &mut D3D10Compositor) {
        compositor.invalidate();
    }

    fn draw_overlay(
        compositor: &mut D3D10Compositor,
        frame: &OverlayFrame,
        backbuffer: &ID3D10Texture2D,
        signature: TargetSignature,
    ) -> Result<()> {
        compositor.draw(frame, backbuffer, signature)
    }

    fn describe(texture: &ID3D10Texture2D) -> TextureInfo {
        let mut desc = D3D10_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        TextureInfo {
            width: desc.Width,
            height: desc.Height,
            format: desc.Format,
            samples: desc.SampleDesc.Count,
        }
    }

    fn create_texture(device: &ID3D10Device, info: TextureInfo, staging: bool) -> Result<ID3D10Texture2D> {
        let (usage, cpu_access) = if staging {
            (D3D10_USAGE_STAGING, D3D10_CPU_ACCESS_READ.0 as u32)
        } else {
            (D3D10_USAGE_DEFAULT, 0)
        };
        let desc = D3D10_TEXTURE2D_DESC {
            Width: info.width,
            Height: info.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: info.format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: usage,
            BindFlags: 0,
            CPUAccessFlags: cpu_access,
            MiscFlags: 0,
        };
        let mut texture: Option<ID3D10Texture2D> = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }?;
        texture.ok_or_else(|| anyhow!("CreateTexture2D returned nothing"))
    }

    fn resolve(device: &ID3D10Device, target: &ID3D10Texture2D, source: &ID3D10Texture2D, format: DXGI_FORMAT) {
        unsafe { device.ResolveSubresource(target, 0, source, 0, format) };
    }

    fn copy_region(
        device: &ID3D10Device,
        staging: &ID3D10Texture2D,
        source: &ID3D10Texture2D,
        region: Rect,
    ) -> Result<ID3D10Query> {
        let source_box = D3D10_BOX {
            left: region.x as u32,
            top: region.y as u32,
            front: 0,
            right: region.x as u32 + region.width,
            bottom: region.y as u32 + region.height,
            back: 1,
        };
        let query_desc = D3D10_QUERY_DESC {
            Query: D3D10_QUERY_EVENT,
            MiscFlags: 0,
        };
        let mut query: Option<ID3D10Query> = None;
        unsafe {
            device.CopySubresourceRegion(staging, 0, 0, 0, 0, source, 0, Some(&source_box));
            device.CreateQuery(&query_desc, Some(&mut query))?;
        }
        let query = query.ok_or_else(|| anyhow!("CreateQuery returned nothing"))?;
        unsafe {
            query.End();
            device.Flush();
        }
        Ok(query)
    }

    fn query_done(_device: &ID3D10Device, query: &ID3D10Query) -> bool {
        let mut done: u32 = 0;
        let polled = unsafe {
            query.GetData(
                Some(&mut done as *mut u32 as *mut _),
                std::mem::size_of::<u32>() as u32,
                D3D10_ASYNC_GETDATA_DONOTFLUSH as u32,
            )
        };
        polled.is_ok() && done != 0
    }

    fn map_read(
        _device: &ID3D10Device,
        texture: &ID3D10Texture2D,
        width: u32,
        height: u32,
        format: DXGI_FORMAT,
    ) -> Result<FrameReadback> {
        unsafe {
            let mapped = texture.Map(0, D3D10_MAP_READ, 0)?;
            let frame = FrameReadback::from_mapped(
                mapped.pData as *const u8,
                mapped.RowPitch as usize,
                width,
                height,
                pixel_format_from_dxgi(format),
            );
            texture.Unmap(0);
            Ok(frame?)
        }
    }
}
