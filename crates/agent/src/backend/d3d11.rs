use super::dxgi::{DxgiApi, DxgiBackend, DxgiHooks, TextureInfo};
use super::pixel_format_from_dxgi;
use crate::overlay::d3d11::D3D11Compositor;
use crate::overlay::{OverlayFrame, TargetSignature};
use crate::vtable::{self, SwapChainAddresses};
use anyhow::{anyhow, Context, Result};
use framehook_core::capture::FrameReadback;
use framehook_core::log_warn;
use framehook_core::protocol::Rect;
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

pub struct D3D11;

/// Device plus the immediate context every copy and draw goes through.
#[derive(Clone)]
pub struct D3D11Device {
    device: ID3D11Device,
    immediate: ID3D11DeviceContext,
}

static HOOKS: DxgiHooks<D3D11> = DxgiHooks::new();

pub type D3D11Backend = DxgiBackend<D3D11>;

impl DxgiApi for D3D11 {
    const NAME: &'static str = "Direct3D 11";

    type Device = D3D11Device;
    type Texture = ID3D11Texture2D;
    type Query = ID3D11Query;
    type Compositor = D3D11Compositor;

    fn hooks() -> &'static DxgiHooks<Self> {
        &HOOKS
    }

    fn method_table() -> Result<SwapChainAddresses> {
        vtable::direct3d11()
    }

    fn open(swap_chain: &IDXGISwapChain) -> Result<D3D11Device> {
        let device: ID3D11Device = unsafe { swap_chain.GetDevice() }.context("swap chain has no Direct3D 11 device")?;
        let immediate = unsafe { device.GetImmediateContext() }.context("device has no immediate context")?;
        // The readback worker maps staging textures on its own thread
        match immediate.cast::<ID3D11Multithread>() {
            Ok(multithread) => unsafe {
                let _ = multithread.SetMultithreadProtected(true);
            },
            Err(e) => log_warn!("ID3D11Multithread unavailable, readback shares an unprotected context: {}", e),
        }
        Ok(D3D11Device { device, immediate })
    }

    fn compositor(device: &D3D11Device) -> D3D11Compositor {
        D3D11Compositor::new(device.device.clone(), device.immediate.clone())
    }

    fn invalidate(compositor: &mut D3D11Compositor) {
        compositor.invalidate();
    }

    fn draw_overlay(
        compositor: &mut D3D11Compositor,
        frame: &OverlayFrame,
        backbuffer: &ID3D11Texture2D,
        signature: TargetSignature,
    ) -> Result<()> {
        compositor.draw(frame, backbuffer, signature)
    }

    fn describe(texture: &ID3D11Texture2D) -> TextureInfo {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        TextureInfo {
            width: desc.Width,
            height: desc.Height,
            format: desc.Format,
            samples: desc.SampleDesc.Count,
        }
    }

    fn create_texture(device: &D3D11Device, info: TextureInfo, staging: bool) -> Result<ID3D11Texture2D> {
        let (usage, cpu_access) = if staging {
            (D3D11_USAGE_STAGING, D3D11_CPU_ACCESS_READ.0 as u32)
        } else {
            (D3D11_USAGE_DEFAULT, 0)
        };
        let desc = D3D11_TEXTURE2D_DESC {
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
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.device.CreateTexture2D(&desc, None, Some(&mut texture)) }?;
        texture.ok_or_else(|| anyhow!("CreateTexture2D returned nothing"))
    }

    fn resolve(device: &D3D11Device, target: &ID3D11Texture2D, source: &ID3D11Texture2D, format: DXGI_FORMAT) {
        unsafe { device.immediate.ResolveSubresource(target, 0, source, 0, format) };
    }

    fn copy_region(
        device: &D3D11Device,
        staging: &ID3D11Texture2D,
        source: &ID3D11Texture2D,
        region: Rect,
    ) -> Result<ID3D11Query> {
        let source_box = D3D11_BOX {
            left: region.x as u32,
            top: region.y as u32,
            front: 0,
            right: region.x as u32 + region.width,
            bottom: region.y as u32 + region.height,
            back: 1,
        };
        let query_desc = D3D11_QUERY_DESC {
            Query: D3D11_QUERY_EVENT,
            ..Default::default()
        };
        let mut query: Option<ID3D11Query> = None;
        unsafe {
            device
                .immediate
                .CopySubresourceRegion(staging, 0, 0, 0, 0, source, 0, Some(&source_box));
            device.device.CreateQuery(&query_desc, Some(&mut query))?;
        }
        let query = query.ok_or_else(|| anyhow!("CreateQuery returned nothing"))?;
        unsafe {
            device.immediate.End(&query);
            device.immediate.Flush();
        }
        Ok(query)
    }

    fn query_done(device: &D3D11Device, query: &ID3D11Query) -> bool {
        let mut done: u32 = 0;
        let polled = unsafe {
            device.immediate.GetData(
                query,
                Some(&mut done as *mut u32 as *mut _),
                std::mem::size_of::<u32>() as u32,
                D3D11_ASYNC_GETDATA_DONOTFLUSH.0 as u32,
            )
        };
        polled.is_ok() && done != 0
    }

    fn map_read(
        device: &D3D11Device,
        texture: &ID3D11Texture2D,
        width: u32,
        height: u32,
        format: DXGI_FORMAT,
    ) -> Result<FrameReadback> {
        unsafe {
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            device.immediate.Map(texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))?;
            let frame = FrameReadback::from_mapped(
                mapped.pData as *const u8,
                mapped.RowPitch as usize,
                width,
                height,
                pixel_format_from_dxgi(format),
            );
            device.immediate.Unmap(texture, 0);
            Ok(frame?)
        }
    }
}
