// Direct3D 9 compositor on the fixed-function pipeline.
use super::engine::{texture_runs, OverlayEngine, OverlayFrame, PipelineSlot, Quad, ResourceFactory, TargetSignature};
use super::text::GdiRasterizer;
use anyhow::{anyhow, Result};
use windows::Win32::Graphics::Direct3D9::*;

pub struct D3D9Factory {
    device: IDirect3DDevice9,
}

impl ResourceFactory for D3D9Factory {
    type Texture = IDirect3DTexture9;

    fn create_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<Self::Texture> {
        unsafe {
            let mut texture: Option<IDirect3DTexture9> = None;
            self.device.CreateTexture(
                width,
                height,
                1,
                D3DUSAGE_DYNAMIC as u32,
                D3DFMT_A8R8G8B8,
                D3DPOOL_DEFAULT,
                &mut texture,
                std::ptr::null_mut(),
            )?;
            let texture = texture.ok_or_else(|| anyhow!("CreateTexture returned nothing"))?;

            let mut locked = D3DLOCKED_RECT::default();
            texture.LockRect(0, &mut locked, std::ptr::null(), D3DLOCK_DISCARD as u32)?;
            let row = width as usize * 4;
            for y in 0..height as usize {
                let dst = std::slice::from_raw_parts_mut((locked.pBits as *mut u8).add(y * locked.Pitch as usize), row);
                // A8R8G8B8 is BGRA in memory
                for (d, s) in dst.chunks_exact_mut(4).zip(rgba[y * row..(y + 1) * row].chunks_exact(4)) {
                    d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
                }
            }
            texture.UnlockRect(0)?;
            Ok(texture)
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScreenVertex {
    pos: [f32; 4],
    diffuse: u32,
    uv: [f32; 2],
}

const SCREEN_VERTEX_FVF: u32 = (D3DFVF_XYZRHW | D3DFVF_DIFFUSE | D3DFVF_TEX1) as u32;

/// Pre-transformed vertices in pixels. The half-pixel shift maps texels to pixels exactly.
fn screen_vertices(quads: &[Quad]) -> Vec<ScreenVertex> {
    let mut vertices = Vec::with_capacity(quads.len() * 6);
    for quad in quads {
        let left = quad.dest.x - 0.5;
        let top = quad.dest.y - 0.5;
        let right = left + quad.dest.width;
        let bottom = top + quad.dest.height;
        let [u0, v0, u1, v1] = quad.uv;
        let [r, g, b, a] = quad.color.premultiplied().map(|c| (c * 255.0).round() as u32);
        let diffuse = a << 24 | r << 16 | g << 8 | b;

        let v = |x, y, u, v| ScreenVertex {
            pos: [x, y, 0.0, 1.0],
            diffuse,
            uv: [u, v],
        };
        vertices.extend_from_slice(&[
            v(left, top, u0, v0),
            v(right, top, u1, v0),
            v(left, bottom, u0, v1),
            v(right, top, u1, v0),
            v(right, bottom, u1, v1),
            v(left, bottom, u0, v1),
        ]);
    }
    vertices
}

/// Render-target slots a Direct3D 9 device can expose.
const RENDER_TARGETS: usize = 4;

/// Surface bindings live outside `D3DSBT_ALL` state blocks.
struct SurfaceBindings {
    render_targets: [Option<IDirect3DSurface9>; RENDER_TARGETS],
    depth_stencil: Option<IDirect3DSurface9>,
}

impl SurfaceBindings {
    unsafe fn capture(device: &IDirect3DDevice9) -> Self {
        Self {
            render_targets: std::array::from_fn(|i| device.GetRenderTarget(i as u32).ok()),
            depth_stencil: device.GetDepthStencilSurface().ok(),
        }
    }

    /// Resets the viewport as a side effect, so it runs before the state block is applied.
    unsafe fn restore(&self, device: &IDirect3DDevice9) -> Result<()> {
        for (i, target) in self.render_targets.iter().enumerate() {
            match target {
                Some(surface) => device.SetRenderTarget(i as u32, surface)?,
                // Slot 0 can't be emptied; slots past the device's count reject the call
                None if i > 0 => {
                    let _ = device.SetRenderTarget(i as u32, None::<&IDirect3DSurface9>);
                }
                None => {}
            }
        }
        device.SetDepthStencilSurface(self.depth_stencil.as_ref())?;
        Ok(())
    }
}

pub struct D3D9Compositor {
    device: IDirect3DDevice9,
    factory: D3D9Factory,
    engine: OverlayEngine<D3D9Factory>,
    rasterizer: GdiRasterizer,
    state_block: PipelineSlot<IDirect3DStateBlock9>,
}

impl D3D9Compositor {
    pub fn new(device: IDirect3DDevice9) -> Self {
        Self {
            factory: D3D9Factory { device: device.clone() },
            device,
            engine: OverlayEngine::new(),
            rasterizer: GdiRasterizer,
            state_block: PipelineSlot::default(),
        }
    }

    /// Default-pool textures and state blocks must go before `Reset`.
    pub fn invalidate(&mut self) {
        self.engine.invalidate();
        self.state_block.reset();
    }

    /// Expects to run inside a scene.
    pub fn draw(&mut self, frame: &OverlayFrame, signature: TargetSignature) -> Result<()> {
        if self.engine.needs_reinit(signature) {
            self.engine
                .reinit(&mut self.factory, &mut self.rasterizer, signature, frame.overlay.as_ref());
        }
        let quads = self
            .engine
            .build_batch(&mut self.factory, &mut self.rasterizer, frame, signature.size);
        if quads.is_empty() {
            return Ok(());
        }
        let vertices = screen_vertices(&quads);

        let device = &self.device;
        let state_block = self.state_block.get_or_try_init(|| unsafe {
            let mut block: Option<IDirect3DStateBlock9> = None;
            device.CreateStateBlock(D3DSBT_ALL, &mut block)?;
            block.ok_or_else(|| anyhow!("CreateStateBlock returned nothing"))
        })?;
        let Some(state_block) = state_block.cloned() else {
            return Ok(());
        };

        unsafe {
            let bindings = SurfaceBindings::capture(&self.device);
            state_block.Capture()?;

            let result = self.draw_batch(&quads, &vertices, signature);

            let restored = bindings.restore(&self.device);
            state_block.Apply()?;
            result.and(restored)
        }
    }

    unsafe fn draw_batch(&self, quads: &[Quad], vertices: &[ScreenVertex], signature: TargetSignature) -> Result<()> {
        let device = &self.device;

        let backbuffer = device.GetBackBuffer(0, 0, D3DBACKBUFFER_TYPE_MONO)?;
        device.SetRenderTarget(0, &backbuffer)?;
        for i in 1..RENDER_TARGETS as u32 {
            let _ = device.SetRenderTarget(i, None::<&IDirect3DSurface9>);
        }
        device.SetDepthStencilSurface(None::<&IDirect3DSurface9>)?;
        device.SetViewport(&D3DVIEWPORT9 {
            X: 0,
            Y: 0,
            Width: signature.size.width,
            Height: signature.size.height,
            MinZ: 0.0,
            MaxZ: 1.0,
        })?;

        device.SetPixelShader(None::<&IDirect3DPixelShader9>)?;
        device.SetVertexShader(None::<&IDirect3DVertexShader9>)?;
        device.SetFVF(SCREEN_VERTEX_FVF)?;

        let render_states = [
            (D3DRS_ZENABLE, 0),
            (D3DRS_ZWRITEENABLE, 0),
            (D3DRS_LIGHTING, 0),
            (D3DRS_FOGENABLE, 0),
            (D3DRS_STENCILENABLE, 0),
            (D3DRS_SCISSORTESTENABLE, 0),
            (D3DRS_CULLMODE, D3DCULL_NONE.0 as u32),
            (D3DRS_FILLMODE, D3DFILL_SOLID.0 as u32),
            (D3DRS_ALPHATESTENABLE, 0),
            (D3DRS_ALPHABLENDENABLE, 1),
            (D3DRS_BLENDOP, D3DBLENDOP_ADD.0 as u32),
            (D3DRS_SRCBLEND, D3DBLEND_ONE.0 as u32),
            (D3DRS_DESTBLEND, D3DBLEND_INVSRCALPHA.0 as u32),
            (D3DRS_SEPARATEALPHABLENDENABLE, 0),
            (D3DRS_SRGBWRITEENABLE, 0),
            (D3DRS_COLORWRITEENABLE, 0xf),
        ];
        for (state, value) in render_states {
            device.SetRenderState(state, value)?;
        }

        device.SetTextureStageState(0, D3DTSS_COLOROP, D3DTOP_MODULATE.0 as u32)?;
        device.SetTextureStageState(0, D3DTSS_COLORARG1, D3DTA_TEXTURE as u32)?;
        device.SetTextureStageState(0, D3DTSS_COLORARG2, D3DTA_DIFFUSE as u32)?;
        device.SetTextureStageState(0, D3DTSS_ALPHAOP, D3DTOP_MODULATE.0 as u32)?;
        device.SetTextureStageState(0, D3DTSS_ALPHAARG1, D3DTA_TEXTURE as u32)?;
        device.SetTextureStageState(0, D3DTSS_ALPHAARG2, D3DTA_DIFFUSE as u32)?;
        device.SetTextureStageState(1, D3DTSS_COLOROP, D3DTOP_DISABLE.0 as u32)?;
        device.SetTextureStageState(1, D3DTSS_ALPHAOP, D3DTOP_DISABLE.0 as u32)?;
        device.SetSamplerState(0, D3DSAMP_MINFILTER, D3DTEXF_LINEAR.0 as u32)?;
        device.SetSamplerState(0, D3DSAMP_MAGFILTER, D3DTEXF_LINEAR.0 as u32)?;
        device.SetSamplerState(0, D3DSAMP_ADDRESSU, D3DTADDRESS_CLAMP.0 as u32)?;
        device.SetSamplerState(0, D3DSAMP_ADDRESSV, D3DTADDRESS_CLAMP.0 as u32)?;

        let stride = std::mem::size_of::<ScreenVertex>() as u32;
        for (key, range) in texture_runs(quads) {
            let Some(cached) = self.engine.resource(&key) else {
                continue;
            };
            device.SetTexture(0, &cached.texture)?;
            device.DrawPrimitiveUP(
                D3DPT_TRIANGLELIST,
                (range.len() * 2) as u32,
                vertices[range.start * 6..].as_ptr() as *const _,
                stride,
            )?;
        }
        device.SetTexture(0, None::<&IDirect3DBaseTexture9>)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::engine::QuadRect;
    use crate::vtable::DummyWindow;
    use framehook_core::overlay::{Color, Element, Overlay, Point, ResourceKey};
    use framehook_core::protocol::Size;
    use windows::core::Interface;

    fn hal_device(window: &DummyWindow) -> Option<IDirect3DDevice9> {
        let d3d = unsafe { Direct3DCreate9(D3D_SDK_VERSION) }?;
        let mut params = D3DPRESENT_PARAMETERS {
            BackBufferWidth: 64,
            BackBufferHeight: 64,
            BackBufferFormat: D3DFMT_X8R8G8B8,
            SwapEffect: D3DSWAPEFFECT_DISCARD,
            hDeviceWindow: window.hwnd(),
            Windowed: true.into(),
            EnableAutoDepthStencil: true.into(),
            AutoDepthStencilFormat: D3DFMT_D16,
            ..Default::default()
        };
        let mut device: Option<IDirect3DDevice9> = None;
        unsafe {
            d3d.CreateDevice(
                0,
                D3DDEVTYPE_HAL,
                window.hwnd(),
                D3DCREATE_SOFTWARE_VERTEXPROCESSING as u32,
                &mut params,
                &mut device,
            )
        }
        .ok()?;
        device
    }

    #[test]
    fn vertices_are_shifted_half_a_pixel() {
        let quad = Quad {
            key: ResourceKey::Image("logo".into()),
            dest: QuadRect {
                x: 10.0,
                y: 20.0,
                width: 4.0,
                height: 2.0,
            },
            uv: [0.0, 0.0, 1.0, 1.0],
            color: Color::WHITE,
        };
        let vertices = screen_vertices(&[quad]);
        assert_eq!(vertices.len(), 6);
        assert_eq!(vertices[0].pos, [9.5, 19.5, 0.0, 1.0]);
        assert_eq!(vertices[4].pos, [13.5, 21.5, 0.0, 1.0]);
        assert_eq!(vertices[0].diffuse, 0xffff_ffff);
    }

    #[test]
    fn host_surfaces_survive_overlay_draw() {
        let Ok(window) = DummyWindow::new() else {
            return;
        };
        let Some(device) = hal_device(&window) else {
            return;
        };
        let mut host_target: Option<IDirect3DSurface9> = None;
        let mut host_depth: Option<IDirect3DSurface9> = None;
        let host_viewport = D3DVIEWPORT9 {
            X: 2,
            Y: 3,
            Width: 20,
            Height: 10,
            MinZ: 0.0,
            MaxZ: 1.0,
        };
        unsafe {
            device
                .CreateRenderTarget(
                    32,
                    32,
                    D3DFMT_A8R8G8B8,
                    D3DMULTISAMPLE_NONE,
                    0,
                    false.into(),
                    &mut host_target,
                    std::ptr::null_mut(),
                )
                .unwrap();
            device
                .CreateDepthStencilSurface(
                    32,
                    32,
                    D3DFMT_D16,
                    D3DMULTISAMPLE_NONE,
                    0,
                    false.into(),
                    &mut host_depth,
                    std::ptr::null_mut(),
                )
                .unwrap();
            device.SetRenderTarget(0, host_target.as_ref()).unwrap();
            device.SetDepthStencilSurface(host_depth.as_ref()).unwrap();
            device.SetViewport(&host_viewport).unwrap();
        }

        let mut compositor = D3D9Compositor::new(device.clone());
        let frame = OverlayFrame {
            overlay: Some(Overlay::new(vec![Element::rectangle(Point::new(0, 0), 8, 8, Color::WHITE)])),
            version: 1,
            ..Default::default()
        };
        let signature = TargetSignature {
            identity: 1,
            size: Size::new(64, 64),
            version: 1,
        };
        unsafe {
            device.BeginScene().unwrap();
            compositor.draw(&frame, signature).unwrap();
            device.EndScene().unwrap();

            let target = device.GetRenderTarget(0).unwrap();
            assert_eq!(Some(target.as_raw()), host_target.as_ref().map(|s| s.as_raw()));
            let depth = device.GetDepthStencilSurface().unwrap();
            assert_eq!(Some(depth.as_raw()), host_depth.as_ref().map(|s| s.as_raw()));

            let mut viewport = D3DVIEWPORT9::default();
            device.GetViewport(&mut viewport).unwrap();
            assert_eq!(
                (viewport.X, viewport.Y, viewport.Width, viewport.Height),
                (2, 3, 20, 10)
            );
        }
    }
}
