// Direct3D 11 compositor: one dynamic vertex buffer, one draw per texture run.
use super::engine::{
    quad_vertices, texture_runs, OverlayEngine, OverlayFrame, PipelineSlot, QuadVertex, ResourceFactory, TargetSignature,
};
use super::shader::{blob_bytes, compile_shader, PS_TARGET, QUAD_SHADER, VS_TARGET};
use super::text::GdiRasterizer;
use crate::backend::typed_format;
use anyhow::{anyhow, Result};
use windows::core::s;
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::{D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST, D3D_PRIMITIVE_TOPOLOGY};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

pub struct D3D11Factory {
    device: ID3D11Device,
}

impl ResourceFactory for D3D11Factory {
    type Texture = ID3D11ShaderResourceView;

    fn create_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<Self::Texture> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let init = D3D11_SUBRESOURCE_DATA {
            pSysMem: rgba.as_ptr() as *const _,
            SysMemPitch: width * 4,
            SysMemSlicePitch: 0,
        };

        unsafe {
            let mut texture: Option<ID3D11Texture2D> = None;
            self.device.CreateTexture2D(&desc, Some(&init), Some(&mut texture))?;
            let texture = texture.ok_or_else(|| anyhow!("CreateTexture2D returned nothing"))?;
            let mut srv: Option<ID3D11ShaderResourceView> = None;
            self.device.CreateShaderResourceView(&texture, None, Some(&mut srv))?;
            srv.ok_or_else(|| anyhow!("CreateShaderResourceView returned nothing"))
        }
    }
}

struct Pipeline {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    input_layout: ID3D11InputLayout,
    blend_state: ID3D11BlendState,
    sampler_state: ID3D11SamplerState,
    rasterizer_state: ID3D11RasterizerState,
    depth_state: ID3D11DepthStencilState,
    vertex_buffer: Option<ID3D11Buffer>,
    vertex_capacity: usize,
}

impl Pipeline {
    unsafe fn new(device: &ID3D11Device) -> Result<Self> {
        let vs_blob = compile_shader(QUAD_SHADER, "VS_Main", VS_TARGET)?;
        let ps_blob = compile_shader(QUAD_SHADER, "PS_Main", PS_TARGET)?;

        let mut vertex_shader: Option<ID3D11VertexShader> = None;
        device.CreateVertexShader(blob_bytes(&vs_blob), None, Some(&mut vertex_shader))?;
        let mut pixel_shader: Option<ID3D11PixelShader> = None;
        device.CreatePixelShader(blob_bytes(&ps_blob), None, Some(&mut pixel_shader))?;

        let input_elements = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 8,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("COLOR"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 16,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];
        let mut input_layout: Option<ID3D11InputLayout> = None;
        device.CreateInputLayout(&input_elements, blob_bytes(&vs_blob), Some(&mut input_layout))?;

        // Straight-alpha texels are premultiplied on upload
        let mut blend_desc = D3D11_BLEND_DESC::default();
        blend_desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            SrcBlend: D3D11_BLEND_ONE,
            DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D11_BLEND_OP_ADD,
            SrcBlendAlpha: D3D11_BLEND_ONE,
            DestBlendAlpha: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOpAlpha: D3D11_BLEND_OP_ADD,
            RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
        };
        let mut blend_state: Option<ID3D11BlendState> = None;
        device.CreateBlendState(&blend_desc, Some(&mut blend_state))?;

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0, 0.0, 0.0, 0.0],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        let mut sampler_state: Option<ID3D11SamplerState> = None;
        device.CreateSamplerState(&sampler_desc, Some(&mut sampler_state))?;

        let rasterizer_desc = D3D11_RASTERIZER_DESC {
            FillMode: D3D11_FILL_SOLID,
            CullMode: D3D11_CULL_NONE,
            DepthClipEnable: true.into(),
            ..Default::default()
        };
        let mut rasterizer_state: Option<ID3D11RasterizerState> = None;
        device.CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer_state))?;

        let depth_desc = D3D11_DEPTH_STENCIL_DESC {
            DepthEnable: false.into(),
            DepthWriteMask: D3D11_DEPTH_WRITE_MASK_ZERO,
            DepthFunc: D3D11_COMPARISON_ALWAYS,
            StencilEnable: false.into(),
            ..Default::default()
        };
        let mut depth_state: Option<ID3D11DepthStencilState> = None;
        device.CreateDepthStencilState(&depth_desc, Some(&mut depth_state))?;

        let missing = || anyhow!("Direct3D 11 returned no object while building the overlay pipeline");
        Ok(Self {
            vertex_shader: vertex_shader.ok_or_else(missing)?,
            pixel_shader: pixel_shader.ok_or_else(missing)?,
            input_layout: input_layout.ok_or_else(missing)?,
            blend_state: blend_state.ok_or_else(missing)?,
            sampler_state: sampler_state.ok_or_else(missing)?,
            rasterizer_state: rasterizer_state.ok_or_else(missing)?,
            depth_state: depth_state.ok_or_else(missing)?,
            vertex_buffer: None,
            vertex_capacity: 0,
        })
    }

    unsafe fn upload(&mut self, device: &ID3D11Device, context: &ID3D11DeviceContext, vertices: &[QuadVertex]) -> Result<ID3D11Buffer> {
        if self.vertex_buffer.is_none() || self.vertex_capacity < vertices.len() {
            let capacity = vertices.len().next_power_of_two().max(256);
            let desc = D3D11_BUFFER_DESC {
                ByteWidth: (capacity * std::mem::size_of::<QuadVertex>()) as u32,
                Usage: D3D11_USAGE_DYNAMIC,
                BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
                CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
                MiscFlags: 0,
                StructureByteStride: 0,
            };
            let mut buffer: Option<ID3D11Buffer> = None;
            device.CreateBuffer(&desc, None, Some(&mut buffer))?;
            self.vertex_buffer = buffer;
            self.vertex_capacity = capacity;
        }
        let buffer = self.vertex_buffer.clone().ok_or_else(|| anyhow!("CreateBuffer returned nothing"))?;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        context.Map(&buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))?;
        std::ptr::copy_nonoverlapping(vertices.as_ptr(), mapped.pData as *mut QuadVertex, vertices.len());
        context.Unmap(&buffer, 0);
        Ok(buffer)
    }
}

const RENDER_TARGETS: usize = D3D11_SIMULTANEOUS_RENDER_TARGET_COUNT as usize;
const VIEWPORTS: usize = D3D11_VIEWPORT_AND_SCISSORRECT_OBJECT_COUNT_PER_PIPELINE as usize;

/// Immediate-context state the overlay overwrites or could be affected by.
#[derive(Default)]
struct SavedState {
    input_layout: Option<ID3D11InputLayout>,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    vertex_buffer: [Option<ID3D11Buffer>; 1],
    stride: [u32; 1],
    offset: [u32; 1],
    vertex_shader: Option<ID3D11VertexShader>,
    hull_shader: Option<ID3D11HullShader>,
    domain_shader: Option<ID3D11DomainShader>,
    geometry_shader: Option<ID3D11GeometryShader>,
    pixel_shader: Option<ID3D11PixelShader>,
    shader_resource: [Option<ID3D11ShaderResourceView>; 1],
    sampler: [Option<ID3D11SamplerState>; 1],
    blend_state: Option<ID3D11BlendState>,
    blend_factor: [f32; 4],
    sample_mask: u32,
    depth_state: Option<ID3D11DepthStencilState>,
    stencil_ref: u32,
    render_targets: [Option<ID3D11RenderTargetView>; RENDER_TARGETS],
    depth_view: Option<ID3D11DepthStencilView>,
    rasterizer_state: Option<ID3D11RasterizerState>,
    viewports: [D3D11_VIEWPORT; VIEWPORTS],
    viewport_count: u32,
    scissors: [RECT; VIEWPORTS],
    scissor_count: u32,
}

impl SavedState {
    unsafe fn capture(context: &ID3D11DeviceContext) -> Self {
        let mut state = Self::default();
        context.IAGetInputLayout(&mut state.input_layout);
        context.IAGetPrimitiveTopology(&mut state.topology);
        context.IAGetVertexBuffers(
            0,
            1,
            Some(state.vertex_buffer.as_mut_ptr()),
            Some(state.stride.as_mut_ptr()),
            Some(state.offset.as_mut_ptr()),
        );
        context.VSGetShader(&mut state.vertex_shader, None, None);
        context.HSGetShader(&mut state.hull_shader, None, None);
        context.DSGetShader(&mut state.domain_shader, None, None);
        context.GSGetShader(&mut state.geometry_shader, None, None);
        context.PSGetShader(&mut state.pixel_shader, None, None);
        context.PSGetShaderResources(0, Some(&mut state.shader_resource));
        context.PSGetSamplers(0, Some(&mut state.sampler));
        context.OMGetBlendState(
            Some(&mut state.blend_state),
            Some(&mut state.blend_factor as _),
            Some(&mut state.sample_mask),
        );
        context.OMGetDepthStencilState(Some(&mut state.depth_state), Some(&mut state.stencil_ref));
        context.OMGetRenderTargets(Some(&mut state.render_targets), Some(&mut state.depth_view));
        context.RSGetState(&mut state.rasterizer_state);
        state.viewport_count = VIEWPORTS as u32;
        context.RSGetViewports(&mut state.viewport_count, Some(state.viewports.as_mut_ptr()));
        state.scissor_count = VIEWPORTS as u32;
        context.RSGetScissorRects(&mut state.scissor_count, Some(state.scissors.as_mut_ptr()));
        state
    }

    unsafe fn restore(self, context: &ID3D11DeviceContext) {
        context.IASetInputLayout(self.input_layout.as_ref());
        context.IASetPrimitiveTopology(self.topology);
        context.IASetVertexBuffers(
            0,
            1,
            Some(self.vertex_buffer.as_ptr()),
            Some(self.stride.as_ptr()),
            Some(self.offset.as_ptr()),
        );
        context.VSSetShader(self.vertex_shader.as_ref(), None);
        context.HSSetShader(self.hull_shader.as_ref(), None);
        context.DSSetShader(self.domain_shader.as_ref(), None);
        context.GSSetShader(self.geometry_shader.as_ref(), None);
        context.PSSetShader(self.pixel_shader.as_ref(), None);
        context.PSSetShaderResources(0, Some(&self.shader_resource));
        context.PSSetSamplers(0, Some(&self.sampler));
        context.OMSetBlendState(self.blend_state.as_ref(), Some(&self.blend_factor as _), self.sample_mask);
        context.OMSetDepthStencilState(self.depth_state.as_ref(), self.stencil_ref);
        context.OMSetRenderTargets(Some(&self.render_targets), self.depth_view.as_ref());
        context.RSSetState(self.rasterizer_state.as_ref());
        context.RSSetViewports(Some(&self.viewports[..self.viewport_count as usize]));
        context.RSSetScissorRects(Some(&self.scissors[..self.scissor_count as usize]));
    }
}

/// View over the backbuffer with a concrete format; typeless swap chain
/// buffers reject a view created without one.
fn render_target_desc(desc: &D3D11_TEXTURE2D_DESC) -> D3D11_RENDER_TARGET_VIEW_DESC {
    if desc.SampleDesc.Count > 1 {
        D3D11_RENDER_TARGET_VIEW_DESC {
            Format: typed_format(desc.Format),
            ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2DMS,
            Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
                Texture2DMS: D3D11_TEX2DMS_RTV::default(),
            },
        }
    } else {
        D3D11_RENDER_TARGET_VIEW_DESC {
            Format: typed_format(desc.Format),
            ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2D,
            Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
                Texture2D: D3D11_TEX2D_RTV { MipSlice: 0 },
            },
        }
    }
}

pub struct D3D11Compositor {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    factory: D3D11Factory,
    engine: OverlayEngine<D3D11Factory>,
    rasterizer: GdiRasterizer,
    pipeline: PipelineSlot<Pipeline>,
}

impl D3D11Compositor {
    pub fn new(device: ID3D11Device, context: ID3D11DeviceContext) -> Self {
        Self {
            factory: D3D11Factory { device: device.clone() },
            device,
            context,
            engine: OverlayEngine::new(),
            rasterizer: GdiRasterizer,
            pipeline: PipelineSlot::default(),
        }
    }

    /// Drops cached textures; they are rebuilt on the next draw.
    pub fn invalidate(&mut self) {
        self.engine.invalidate();
    }

    pub fn draw(&mut self, frame: &OverlayFrame, backbuffer: &ID3D11Texture2D, signature: TargetSignature) -> Result<()> {
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
        let vertices = quad_vertices(&quads, signature.size);

        let device = &self.device;
        let Some(pipeline) = self.pipeline.get_or_try_init(|| unsafe { Pipeline::new(device) })? else {
            return Ok(());
        };

        unsafe {
            let buffer = pipeline.upload(&self.device, &self.context, &vertices)?;

            // Created per frame: a view held across Present would keep the
            // swap chain buffer referenced and make the host's ResizeBuffers fail.
            let mut desc = D3D11_TEXTURE2D_DESC::default();
            backbuffer.GetDesc(&mut desc);
            let mut rtv: Option<ID3D11RenderTargetView> = None;
            self.device
                .CreateRenderTargetView(backbuffer, Some(&render_target_desc(&desc)), Some(&mut rtv))?;

            let saved = SavedState::capture(&self.context);
            let context = &self.context;
            let (width, height) = (signature.size.width, signature.size.height);

            context.OMSetRenderTargets(Some(&[rtv]), None);
            context.RSSetViewports(Some(&[D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: width as f32,
                Height: height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
            context.RSSetScissorRects(Some(&[RECT {
                left: 0,
                top: 0,
                right: width as i32,
                bottom: height as i32,
            }]));
            context.RSSetState(&pipeline.rasterizer_state);
            context.OMSetBlendState(&pipeline.blend_state, Some(&[0.0f32; 4] as _), 0xffff_ffff);
            context.OMSetDepthStencilState(&pipeline.depth_state, 0);
            context.IASetInputLayout(&pipeline.input_layout);
            context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            let stride = std::mem::size_of::<QuadVertex>() as u32;
            let offset = 0u32;
            context.IASetVertexBuffers(0, 1, Some(&Some(buffer)), Some(&stride), Some(&offset));
            context.VSSetShader(&pipeline.vertex_shader, None);
            context.HSSetShader(None::<&ID3D11HullShader>, None);
            context.DSSetShader(None::<&ID3D11DomainShader>, None);
            context.GSSetShader(None::<&ID3D11GeometryShader>, None);
            context.PSSetShader(&pipeline.pixel_shader, None);
            context.PSSetSamplers(0, Some(&[Some(pipeline.sampler_state.clone())]));

            for (key, range) in texture_runs(&quads) {
                let Some(cached) = self.engine.resource(&key) else {
                    continue;
                };
                context.PSSetShaderResources(0, Some(&[Some(cached.texture.clone())]));
                context.Draw((range.len() * 6) as u32, (range.start * 6) as u32);
            }

            saved.restore(context);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framehook_core::overlay::{Color, Element, Overlay, Point};
    use framehook_core::protocol::Size;
    use windows::core::Interface;
    use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_WARP;

    const GS_SOURCE: &str = r#"
        struct V { float4 pos : SV_Position; };
        [maxvertexcount(3)]
        void GS_Main(triangle V input[3], inout TriangleStream<V> output) {
            for (int i = 0; i < 3; i++) output.Append(input[i]);
        }
    "#;

    fn warp_device() -> Option<(ID3D11Device, ID3D11DeviceContext)> {
        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_WARP,
                None,
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .ok()?;
        }
        Some((device?, context?))
    }

    fn render_target(device: &ID3D11Device, format: DXGI_FORMAT) -> ID3D11Texture2D {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: 64,
            Height: 64,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_RENDER_TARGET.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let mut texture = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }.unwrap();
        texture.unwrap()
    }

    fn view(device: &ID3D11Device, texture: &ID3D11Texture2D) -> ID3D11RenderTargetView {
        let mut rtv = None;
        unsafe { device.CreateRenderTargetView(texture, None, Some(&mut rtv)) }.unwrap();
        rtv.unwrap()
    }

    #[test]
    fn typeless_backbuffer_gets_typed_view() {
        let desc = D3D11_TEXTURE2D_DESC {
            Format: DXGI_FORMAT_B8G8R8A8_TYPELESS,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 4, Quality: 0 },
            ..Default::default()
        };
        let view = render_target_desc(&desc);
        assert_eq!(view.Format, DXGI_FORMAT_B8G8R8A8_UNORM);
        assert_eq!(view.ViewDimension, D3D11_RTV_DIMENSION_TEXTURE2DMS);
    }

    #[test]
    fn host_pipeline_survives_overlay_draw() {
        let Some((device, context)) = warp_device() else {
            return;
        };
        let backbuffer = render_target(&device, DXGI_FORMAT_R8G8B8A8_TYPELESS);
        let host_targets = [
            view(&device, &render_target(&device, DXGI_FORMAT_R8G8B8A8_UNORM)),
            view(&device, &render_target(&device, DXGI_FORMAT_R8G8B8A8_UNORM)),
        ];
        let blob = compile_shader(GS_SOURCE, "GS_Main", "gs_4_0").unwrap();
        let mut geometry_shader = None;
        let host_scissor = RECT {
            left: 3,
            top: 4,
            right: 20,
            bottom: 30,
        };

        unsafe {
            device
                .CreateGeometryShader(blob_bytes(&blob), None, Some(&mut geometry_shader))
                .unwrap();
            context.OMSetRenderTargets(Some(&[Some(host_targets[0].clone()), Some(host_targets[1].clone())]), None);
            context.GSSetShader(geometry_shader.as_ref(), None);
            context.RSSetScissorRects(Some(&[host_scissor]));
        }

        let mut compositor = D3D11Compositor::new(device.clone(), context.clone());
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
        compositor.draw(&frame, &backbuffer, signature).unwrap();

        unsafe {
            let mut targets: [Option<ID3D11RenderTargetView>; RENDER_TARGETS] = Default::default();
            context.OMGetRenderTargets(Some(&mut targets), None);
            assert_eq!(targets[0].as_ref().map(|v| v.as_raw()), Some(host_targets[0].as_raw()));
            assert_eq!(targets[1].as_ref().map(|v| v.as_raw()), Some(host_targets[1].as_raw()));

            let mut bound_gs = None;
            context.GSGetShader(&mut bound_gs, None, None);
            assert_eq!(bound_gs.map(|s| s.as_raw()), geometry_shader.map(|s| s.as_raw()));

            let mut count = VIEWPORTS as u32;
            let mut scissors = [RECT::default(); VIEWPORTS];
            context.RSGetScissorRects(&mut count, Some(scissors.as_mut_ptr()));
            assert_eq!(count, 1);
            assert_eq!(scissors[0], host_scissor);
        }
    }
}
