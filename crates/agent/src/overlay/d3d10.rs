// Direct3D 10 compositor. Host state is kept in a full state block.
use super::engine::{
    quad_vertices, texture_runs, OverlayEngine, OverlayFrame, PipelineSlot, QuadVertex, ResourceFactory, TargetSignature,
};
use super::shader::{blob_bytes, compile_shader, PS_TARGET, QUAD_SHADER, VS_TARGET};
use super::text::GdiRasterizer;
use crate::backend::typed_format;
use anyhow::{anyhow, Result};
use windows::core::s;
use windows::Win32::Graphics::Direct3D::D3D10_PRIMITIVE_TOPOLOGY_TRIANGLELIST;
use windows::Win32::Graphics::Direct3D10::*;
use windows::Win32::Graphics::Dxgi::Common::*;

pub struct D3D10Factory {
    device: ID3D10Device,
}

impl ResourceFactory for D3D10Factory {
    type Texture = ID3D10ShaderResourceView;

    fn create_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<Self::Texture> {
        let desc = D3D10_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D10_USAGE_IMMUTABLE,
            BindFlags: D3D10_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let init = D3D10_SUBRESOURCE_DATA {
            pSysMem: rgba.as_ptr() as *const _,
            SysMemPitch: width * 4,
            SysMemSlicePitch: 0,
        };

        unsafe {
            let mut texture: Option<ID3D10Texture2D> = None;
            self.device.CreateTexture2D(&desc, Some(&init), Some(&mut texture))?;
            let texture = texture.ok_or_else(|| anyhow!("CreateTexture2D returned nothing"))?;
            let mut srv: Option<ID3D10ShaderResourceView> = None;
            self.device.CreateShaderResourceView(&texture, None, Some(&mut srv))?;
            srv.ok_or_else(|| anyhow!("CreateShaderResourceView returned nothing"))
        }
    }
}

struct Pipeline {
    vertex_shader: ID3D10VertexShader,
    pixel_shader: ID3D10PixelShader,
    input_layout: ID3D10InputLayout,
    blend_state: ID3D10BlendState,
    sampler_state: ID3D10SamplerState,
    rasterizer_state: ID3D10RasterizerState,
    depth_state: ID3D10DepthStencilState,
    state_block: ID3D10StateBlock,
    vertex_buffer: Option<ID3D10Buffer>,
    vertex_capacity: usize,
}

impl Pipeline {
    unsafe fn new(device: &ID3D10Device) -> Result<Self> {
        let vs_blob = compile_shader(QUAD_SHADER, "VS_Main", VS_TARGET)?;
        let ps_blob = compile_shader(QUAD_SHADER, "PS_Main", PS_TARGET)?;

        let mut vertex_shader: Option<ID3D10VertexShader> = None;
        device.CreateVertexShader(blob_bytes(&vs_blob), Some(&mut vertex_shader))?;
        let mut pixel_shader: Option<ID3D10PixelShader> = None;
        device.CreatePixelShader(blob_bytes(&ps_blob), Some(&mut pixel_shader))?;

        let element = |name, format, offset| D3D10_INPUT_ELEMENT_DESC {
            SemanticName: name,
            SemanticIndex: 0,
            Format: format,
            InputSlot: 0,
            AlignedByteOffset: offset,
            InputSlotClass: D3D10_INPUT_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        };
        let input_elements = [
            element(s!("POSITION"), DXGI_FORMAT_R32G32_FLOAT, 0),
            element(s!("TEXCOORD"), DXGI_FORMAT_R32G32_FLOAT, 8),
            element(s!("COLOR"), DXGI_FORMAT_R32G32B32A32_FLOAT, 16),
        ];
        let mut input_layout: Option<ID3D10InputLayout> = None;
        device.CreateInputLayout(&input_elements, blob_bytes(&vs_blob), Some(&mut input_layout))?;

        let mut blend_enable = [windows::core::BOOL::default(); 8];
        blend_enable[0] = true.into();
        let mut write_mask = [0u8; 8];
        write_mask[0] = D3D10_COLOR_WRITE_ENABLE_ALL.0 as u8;
        let blend_desc = D3D10_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            BlendEnable: blend_enable,
            SrcBlend: D3D10_BLEND_ONE,
            DestBlend: D3D10_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D10_BLEND_OP_ADD,
            SrcBlendAlpha: D3D10_BLEND_ONE,
            DestBlendAlpha: D3D10_BLEND_INV_SRC_ALPHA,
            BlendOpAlpha: D3D10_BLEND_OP_ADD,
            RenderTargetWriteMask: write_mask,
        };
        let mut blend_state: Option<ID3D10BlendState> = None;
        device.CreateBlendState(&blend_desc, Some(&mut blend_state))?;

        let sampler_desc = D3D10_SAMPLER_DESC {
            Filter: D3D10_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D10_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D10_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D10_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D10_COMPARISON_NEVER,
            BorderColor: [0.0, 0.0, 0.0, 0.0],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        let mut sampler_state: Option<ID3D10SamplerState> = None;
        device.CreateSamplerState(&sampler_desc, Some(&mut sampler_state))?;

        let rasterizer_desc = D3D10_RASTERIZER_DESC {
            FillMode: D3D10_FILL_SOLID,
            CullMode: D3D10_CULL_NONE,
            DepthClipEnable: true.into(),
            ..Default::default()
        };
        let mut rasterizer_state: Option<ID3D10RasterizerState> = None;
        device.CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer_state))?;

        let depth_desc = D3D10_DEPTH_STENCIL_DESC {
            DepthEnable: false.into(),
            DepthWriteMask: D3D10_DEPTH_WRITE_MASK_ZERO,
            DepthFunc: D3D10_COMPARISON_ALWAYS,
            StencilEnable: false.into(),
            ..Default::default()
        };
        let mut depth_state: Option<ID3D10DepthStencilState> = None;
        device.CreateDepthStencilState(&depth_desc, Some(&mut depth_state))?;

        let mut mask = D3D10_STATE_BLOCK_MASK::default();
        D3D10StateBlockMaskEnableAll(&mut mask)?;
        let state_block = D3D10CreateStateBlock(device, &mask)?;

        let missing = || anyhow!("Direct3D 10 returned no object while building the overlay pipeline");
        Ok(Self {
            vertex_shader: vertex_shader.ok_or_else(missing)?,
            pixel_shader: pixel_shader.ok_or_else(missing)?,
            input_layout: input_layout.ok_or_else(missing)?,
            blend_state: blend_state.ok_or_else(missing)?,
            sampler_state: sampler_state.ok_or_else(missing)?,
            rasterizer_state: rasterizer_state.ok_or_else(missing)?,
            depth_state: depth_state.ok_or_else(missing)?,
            state_block,
            vertex_buffer: None,
            vertex_capacity: 0,
        })
    }

    unsafe fn upload(&mut self, device: &ID3D10Device, vertices: &[QuadVertex]) -> Result<ID3D10Buffer> {
        if self.vertex_buffer.is_none() || self.vertex_capacity < vertices.len() {
            let capacity = vertices.len().next_power_of_two().max(256);
            let desc = D3D10_BUFFER_DESC {
                ByteWidth: (capacity * std::mem::size_of::<QuadVertex>()) as u32,
                Usage: D3D10_USAGE_DYNAMIC,
                BindFlags: D3D10_BIND_VERTEX_BUFFER.0 as u32,
                CPUAccessFlags: D3D10_CPU_ACCESS_WRITE.0 as u32,
                MiscFlags: 0,
            };
            let mut buffer: Option<ID3D10Buffer> = None;
            device.CreateBuffer(&desc, None, Some(&mut buffer))?;
            self.vertex_buffer = buffer;
            self.vertex_capacity = capacity;
        }
        let buffer = self.vertex_buffer.clone().ok_or_else(|| anyhow!("CreateBuffer returned nothing"))?;

        let mut data = std::ptr::null_mut();
        buffer.Map(D3D10_MAP_WRITE_DISCARD, 0, &mut data)?;
        std::ptr::copy_nonoverlapping(vertices.as_ptr(), data as *mut QuadVertex, vertices.len());
        buffer.Unmap();
        Ok(buffer)
    }
}

fn render_target_desc(desc: &D3D10_TEXTURE2D_DESC) -> D3D10_RENDER_TARGET_VIEW_DESC {
    if desc.SampleDesc.Count > 1 {
        D3D10_RENDER_TARGET_VIEW_DESC {
            Format: typed_format(desc.Format),
            ViewDimension: D3D10_RTV_DIMENSION_TEXTURE2DMS,
            Anonymous: D3D10_RENDER_TARGET_VIEW_DESC_0 {
                Texture2DMS: D3D10_TEX2DMS_RTV::default(),
            },
        }
    } else {
        D3D10_RENDER_TARGET_VIEW_DESC {
            Format: typed_format(desc.Format),
            ViewDimension: D3D10_RTV_DIMENSION_TEXTURE2D,
            Anonymous: D3D10_RENDER_TARGET_VIEW_DESC_0 {
                Texture2D: D3D10_TEX2D_RTV { MipSlice: 0 },
            },
        }
    }
}

pub struct D3D10Compositor {
    device: ID3D10Device,
    factory: D3D10Factory,
    engine: OverlayEngine<D3D10Factory>,
    rasterizer: GdiRasterizer,
    pipeline: PipelineSlot<Pipeline>,
}

impl D3D10Compositor {
    pub fn new(device: ID3D10Device) -> Self {
        Self {
            factory: D3D10Factory { device: device.clone() },
            device,
            engine: OverlayEngine::new(),
            rasterizer: GdiRasterizer,
            pipeline: PipelineSlot::default(),
        }
    }

    pub fn invalidate(&mut self) {
        self.engine.invalidate();
    }

    pub fn draw(&mut self, frame: &OverlayFrame, backbuffer: &ID3D10Texture2D, signature: TargetSignature) -> Result<()> {
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
            let buffer = pipeline.upload(&self.device, &vertices)?;

            let mut desc = D3D10_TEXTURE2D_DESC::default();
            backbuffer.GetDesc(&mut desc);
            let mut rtv: Option<ID3D10RenderTargetView> = None;
            self.device
                .CreateRenderTargetView(backbuffer, Some(&render_target_desc(&desc)), Some(&mut rtv))?;

            pipeline.state_block.Capture()?;
            let device = &self.device;

            device.OMSetRenderTargets(Some(&[rtv]), None);
            device.RSSetViewports(Some(&[D3D10_VIEWPORT {
                TopLeftX: 0,
                TopLeftY: 0,
                Width: signature.size.width,
                Height: signature.size.height,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
            device.RSSetState(&pipeline.rasterizer_state);
            device.OMSetBlendState(&pipeline.blend_state, &[0.0; 4], 0xffff_ffff);
            device.OMSetDepthStencilState(&pipeline.depth_state, 0);
            device.IASetInputLayout(&pipeline.input_layout);
            device.IASetPrimitiveTopology(D3D10_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            let stride = std::mem::size_of::<QuadVertex>() as u32;
            let offset = 0u32;
            device.IASetVertexBuffers(0, 1, Some(&Some(buffer)), Some(&stride), Some(&offset));
            device.VSSetShader(&pipeline.vertex_shader);
            device.GSSetShader(None::<&ID3D10GeometryShader>);
            device.PSSetShader(&pipeline.pixel_shader);
            device.PSSetSamplers(0, Some(&[Some(pipeline.sampler_state.clone())]));

            for (key, range) in texture_runs(&quads) {
                let Some(cached) = self.engine.resource(&key) else {
                    continue;
                };
                device.PSSetShaderResources(0, Some(&[Some(cached.texture.clone())]));
                device.Draw((range.len() * 6) as u32, (range.start * 6) as u32);
            }

            pipeline.state_block.Apply()?;
        }
        Ok(())
    }
}
