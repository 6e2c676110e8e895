// Textured, tinted quad shared by the Direct3D 10 and 11 compositors.
// Textures and vertex colors are both premultiplied, so the product is too.
use anyhow::{anyhow, Result};
use windows::core::PCSTR;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_ENABLE_STRICTNESS};
use windows::Win32::Graphics::Direct3D::ID3DBlob;

pub const QUAD_SHADER: &str = r#"
Texture2D overlay_texture : register(t0);
SamplerState overlay_sampler : register(s0);

struct VS_INPUT {
    float2 pos : POSITION;
    float2 uv : TEXCOORD0;
    float4 color : COLOR0;
};

struct PS_INPUT {
    float4 pos : SV_POSITION;
    float2 uv : TEXCOORD0;
    float4 color : COLOR0;
};

PS_INPUT VS_Main(VS_INPUT input) {
    PS_INPUT output;
    output.pos = float4(input.pos, 0.0, 1.0);
    output.uv = input.uv;
    output.color = input.color;
    return output;
}

float4 PS_Main(PS_INPUT input) : SV_TARGET {
    return overlay_texture.Sample(overlay_sampler, input.uv) * input.color;
}
"#;

/// Shader model 4 runs on both 10.0 and 11 devices.
pub const VS_TARGET: &str = "vs_4_0";
pub const PS_TARGET: &str = "ps_4_0";

pub fn compile_shader(source: &str, entry_point: &str, target: &str) -> Result<ID3DBlob> {
    let mut blob: Option<ID3DBlob> = None;
    let mut error_blob: Option<ID3DBlob> = None;

    let entry_cstr = std::ffi::CString::new(entry_point)?;
    let target_cstr = std::ffi::CString::new(target)?;

    let result = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            PCSTR(entry_cstr.as_ptr() as *const u8),
            PCSTR(target_cstr.as_ptr() as *const u8),
            D3DCOMPILE_ENABLE_STRICTNESS,
            0,
            &mut blob,
            Some(&mut error_blob),
        )
    };

    if result.is_err() {
        if let Some(error_blob) = error_blob {
            let error_msg = unsafe { blob_bytes(&error_blob) };
            return Err(anyhow!("Shader compilation failed: {}", String::from_utf8_lossy(error_msg)));
        }
        return Err(anyhow!("Shader compilation failed"));
    }

    blob.ok_or_else(|| anyhow!("Shader compiler returned no bytecode for {}", entry_point))
}

/// # Safety
/// The slice borrows the blob's buffer and must not outlive it.
pub unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}
