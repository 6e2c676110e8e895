use framehook_core::overlay::FontSpec;
use std::collections::HashMap;

/// Printable ASCII; anything else renders as `?`.
pub fn atlas_chars() -> Vec<char> {
    (' '..='~').collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Glyph {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub advance: u32,
}

/// Glyph metrics of a rasterized atlas.
#[derive(Debug, Clone, Default)]
pub struct GlyphMetrics {
    pub line_height: u32,
    pub glyphs: HashMap<char, Glyph>,
}

impl GlyphMetrics {
    pub fn glyph(&self, c: char) -> Option<&Glyph> {
        self.glyphs.get(&c).or_else(|| self.glyphs.get(&'?'))
    }

    pub fn measure(&self, text: &str) -> (u32, u32) {
        let mut widest = 0;
        let mut lines = 1;
        let mut width = 0;
        for c in text.chars() {
            if c == '\n' {
                widest = widest.max(width);
                width = 0;
                lines += 1;
                continue;
            }
            width += self.glyph(c).map(|g| g.advance).unwrap_or(0);
        }
        (widest.max(width), lines * self.line_height)
    }
}

/// Premultiplied RGBA atlas plus the metrics to address it.
#[derive(Debug, Clone)]
pub struct GlyphAtlas {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub metrics: GlyphMetrics,
}

pub trait TextRasterizer {
    fn rasterize(&mut self, font: &FontSpec, chars: &[char]) -> anyhow::Result<GlyphAtlas>;
}

/// Lays glyph cells out in rows no wider than `max_width`.
pub fn pack_cells(sizes: &[(char, u32, u32)], max_width: u32) -> (HashMap<char, Glyph>, u32, u32) {
    const PADDING: u32 = 1;
    let mut glyphs = HashMap::with_capacity(sizes.len());
    let (mut x, mut y, mut row_height, mut width) = (PADDING, PADDING, 0u32, 0u32);

    for &(c, w, h) in sizes {
        if x + w + PADDING > max_width && x > PADDING {
            x = PADDING;
            y += row_height + PADDING;
            row_height = 0;
        }
        glyphs.insert(
            c,
            Glyph {
                x,
                y,
                width: w,
                height: h,
                advance: w,
            },
        );
        x += w + PADDING;
        row_height = row_height.max(h);
        width = width.max(x);
    }

    (glyphs, width.max(1), y + row_height + PADDING)
}

#[cfg(windows)]
pub use gdi::GdiRasterizer;

#[cfg(windows)]
mod gdi {
    use super::*;
    use anyhow::Context;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::SIZE;
    use windows::Win32::Graphics::Gdi::*;

    const ATLAS_WIDTH: u32 = 512;

    /// Draws glyphs with GDI into a 32-bit DIB. White text on black gives
    /// coverage in the color channels, which becomes alpha.
    #[derive(Default)]
    pub struct GdiRasterizer;

    struct DcGuard(HDC);

    impl Drop for DcGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = DeleteDC(self.0);
            }
        }
    }

    struct ObjectGuard(HGDIOBJ);

    impl Drop for ObjectGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = DeleteObject(self.0);
            }
        }
    }

    impl TextRasterizer for GdiRasterizer {
        fn rasterize(&mut self, font: &FontSpec, chars: &[char]) -> anyhow::Result<GlyphAtlas> {
            unsafe {
                let dc = CreateCompatibleDC(None);
                if dc.is_invalid() {
                    anyhow::bail!("CreateCompatibleDC failed");
                }
                let dc = DcGuard(dc);

                let face: Vec<u16> = font.name.encode_utf16().chain(std::iter::once(0)).collect();
                let quality = if font.antialias { ANTIALIASED_QUALITY } else { NONANTIALIASED_QUALITY };
                let hfont = CreateFontW(
                    -(font.size as i32),
                    0,
                    0,
                    0,
                    if font.bold { FW_BOLD.0 as i32 } else { FW_NORMAL.0 as i32 },
                    font.italic as u32,
                    0,
                    0,
                    DEFAULT_CHARSET,
                    OUT_DEFAULT_PRECIS,
                    CLIP_DEFAULT_PRECIS,
                    quality,
                    (DEFAULT_PITCH.0 | FF_DONTCARE.0) as u32,
                    PCWSTR(face.as_ptr()),
                );
                if hfont.is_invalid() {
                    anyhow::bail!("CreateFontW failed for {}", font.name);
                }
                let hfont = ObjectGuard(hfont.into());
                SelectObject(dc.0, hfont.0);

                let mut metrics = TEXTMETRICW::default();
                let _ = GetTextMetricsW(dc.0, &mut metrics);
                let line_height = metrics.tmHeight.max(1) as u32;

                let mut sizes = Vec::with_capacity(chars.len());
                for &c in chars {
                    let mut buf = [0u16; 2];
                    let encoded = c.encode_utf16(&mut buf);
                    let mut size = SIZE::default();
                    let _ = GetTextExtentPoint32W(dc.0, encoded, &mut size);
                    sizes.push((c, size.cx.max(1) as u32, line_height));
                }
                let (glyphs, width, height) = pack_cells(&sizes, ATLAS_WIDTH);

                let info = BITMAPINFO {
                    bmiHeader: BITMAPINFOHEADER {
                        biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                        biWidth: width as i32,
                        biHeight: -(height as i32),
                        biPlanes: 1,
                        biBitCount: 32,
                        biCompression: BI_RGB.0,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let mut bits: *mut std::ffi::c_void = std::ptr::null_mut();
                let dib = CreateDIBSection(Some(dc.0), &info, DIB_RGB_COLORS, &mut bits, None, 0)
                    .context("CreateDIBSection failed")?;
                let dib = ObjectGuard(dib.into());
                SelectObject(dc.0, dib.0);

                SetBkMode(dc.0, TRANSPARENT);
                SetTextColor(dc.0, windows::Win32::Foundation::COLORREF(0x00ff_ffff));

                for &c in chars {
                    if let Some(glyph) = glyphs.get(&c) {
                        let mut buf = [0u16; 2];
                        let encoded = c.encode_utf16(&mut buf);
                        let _ = TextOutW(dc.0, glyph.x as i32, glyph.y as i32, encoded);
                    }
                }
                let _ = GdiFlush();

                let byte_len = (width * height * 4) as usize;
                let src = std::slice::from_raw_parts(bits as *const u8, byte_len);
                let mut pixels = Vec::with_capacity(byte_len);
                for px in src.chunks_exact(4) {
                    let coverage = px[0].max(px[1]).max(px[2]);
                    pixels.extend_from_slice(&[coverage, coverage, coverage, coverage]);
                }

                Ok(GlyphAtlas {
                    width,
                    height,
                    pixels,
                    metrics: GlyphMetrics { line_height, glyphs },
                })
            }
        }
    }
}
