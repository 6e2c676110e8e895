//! Device-independent half of the compositor: resource cache and quad batching.

use super::text::{atlas_chars, GlyphMetrics, TextRasterizer};
use framehook_core::overlay::{Color, Element, FontSpec, ImageSource, Overlay, Point, ResourceKey};
use framehook_core::protocol::Size;
use framehook_core::log_warn;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

/// Creates GPU textures from premultiplied RGBA8 pixels.
pub trait ResourceFactory {
    type Texture;

    fn create_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> anyhow::Result<Self::Texture>;
}

pub struct Cached<T> {
    pub texture: T,
    pub width: u32,
    pub height: u32,
    glyphs: Option<GlyphMetrics>,
}

/// What the engine was last built for. Any change forces a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSignature {
    pub identity: usize,
    pub size: Size,
    pub version: u64,
}

/// Everything drawn in one frame.
#[derive(Debug, Clone, Default)]
pub struct OverlayFrame {
    pub overlay: Option<Overlay>,
    pub version: u64,
    pub text: Option<String>,
    pub fps: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quad {
    pub key: ResourceKey,
    pub dest: QuadRect,
    /// u0, v0, u1, v1
    pub uv: [f32; 4],
    pub color: Color,
}

const HUD_MARGIN: f32 = 10.0;

/// Largest side of the texture backing a rectangle element.
const RECT_TEXTURE_MAX: u32 = 64;

pub struct OverlayEngine<F: ResourceFactory> {
    cache: HashMap<ResourceKey, Cached<F::Texture>>,
    failed: HashSet<ResourceKey>,
    built_for: Option<TargetSignature>,
}

impl<F: ResourceFactory> Default for OverlayEngine<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ResourceFactory> OverlayEngine<F> {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            failed: HashSet::new(),
            built_for: None,
        }
    }

    pub fn needs_reinit(&self, signature: TargetSignature) -> bool {
        self.built_for != Some(signature)
    }

    /// Drops every cached resource and builds the ones `overlay` needs.
    pub fn reinit<R: TextRasterizer>(
        &mut self,
        factory: &mut F,
        rasterizer: &mut R,
        signature: TargetSignature,
        overlay: Option<&Overlay>,
    ) {
        self.invalidate();
        if let Some(overlay) = overlay {
            for element in overlay.elements() {
                self.ensure(factory, rasterizer, element);
            }
        }
        self.built_for = Some(signature);
    }

    /// Device loss or disposal: forget everything.
    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.failed.clear();
        self.built_for = None;
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&Cached<F::Texture>> {
        self.cache.get(key)
    }

    pub fn cached_keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.cache.keys()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn ensure<R: TextRasterizer>(&mut self, factory: &mut F, rasterizer: &mut R, element: &Element) -> bool {
        let key = element.resource_key();
        match element {
            Element::Text(text) => self.ensure_font(factory, rasterizer, &text.font),
            Element::Image(image) => self.ensure_with(key, |f| {
                let (width, height, mut rgba) = decode_image(&image.image)?;
                premultiply(&mut rgba);
                let texture = f.create_texture(width, height, &rgba)?;
                Ok(Cached {
                    texture,
                    width,
                    height,
                    glyphs: None,
                })
            }, factory),
            Element::Rectangle(rect) => {
                // Solid fill: a small texture stretched over the quad looks the same.
                let width = rect.width.clamp(1, RECT_TEXTURE_MAX);
                let height = rect.height.clamp(1, RECT_TEXTURE_MAX);
                let color = rect.color;
                self.ensure_with(key, |f| {
                    let [r, g, b, a] = color.premultiplied().map(|c| (c * 255.0).round() as u8);
                    let rgba: Vec<u8> = std::iter::repeat([r, g, b, a])
                        .take(width as usize * height as usize)
                        .flatten()
                        .collect();
                    let texture = f.create_texture(width, height, &rgba)?;
                    Ok(Cached {
                        texture,
                        width,
                        height,
                        glyphs: None,
                    })
                }, factory)
            }
        }
    }

    fn ensure_font<R: TextRasterizer>(&mut self, factory: &mut F, rasterizer: &mut R, font: &FontSpec) -> bool {
        self.ensure_with(ResourceKey::font(font), |f| {
            let atlas = rasterizer.rasterize(font, &atlas_chars())?;
            let texture = f.create_texture(atlas.width, atlas.height, &atlas.pixels)?;
            Ok(Cached {
                texture,
                width: atlas.width,
                height: atlas.height,
                glyphs: Some(atlas.metrics),
            })
        }, factory)
    }

    fn ensure_with(
        &mut self,
        key: ResourceKey,
        build: impl FnOnce(&mut F) -> anyhow::Result<Cached<F::Texture>>,
        factory: &mut F,
    ) -> bool {
        if self.cache.contains_key(&key) {
            return true;
        }
        if self.failed.contains(&key) {
            return false;
        }
        match build(factory) {
            Ok(cached) => {
                self.cache.insert(key, cached);
                true
            }
            Err(e) => {
                log_warn!("Failed to create overlay resource {:?}: {}", key, e);
                self.failed.insert(key);
                false
            }
        }
    }

    /// Quads for every visible element, then the text display and FPS counter.
    pub fn build_batch<R: TextRasterizer>(
        &mut self,
        factory: &mut F,
        rasterizer: &mut R,
        frame: &OverlayFrame,
        target: Size,
    ) -> Vec<Quad> {
        let mut quads = Vec::new();

        if let Some(overlay) = &frame.overlay {
            for element in overlay.visible_elements() {
                if !self.ensure(factory, rasterizer, element) {
                    continue;
                }
                match element {
                    Element::Text(text) => {
                        self.push_text(&mut quads, &text.font, &text.text, text.color, text.location)
                    }
                    Element::Image(image) => {
                        let key = element.resource_key();
                        if let Some(cached) = self.cache.get(&key) {
                            quads.push(Quad {
                                key,
                                dest: QuadRect {
                                    x: image.location.x as f32,
                                    y: image.location.y as f32,
                                    width: cached.width as f32 * image.scale,
                                    height: cached.height as f32 * image.scale,
                                },
                                uv: [0.0, 0.0, 1.0, 1.0],
                                color: image.tint,
                            });
                        }
                    }
                    Element::Rectangle(rect) => quads.push(Quad {
                        key: element.resource_key(),
                        dest: QuadRect {
                            x: rect.location.x as f32,
                            y: rect.location.y as f32,
                            width: rect.width as f32,
                            height: rect.height as f32,
                        },
                        uv: [0.0, 0.0, 1.0, 1.0],
                        color: Color::WHITE,
                    }),
                }
            }
        }

        let hud = FontSpec::default();
        if frame.text.is_some() || frame.fps.is_some() {
            self.ensure_font(factory, rasterizer, &hud);
        }
        if let Some(text) = &frame.text {
            let origin = Point::new(HUD_MARGIN as i32, HUD_MARGIN as i32);
            self.push_text(&mut quads, &hud, text, Color::WHITE, origin);
        }
        if let Some(fps) = frame.fps {
            let label = format!("{:.0} FPS", fps);
            let width = self
                .cache
                .get(&ResourceKey::font(&hud))
                .and_then(|c| c.glyphs.as_ref())
                .map(|m| m.measure(&label).0)
                .unwrap_or(0);
            let x = (target.width as f32 - width as f32 - HUD_MARGIN).max(0.0);
            self.push_text(&mut quads, &hud, &label, Color::WHITE, Point::new(x as i32, HUD_MARGIN as i32));
        }

        quads
    }

    fn push_text(&self, quads: &mut Vec<Quad>, font: &FontSpec, text: &str, color: Color, origin: Point) {
        let key = ResourceKey::font(font);
        let Some(cached) = self.cache.get(&key) else {
            return;
        };
        let Some(metrics) = cached.glyphs.as_ref() else {
            return;
        };
        let (aw, ah) = (cached.width as f32, cached.height as f32);

        let (mut x, mut y) = (origin.x as f32, origin.y as f32);
        for c in text.chars() {
            if c == '\n' {
                x = origin.x as f32;
                y += metrics.line_height as f32;
                continue;
            }
            let Some(glyph) = metrics.glyph(c) else {
                continue;
            };
            if c != ' ' {
                quads.push(Quad {
                    key: key.clone(),
                    dest: QuadRect {
                        x,
                        y,
                        width: glyph.width as f32,
                        height: glyph.height as f32,
                    },
                    uv: [
                        glyph.x as f32 / aw,
                        glyph.y as f32 / ah,
                        (glyph.x + glyph.width) as f32 / aw,
                        (glyph.y + glyph.height) as f32 / ah,
                    ],
                    color,
                });
            }
            x += glyph.advance as f32;
        }
    }
}

fn decode_image(source: &ImageSource) -> anyhow::Result<(u32, u32, Vec<u8>)> {
    match source {
        ImageSource::Encoded(bytes) => {
            let rgba = image::load_from_memory(bytes)?.to_rgba8();
            Ok((rgba.width(), rgba.height(), rgba.into_raw()))
        }
        ImageSource::Rgba { width, height, data } => {
            if data.len() != (*width as usize) * (*height as usize) * 4 || *width == 0 || *height == 0 {
                anyhow::bail!("RGBA image of {}x{} has {} bytes", width, height, data.len());
            }
            Ok((*width, *height, data.clone()))
        }
    }
}

pub fn premultiply(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        for c in &mut px[..3] {
            *c = ((*c as u16 * a + 127) / 255) as u8;
        }
    }
}

/// Device pipeline built on first use. A failed build is kept as failed until
/// `reset`, so a device that cannot run the overlay reports it once and the
/// frame step carries on capturing.
pub enum PipelineSlot<T> {
    Empty,
    Ready(T),
    Failed,
}

impl<T> Default for PipelineSlot<T> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<T> PipelineSlot<T> {
    /// `Ok(None)` once a previous build has failed.
    pub fn get_or_try_init(&mut self, build: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<Option<&mut T>> {
        if let Self::Empty = self {
            match build() {
                Ok(pipeline) => *self = Self::Ready(pipeline),
                Err(e) => {
                    *self = Self::Failed;
                    return Err(e.context("overlay pipeline unavailable on this device"));
                }
            }
        }
        match self {
            Self::Ready(pipeline) => Ok(Some(pipeline)),
            _ => Ok(None),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::Empty;
    }
}

/// Splits a batch into runs that share one texture.
pub fn texture_runs(quads: &[Quad]) -> Vec<(ResourceKey, Range<usize>)> {
    let mut runs: Vec<(ResourceKey, Range<usize>)> = Vec::new();
    for (i, quad) in quads.iter().enumerate() {
        match runs.last_mut() {
            Some((key, range)) if *key == quad.key => range.end = i + 1,
            _ => runs.push((quad.key.clone(), i..i + 1)),
        }
    }
    runs
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

/// Two triangles per quad in normalized device coordinates.
pub fn quad_vertices(quads: &[Quad], target: Size) -> Vec<QuadVertex> {
    let (w, h) = (target.width.max(1) as f32, target.height.max(1) as f32);
    let mut vertices = Vec::with_capacity(quads.len() * 6);
    for quad in quads {
        let left = quad.dest.x / w * 2.0 - 1.0;
        let right = (quad.dest.x + quad.dest.width) / w * 2.0 - 1.0;
        let top = 1.0 - quad.dest.y / h * 2.0;
        let bottom = 1.0 - (quad.dest.y + quad.dest.height) / h * 2.0;
        let [u0, v0, u1, v1] = quad.uv;
        let color = quad.color.premultiplied();

        let v = |x, y, u, v| QuadVertex {
            pos: [x, y],
            uv: [u, v],
            color,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::text::tests::BlockRasterizer;

    #[derive(Default)]
    struct CountingFactory {
        created: Vec<(u32, u32)>,
        fail_images: bool,
    }

    impl ResourceFactory for CountingFactory {
        type Texture = usize;

        fn create_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> anyhow::Result<usize> {
            assert_eq!(rgba.len(), width as usize * height as usize * 4);
            if self.fail_images && width == 2 && height == 2 {
                anyhow::bail!("out of memory");
            }
            self.created.push((width, height));
            Ok(self.created.len())
        }
    }

    fn signature(version: u64) -> TargetSignature {
        TargetSignature {
            identity: 0x1234,
            size: Size::new(800, 600),
            version,
        }
    }

    fn menu() -> Overlay {
        Overlay::new(vec![
            Element::rectangle(Point::new(10, 10), 100, 20, Color::BLACK),
            Element::text("Hi", FontSpec::default(), Color::WHITE, Point::new(12, 12)),
            Element::image(
                "logo",
                ImageSource::Rgba {
                    width: 2,
                    height: 2,
                    data: vec![255; 16],
                },
                Point::new(700, 10),
            ),
        ])
    }

    #[test]
    fn reinit_when_identity_size_or_version_changes() {
        let mut engine = OverlayEngine::<CountingFactory>::new();
        assert!(engine.needs_reinit(signature(1)));

        engine.reinit(&mut CountingFactory::default(), &mut BlockRasterizer::default(), signature(1), None);
        assert!(!engine.needs_reinit(signature(1)));
        assert!(engine.needs_reinit(signature(2)));
        assert!(engine.needs_reinit(TargetSignature {
            size: Size::new(1024, 768),
            ..signature(1)
        }));
        assert!(engine.needs_reinit(TargetSignature {
            identity: 1,
            ..signature(1)
        }));
    }

    #[test]
    fn failed_pipeline_is_reported_once() {
        let mut slot = PipelineSlot::<u32>::default();
        let mut builds = 0;
        let mut build = || -> anyhow::Result<u32> {
            builds += 1;
            anyhow::bail!("shader compiler missing")
        };

        assert!(slot.get_or_try_init(&mut build).is_err());
        for _ in 0..3 {
            assert!(matches!(slot.get_or_try_init(&mut build), Ok(None)));
        }
        assert_eq!(builds, 1);

        slot.reset();
        assert_eq!(*slot.get_or_try_init(|| Ok(7)).unwrap().unwrap(), 7);
        assert_eq!(*slot.get_or_try_init(|| Ok(8)).unwrap().unwrap(), 7);
    }

    #[test]
    fn huge_rectangle_uses_bounded_texture() {
        let mut factory = CountingFactory::default();
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();
        let frame = OverlayFrame {
            overlay: Some(Overlay::new(vec![Element::rectangle(
                Point::new(0, 0),
                70_000,
                70_000,
                Color::BLACK,
            )])),
            version: 1,
            ..Default::default()
        };

        let quads = engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600));
        assert_eq!(factory.created, vec![(RECT_TEXTURE_MAX, RECT_TEXTURE_MAX)]);
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].dest.width, 70_000.0);
    }

    #[test]
    fn new_element_set_replaces_old_resources() {
        let mut factory = CountingFactory::default();
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();

        let first = menu();
        engine.reinit(&mut factory, &mut raster, signature(1), Some(&first));
        assert_eq!(engine.cached_len(), 3);

        let second = Overlay::new(vec![Element::rectangle(Point::new(0, 0), 5, 5, Color::WHITE)]);
        engine.reinit(&mut factory, &mut raster, signature(2), Some(&second));
        let keys: Vec<_> = engine.cached_keys().cloned().collect();
        assert_eq!(keys, vec![second.elements()[0].resource_key()]);
    }

    #[test]
    fn steady_state_frames_create_nothing() {
        let mut factory = CountingFactory::default();
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();
        let frame = OverlayFrame {
            overlay: Some(menu()),
            version: 1,
            ..Default::default()
        };

        engine.reinit(&mut factory, &mut raster, signature(1), frame.overlay.as_ref());
        let created = factory.created.len();
        for _ in 0..3 {
            let quads = engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600));
            // rectangle + two glyphs + image
            assert_eq!(quads.len(), 4);
        }
        assert_eq!(factory.created.len(), created);
        assert_eq!(raster.calls, 1);
    }

    #[test]
    fn hidden_elements_and_overlays_are_skipped() {
        let mut overlay = menu();
        let mut elements = overlay.elements().to_vec();
        if let Element::Rectangle(rect) = &mut elements[0] {
            rect.hidden = true;
        }
        overlay.set_elements(elements);

        let mut factory = CountingFactory::default();
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();
        let mut frame = OverlayFrame {
            overlay: Some(overlay),
            ..Default::default()
        };
        assert_eq!(engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600)).len(), 3);

        if let Some(overlay) = frame.overlay.as_mut() {
            overlay.hidden = true;
        }
        assert!(engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600)).is_empty());
    }

    #[test]
    fn failed_resource_is_skipped_without_retry() {
        let mut factory = CountingFactory {
            fail_images: true,
            ..Default::default()
        };
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();
        let frame = OverlayFrame {
            overlay: Some(menu()),
            ..Default::default()
        };

        let quads = engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600));
        assert_eq!(quads.len(), 3);
        let created = factory.created.len();
        engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600));
        assert_eq!(factory.created.len(), created);
    }

    #[test]
    fn hud_text_and_fps_share_one_atlas() {
        let mut factory = CountingFactory::default();
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();
        let frame = OverlayFrame {
            text: Some("Saved".into()),
            fps: Some(59.6),
            ..Default::default()
        };

        let quads = engine.build_batch(&mut factory, &mut raster, &frame, Size::new(800, 600));
        // "Saved" + "60 FPS" without the space
        assert_eq!(quads.len(), 10);
        assert_eq!(texture_runs(&quads).len(), 1);
        let fps_start = quads[5].dest.x;
        assert!(fps_start > 700.0);
    }

    #[test]
    fn invalidate_clears_cache() {
        let mut factory = CountingFactory::default();
        let mut raster = BlockRasterizer::default();
        let mut engine = OverlayEngine::new();
        engine.reinit(&mut factory, &mut raster, signature(1), Some(&menu()));
        engine.invalidate();
        assert_eq!(engine.cached_len(), 0);
        assert!(engine.needs_reinit(signature(1)));
    }

    #[test]
    fn vertices_map_pixels_to_ndc() {
        let quad = Quad {
            key: ResourceKey::Image("x".into()),
            dest: QuadRect {
                x: 0.0,
                y: 0.0,
                width: 400.0,
                height: 300.0,
            },
            uv: [0.0, 0.0, 1.0, 1.0],
            color: Color::WHITE,
        };
        let vertices = quad_vertices(&[quad], Size::new(800, 600));
        assert_eq!(vertices.len(), 6);
        assert_eq!(vertices[0].pos, [-1.0, 1.0]);
        assert_eq!(vertices[4].pos, [0.0, 0.0]);
    }

    #[test]
    fn premultiply_scales_color_by_alpha() {
        let mut px = [255, 128, 0, 128];
        premultiply(&mut px);
        assert_eq!(px, [128, 64, 0, 128]);
    }
}
