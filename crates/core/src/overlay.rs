//! Overlay model shared by the controller and the agent compositor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Normalized premultiplied components for shader constants and vertex colors.
    pub fn premultiplied(&self) -> [f32; 4] {
        let a = self.a as f32 / 255.0;
        [
            self.r as f32 / 255.0 * a,
            self.g as f32 / 255.0 * a,
            self.b as f32 / 255.0 * a,
            a,
        ]
    }

    /// Packed 0xAARRGGBB as used by D3D9 vertex colors.
    pub fn to_argb(&self) -> u32 {
        (self.a as u32) << 24 | (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub mouse: bool,
    pub keyboard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FontSpec {
    pub name: String,
    pub size: u32,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default = "default_antialias")]
    pub antialias: bool,
}

fn default_antialias() -> bool {
    true
}

impl Default for FontSpec {
    fn default() -> Self {
        Self {
            name: "Arial".to_string(),
            size: 16,
            bold: false,
            italic: false,
            antialias: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    pub text: String,
    pub font: FontSpec,
    pub color: Color,
    pub location: Point,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageSource {
    /// Any format the `image` crate decodes (PNG, BMP, JPEG).
    Encoded(#[serde(with = "crate::protocol::base64_bytes")] Vec<u8>),
    Rgba {
        width: u32,
        height: u32,
        #[serde(with = "crate::protocol::base64_bytes")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageElement {
    /// Identity of the image; the compositor caches one texture per id.
    pub id: String,
    pub image: ImageSource,
    pub location: Point,
    #[serde(default = "default_tint")]
    pub tint: Color,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

fn default_tint() -> Color {
    Color::WHITE
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectangleElement {
    pub location: Point,
    pub width: u32,
    pub height: u32,
    pub color: Color,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Element {
    Text(TextElement),
    Image(ImageElement),
    Rectangle(RectangleElement),
}

impl Element {
    pub fn text(text: impl Into<String>, font: FontSpec, color: Color, location: Point) -> Self {
        Element::Text(TextElement {
            text: text.into(),
            font,
            color,
            location,
            hidden: false,
            capabilities: Capabilities::default(),
        })
    }

    pub fn rectangle(location: Point, width: u32, height: u32, color: Color) -> Self {
        Element::Rectangle(RectangleElement {
            location,
            width,
            height,
            color,
            hidden: false,
            capabilities: Capabilities::default(),
        })
    }

    pub fn image(id: impl Into<String>, image: ImageSource, location: Point) -> Self {
        Element::Image(ImageElement {
            id: id.into(),
            image,
            location,
            tint: Color::WHITE,
            scale: 1.0,
            hidden: false,
            capabilities: Capabilities::default(),
        })
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        match &mut self {
            Element::Text(e) => e.capabilities = capabilities,
            Element::Image(e) => e.capabilities = capabilities,
            Element::Rectangle(e) => e.capabilities = capabilities,
        }
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Element::Text(e) => e.capabilities,
            Element::Image(e) => e.capabilities,
            Element::Rectangle(e) => e.capabilities,
        }
    }

    pub fn is_hidden(&self) -> bool {
        match self {
            Element::Text(e) => e.hidden,
            Element::Image(e) => e.hidden,
            Element::Rectangle(e) => e.hidden,
        }
    }

    pub fn location(&self) -> Point {
        match self {
            Element::Text(e) => e.location,
            Element::Image(e) => e.location,
            Element::Rectangle(e) => e.location,
        }
    }

    /// Visual signature of the GPU resource this element draws with.
    pub fn resource_key(&self) -> ResourceKey {
        match self {
            Element::Text(e) => ResourceKey::font(&e.font),
            Element::Image(e) => ResourceKey::Image(e.id.clone()),
            Element::Rectangle(e) => ResourceKey::Rectangle {
                color: e.color,
                width: e.width,
                height: e.height,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Font {
        name: String,
        size: u32,
        bold: bool,
        italic: bool,
        antialias: bool,
    },
    Image(String),
    Rectangle { color: Color, width: u32, height: u32 },
}

impl ResourceKey {
    pub fn font(font: &FontSpec) -> Self {
        ResourceKey::Font {
            name: font.name.clone(),
            size: font.size,
            bold: font.bold,
            italic: font.italic,
            antialias: font.antialias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    Mouse { x: i32, y: i32, buttons: u32 },
    Key { code: u32, down: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OverlayData", into = "OverlayData")]
pub struct Overlay {
    elements: Vec<Element>,
    pub hidden: bool,
    mouse_handlers: Vec<usize>,
    keyboard_handlers: Vec<usize>,
}

/// Serialized form; handler subsets are rebuilt on arrival.
#[derive(Serialize, Deserialize)]
struct OverlayData {
    elements: Vec<Element>,
    #[serde(default)]
    hidden: bool,
}

impl From<OverlayData> for Overlay {
    fn from(data: OverlayData) -> Self {
        let mut overlay = Overlay::new(data.elements);
        overlay.hidden = data.hidden;
        overlay
    }
}

impl From<Overlay> for OverlayData {
    fn from(overlay: Overlay) -> Self {
        Self {
            elements: overlay.elements,
            hidden: overlay.hidden,
        }
    }
}

impl Overlay {
    pub fn new(elements: Vec<Element>) -> Self {
        let mut overlay = Self {
            elements: Vec::new(),
            hidden: false,
            mouse_handlers: Vec::new(),
            keyboard_handlers: Vec::new(),
        };
        overlay.set_elements(elements);
        overlay
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn set_elements(&mut self, elements: Vec<Element>) {
        self.mouse_handlers = elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.capabilities().mouse)
            .map(|(i, _)| i)
            .collect();
        self.keyboard_handlers = elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.capabilities().keyboard)
            .map(|(i, _)| i)
            .collect();
        self.elements = elements;
    }

    pub fn mouse_handlers(&self) -> &[usize] {
        &self.mouse_handlers
    }

    pub fn keyboard_handlers(&self) -> &[usize] {
        &self.keyboard_handlers
    }

    pub fn visible_elements(&self) -> impl Iterator<Item = &Element> {
        let hidden = self.hidden;
        self.elements.iter().filter(move |e| !hidden && !e.is_hidden())
    }

    /// Indices of the visible elements that receive `event`.
    pub fn dispatch_input(&self, event: &InputEvent) -> Vec<usize> {
        if self.hidden {
            return Vec::new();
        }
        let subset = match event {
            InputEvent::Mouse { .. } => &self.mouse_handlers,
            InputEvent::Key { .. } => &self.keyboard_handlers,
        };
        subset
            .iter()
            .copied()
            .filter(|&i| !self.elements[i].is_hidden())
            .collect()
    }
}
