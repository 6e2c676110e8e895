pub mod engine;
pub mod text;

#[cfg(windows)]
pub mod d3d10;
#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d9;
#[cfg(windows)]
mod shader;

pub use engine::{OverlayEngine, OverlayFrame, PipelineSlot, Quad, ResourceFactory, TargetSignature};
pub use text::TextRasterizer;
