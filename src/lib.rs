//! Paint buffers and batch compositing for a plotting widget toolkit.
//!
//! Plot layers render into paint buffers: off-screen surfaces that accumulate
//! a layer's drawing and composite it onto the widget on demand, so a change
//! to one layer never forces the others to repaint. Two backends implement
//! the [`buffer::PaintBuffer`] contract: a software pixel surface
//! ([`buffer::pixmap::PixmapPaintBuffer`]) and a framebuffer object bound to
//! a shared rendering context ([`buffer::fbo::FboPaintBuffer`]). The
//! [`compositor::BatchCompositor`] merges a stack of hardware buffers on the
//! GPU with a single readback.
//!
//! Failures in this layer are soft: an operation that cannot proceed logs a
//! diagnostic through the `log` facade and leaves state untouched.

pub mod buffer;
pub mod color;
pub mod compositor;
pub mod config;
pub mod diag;
pub mod geometry;
pub mod gpu;
pub mod image;
pub mod painter;

pub use buffer::fbo::FboPaintBuffer;
pub use buffer::pixmap::PixmapPaintBuffer;
pub use buffer::{BufferState, PaintBuffer};
pub use color::Color;
pub use compositor::BatchCompositor;
pub use config::{create_paint_buffer, GpuHandles, RenderConfig};
pub use diag::Diag;
pub use geometry::{PhysicalSize, Rect, Size};
pub use gpu::{FramebufferId, GpuContext, GpuPaintDevice};
pub use image::{PixelSurface, RgbaImage};
pub use painter::{Painter, PainterHandle, SurfacePainter};
