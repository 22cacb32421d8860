//! The paint-buffer contract and the state every backend shares.

/// Software-rasterized paint buffer.
pub mod pixmap;

/// Framebuffer-object backed paint buffer.
pub mod fbo;

use std::any::Any;

use crate::color::Color;
use crate::geometry::{fuzzy_eq, PhysicalSize, Size};
use crate::painter::{Painter, PainterHandle};

/// A backing surface that accepts drawing commands and can later composite
/// its accumulated content onto a target painter.
///
/// The backend set is closed: [`pixmap::PixmapPaintBuffer`] for software
/// rasterization and [`fbo::FboPaintBuffer`] for hardware acceleration.
/// [`as_any`](Self::as_any) exists so the batch compositor can dispatch on
/// the backend kind.
pub trait PaintBuffer {
    /// Buffer size in logical units.
    fn size(&self) -> Size;

    /// Scale factor between logical units and physical storage pixels.
    fn device_pixel_ratio(&self) -> f64;

    /// Name of the logical layer this buffer renders. Diagnostics only.
    fn layer_name(&self) -> &str;

    /// Whether the buffer's layer association changed since its storage was
    /// last fully redrawn.
    fn invalidated(&self) -> bool;

    fn set_invalidated(&mut self, invalidated: bool);

    /// Resizes the buffer. A no-op if `size` equals the current size;
    /// otherwise the storage is reallocated and any outstanding painter
    /// handle is invalidated.
    fn set_size(&mut self, size: Size);

    /// Rescales the buffer. A no-op if `ratio` fuzzy-equals the current
    /// ratio; otherwise the storage is reallocated and any outstanding
    /// painter handle is invalidated.
    fn set_device_pixel_ratio(&mut self, ratio: f64);

    /// Prepares the buffer for drawing and returns a handle bound to its
    /// storage, or `None` if the backend cannot currently produce one.
    ///
    /// While the handle is outstanding, `set_size`, `set_device_pixel_ratio`
    /// and `clear` must not be called. That precondition is the caller's to
    /// enforce.
    fn start_painting(&mut self) -> Option<PainterHandle>;

    /// Signals that painting is finished and the handle has been dropped.
    fn done_painting(&mut self) {}

    /// Composites this buffer's stored content onto `painter` at (0, 0).
    fn draw(&self, painter: &mut dyn Painter);

    /// Fills the entire storage uniformly. Must not be called while a
    /// painter handle is outstanding.
    fn clear(&mut self, color: Color);

    fn as_any(&self) -> &dyn Any;
}

/// Size, scale and identity state shared by every backend.
///
/// Backends embed this and route their `set_size`/`set_device_pixel_ratio`
/// through [`update_size`](Self::update_size) /
/// [`update_device_pixel_ratio`](Self::update_device_pixel_ratio), calling
/// their own reallocation only when the value actually changed.
#[derive(Debug, Clone)]
pub struct BufferState {
    size: Size,
    device_pixel_ratio: f64,
    layer_name: String,
    invalidated: bool,
}

impl BufferState {
    pub fn new(size: Size, device_pixel_ratio: f64, layer_name: &str) -> Self {
        Self {
            size,
            device_pixel_ratio,
            layer_name: layer_name.to_string(),
            invalidated: true,
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn set_invalidated(&mut self, invalidated: bool) {
        self.invalidated = invalidated;
    }

    /// Physical storage extents: `size * device_pixel_ratio`, rounded.
    pub fn physical_size(&self) -> PhysicalSize {
        self.size.physical(self.device_pixel_ratio)
    }

    /// Updates the size; returns whether it changed (and storage must be
    /// reallocated).
    pub(crate) fn update_size(&mut self, size: Size) -> bool {
        if self.size == size {
            return false;
        }
        self.size = size;
        true
    }

    /// Updates the ratio; returns whether it changed beyond float tolerance.
    pub(crate) fn update_device_pixel_ratio(&mut self, ratio: f64) -> bool {
        if fuzzy_eq(self.device_pixel_ratio, ratio) {
            return false;
        }
        self.device_pixel_ratio = ratio;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_invalidated() {
        let state = BufferState::new(Size::new(100, 100), 1.0, "axes");
        assert!(state.invalidated());
        assert_eq!(state.layer_name(), "axes");
        assert_eq!(state.physical_size(), PhysicalSize::new(100, 100));
    }

    #[test]
    fn update_size_reports_changes_only() {
        let mut state = BufferState::new(Size::new(100, 100), 1.0, "main");
        assert!(!state.update_size(Size::new(100, 100)));
        assert!(state.update_size(Size::new(200, 100)));
        assert_eq!(state.size(), Size::new(200, 100));
    }

    #[test]
    fn update_ratio_is_fuzzy() {
        let mut state = BufferState::new(Size::new(10, 10), 2.0, "main");
        assert!(!state.update_device_pixel_ratio(2.0 + 1e-14));
        assert!(state.update_device_pixel_ratio(1.0));
        assert_eq!(state.physical_size(), PhysicalSize::new(10, 10));
    }
}
