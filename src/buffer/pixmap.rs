//! Software paint buffer backed by an in-memory pixel surface.
//!
//! The default and fall-back backend: always available, no external
//! collaborators. Used when hardware acceleration is disabled or its
//! collaborators are missing.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::{BufferState, PaintBuffer};
use crate::color::Color;
use crate::diag::{report, Diag};
use crate::geometry::{fuzzy_eq, PhysicalSize, Size};
use crate::image::PixelSurface;
use crate::painter::{Painter, PainterHandle};

pub struct PixmapPaintBuffer {
    state: BufferState,
    surface: Rc<RefCell<PixelSurface>>,
}

impl std::fmt::Debug for PixmapPaintBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixmapPaintBuffer").field("state", &self.state).finish()
    }
}

impl PixmapPaintBuffer {
    /// Creates the buffer and allocates its surface immediately.
    pub fn new(size: Size, device_pixel_ratio: f64, layer_name: &str) -> Self {
        let mut buffer = Self {
            state: BufferState::new(size, device_pixel_ratio, layer_name),
            surface: Rc::new(RefCell::new(PixelSurface::new(PhysicalSize::new(0, 0), 1.0))),
        };
        buffer.reallocate_buffer();
        buffer
    }

    /// Replaces the surface with a fresh allocation at the configured size.
    /// Outstanding painter handles keep the old storage alive but detached.
    fn reallocate_buffer(&mut self) {
        self.state.set_invalidated(true);
        let ratio = self.state.device_pixel_ratio();
        let surface = if fuzzy_eq(ratio, 1.0) {
            let size = self.state.size();
            PixelSurface::new(PhysicalSize::new(size.width, size.height), 1.0)
        } else {
            PixelSurface::new(self.state.physical_size(), ratio)
        };
        self.surface = Rc::new(RefCell::new(surface));
    }
}

impl PaintBuffer for PixmapPaintBuffer {
    fn size(&self) -> Size {
        self.state.size()
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.state.device_pixel_ratio()
    }

    fn layer_name(&self) -> &str {
        self.state.layer_name()
    }

    fn invalidated(&self) -> bool {
        self.state.invalidated()
    }

    fn set_invalidated(&mut self, invalidated: bool) {
        self.state.set_invalidated(invalidated);
    }

    fn set_size(&mut self, size: Size) {
        if self.state.update_size(size) {
            self.reallocate_buffer();
        }
    }

    fn set_device_pixel_ratio(&mut self, ratio: f64) {
        if self.state.update_device_pixel_ratio(ratio) {
            self.reallocate_buffer();
        }
    }

    fn start_painting(&mut self) -> Option<PainterHandle> {
        Some(PainterHandle::Pixmap(Rc::clone(&self.surface)))
    }

    fn draw(&self, painter: &mut dyn Painter) {
        if !painter.is_active() {
            report("PixmapPaintBuffer::draw", &Diag::InactivePainter);
            return;
        }
        painter.draw_pixmap(0, 0, &self.surface.borrow());
    }

    fn clear(&mut self, color: Color) {
        self.surface.borrow_mut().fill(color);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
