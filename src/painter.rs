//! The painter seam.
//!
//! Paint buffers only *consume* painting: they hand out a [`PainterHandle`]
//! bound to their storage and later draw their accumulated content onto an
//! externally supplied [`Painter`]. The drawing primitives themselves are the
//! host toolkit's business; [`SurfacePainter`] is the software painter used to
//! join finished buffers into a displayed frame.

use std::cell::RefCell;
use std::rc::Rc;

use crate::diag::{report, Diag};
use crate::geometry::Rect;
use crate::gpu::GpuPaintDevice;
use crate::image::{blend_rgba8, PixelSurface, RgbaImage};

/// Drawing capability consumed by paint buffers when compositing onto a
/// final target.
pub trait Painter {
    /// Whether the painter is currently active on its target.
    fn is_active(&self) -> bool;

    /// Draws `source` of `image` into `target` (logical units), scaling as
    /// needed, with source-over compositing.
    fn draw_image(&mut self, target: Rect, image: &RgbaImage, source: Rect);

    /// Draws a software surface at the given logical offset. The surface's
    /// scale tag determines its logical extents.
    fn draw_pixmap(&mut self, x: i32, y: i32, surface: &PixelSurface);
}

/// Handle returned by `PaintBuffer::start_painting`, bound to the buffer's
/// storage until the caller drops it and calls `done_painting`.
///
/// Reallocating the buffer detaches the handle from live storage; callers
/// must not keep using a handle across `set_size`/`set_device_pixel_ratio`.
pub enum PainterHandle {
    /// Software raster target: drawing goes straight into the surface.
    Pixmap(Rc<RefCell<PixelSurface>>),
    /// Hardware target: drawing goes through the shared paint device while
    /// the buffer's framebuffer stays bound.
    Gpu(Rc<dyn GpuPaintDevice>),
}

impl std::fmt::Debug for PainterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PainterHandle::Pixmap(_) => write!(f, "PainterHandle::Pixmap"),
            PainterHandle::Gpu(_) => write!(f, "PainterHandle::Gpu"),
        }
    }
}

impl PainterHandle {
    pub fn surface(&self) -> Option<&Rc<RefCell<PixelSurface>>> {
        match self {
            PainterHandle::Pixmap(surface) => Some(surface),
            PainterHandle::Gpu(_) => None,
        }
    }

    pub fn device(&self) -> Option<&Rc<dyn GpuPaintDevice>> {
        match self {
            PainterHandle::Pixmap(_) => None,
            PainterHandle::Gpu(device) => Some(device),
        }
    }
}

/// Software painter over a [`PixelSurface`] canvas.
///
/// This is the painter a host hands to `draw`/`batch_draw` when the final
/// frame is assembled in software. Inactive painters ignore draw calls, so
/// buffers can treat "inactive" as a reportable caller error without this
/// type panicking.
pub struct SurfacePainter {
    canvas: Rc<RefCell<PixelSurface>>,
    active: bool,
}

impl std::fmt::Debug for SurfacePainter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfacePainter").field("active", &self.active).finish()
    }
}

impl SurfacePainter {
    pub fn new(canvas: Rc<RefCell<PixelSurface>>) -> Self {
        Self { canvas, active: false }
    }

    /// Begins painting on the canvas.
    pub fn begin(&mut self) {
        self.active = true;
    }

    /// Ends painting. Draw calls after this are ignored.
    pub fn end(&mut self) {
        self.active = false;
    }

    pub fn canvas(&self) -> Rc<RefCell<PixelSurface>> {
        Rc::clone(&self.canvas)
    }

    /// Source-over blits `source` pixels into `target` (logical units on the
    /// canvas), nearest-neighbor scaled.
    fn blit_scaled(
        &mut self,
        target: Rect,
        pixel_at: &dyn Fn(u32, u32) -> [u8; 4],
        source: Rect,
    ) {
        if target.width == 0 || target.height == 0 || source.width == 0 || source.height == 0 {
            return;
        }
        let mut canvas = self.canvas.borrow_mut();
        let ratio = canvas.device_pixel_ratio();
        let size = canvas.size();
        // canvas coordinates are physical; targets arrive in logical units
        let tx0 = (target.x as f64 * ratio).round() as i64;
        let ty0 = (target.y as f64 * ratio).round() as i64;
        let tw = (target.width as f64 * ratio).round() as i64;
        let th = (target.height as f64 * ratio).round() as i64;
        for dy in 0..th {
            let cy = ty0 + dy;
            if cy < 0 || cy >= size.height as i64 {
                continue;
            }
            let sy = source.y as i64 + dy * source.height as i64 / th;
            for dx in 0..tw {
                let cx = tx0 + dx;
                if cx < 0 || cx >= size.width as i64 {
                    continue;
                }
                let sx = source.x as i64 + dx * source.width as i64 / tw;
                let src = pixel_at(sx as u32, sy as u32);
                let dst = canvas.pixel(cx as u32, cy as u32);
                canvas.put_pixel(cx as u32, cy as u32, blend_rgba8(src, dst));
            }
        }
    }
}

impl Painter for SurfacePainter {
    fn is_active(&self) -> bool {
        self.active
    }

    fn draw_image(&mut self, target: Rect, image: &RgbaImage, source: Rect) {
        if !self.active {
            report("SurfacePainter::draw_image", &Diag::InactivePainter);
            return;
        }
        self.blit_scaled(target, &|x, y| image.pixel(x, y), source);
    }

    fn draw_pixmap(&mut self, x: i32, y: i32, surface: &PixelSurface) {
        if !self.active {
            report("SurfacePainter::draw_pixmap", &Diag::InactivePainter);
            return;
        }
        let logical = surface.logical_size();
        let target = Rect::new(x, y, logical.width, logical.height);
        let source = Rect::new(0, 0, surface.size().width, surface.size().height);
        self.blit_scaled(target, &|px, py| surface.pixel(px, py), source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::geometry::PhysicalSize;

    fn canvas(width: u32, height: u32) -> Rc<RefCell<PixelSurface>> {
        Rc::new(RefCell::new(PixelSurface::new(PhysicalSize::new(width, height), 1.0)))
    }

    #[test]
    fn inactive_painter_ignores_draws() {
        let canvas = canvas(4, 4);
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        let mut surface = PixelSurface::new(PhysicalSize::new(4, 4), 1.0);
        surface.fill(Color::from_u8(255, 0, 0, 255));
        painter.draw_pixmap(0, 0, &surface);
        assert_eq!(canvas.borrow().pixel(0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn draw_pixmap_copies_at_offset() {
        let canvas = canvas(8, 8);
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        painter.begin();
        let mut surface = PixelSurface::new(PhysicalSize::new(2, 2), 1.0);
        surface.fill(Color::from_u8(0, 255, 0, 255));
        painter.draw_pixmap(3, 3, &surface);
        painter.end();
        let canvas = canvas.borrow();
        assert_eq!(canvas.pixel(3, 3), [0, 255, 0, 255]);
        assert_eq!(canvas.pixel(4, 4), [0, 255, 0, 255]);
        assert_eq!(canvas.pixel(2, 2), [0, 0, 0, 0]);
        assert_eq!(canvas.pixel(5, 5), [0, 0, 0, 0]);
    }

    #[test]
    fn draw_pixmap_honors_the_scale_tag() {
        // a 4x4 physical surface tagged 2.0 covers 2x2 logical pixels
        let canvas = canvas(4, 4);
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        painter.begin();
        let mut surface = PixelSurface::new(PhysicalSize::new(4, 4), 2.0);
        surface.fill(Color::from_u8(255, 0, 255, 255));
        painter.draw_pixmap(0, 0, &surface);
        let canvas = canvas.borrow();
        assert_eq!(canvas.pixel(1, 1), [255, 0, 255, 255]);
        assert_eq!(canvas.pixel(2, 2), [0, 0, 0, 0]);
    }

    #[test]
    fn draw_image_downscales_into_target_rect() {
        let canvas = canvas(4, 4);
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        painter.begin();
        let mut image = RgbaImage::new(PhysicalSize::new(8, 8));
        for y in 0..8 {
            for x in 0..8 {
                image.put_pixel(x, y, [255, 255, 0, 255]);
            }
        }
        painter.draw_image(Rect::new(0, 0, 4, 4), &image, image.rect());
        let canvas = canvas.borrow();
        assert_eq!(canvas.pixel(0, 0), [255, 255, 0, 255]);
        assert_eq!(canvas.pixel(3, 3), [255, 255, 0, 255]);
    }
}
