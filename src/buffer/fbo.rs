//! Hardware paint buffer backed by a framebuffer object.
//!
//! All framebuffer-object buffers share one rendering context and one
//! off-screen paint device, both set up and owned by the host. The buffer
//! references them weakly: if the host tore them down, every operation that
//! needs them aborts softly instead of touching dangling state. The
//! framebuffer object itself is exclusively owned and freed on drop.

use std::any::Any;
use std::rc::Weak;

use crate::buffer::{BufferState, PaintBuffer};
use crate::color::Color;
use crate::diag::{report, soft, Diag};
use crate::geometry::{Rect, Size};
use crate::gpu::{ensure_current, FramebufferId, GpuContext, GpuPaintDevice};
use crate::painter::{Painter, PainterHandle};

pub struct FboPaintBuffer {
    state: BufferState,
    context: Weak<dyn GpuContext>,
    paint_device: Weak<dyn GpuPaintDevice>,
    framebuffer: Option<FramebufferId>,
}

impl std::fmt::Debug for FboPaintBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FboPaintBuffer")
            .field("state", &self.state)
            .field("framebuffer", &self.framebuffer)
            .finish()
    }
}

impl FboPaintBuffer {
    /// Creates the buffer and allocates its framebuffer object immediately.
    ///
    /// `context` and `paint_device` are the shared collaborators managed by
    /// the host; they are only observed, never kept alive.
    pub fn new(
        size: Size,
        device_pixel_ratio: f64,
        layer_name: &str,
        context: Weak<dyn GpuContext>,
        paint_device: Weak<dyn GpuPaintDevice>,
    ) -> Self {
        let mut buffer = Self {
            state: BufferState::new(size, device_pixel_ratio, layer_name),
            context,
            paint_device,
            framebuffer: None,
        };
        buffer.reallocate_buffer();
        buffer
    }

    pub(crate) fn framebuffer(&self) -> Option<FramebufferId> {
        self.framebuffer
    }

    /// Releases and frees the current framebuffer object, then allocates a
    /// fresh one at `size * device_pixel_ratio` with the context's configured
    /// multisampling, resizing the shared paint device to match.
    fn reallocate_buffer(&mut self) {
        const SITE: &str = "FboPaintBuffer::reallocate_buffer";
        self.state.set_invalidated(true);

        if let Some(id) = self.framebuffer.take() {
            if let Some(context) = self.context.upgrade() {
                if context.is_bound(id) {
                    context.release(id);
                }
                context.delete_framebuffer(id);
            }
        }

        let Some(paint_device) = self.paint_device.upgrade() else {
            report(SITE, &Diag::PaintDeviceGone);
            return;
        };
        let Some(context) = self.context.upgrade() else {
            report(SITE, &Diag::ContextGone);
            return;
        };
        if let Err(diag) = ensure_current(context.as_ref()) {
            report(SITE, &diag);
            return;
        }

        let physical = self.state.physical_size();
        self.framebuffer = context.create_framebuffer(physical, context.samples());
        if paint_device.size() != physical {
            paint_device.set_size(physical);
        }
        paint_device.set_device_pixel_ratio(self.state.device_pixel_ratio());
    }

    fn try_start_painting(&mut self) -> Result<PainterHandle, Diag> {
        let paint_device = self.paint_device.upgrade().ok_or(Diag::PaintDeviceGone)?;
        let context = self.context.upgrade().ok_or(Diag::ContextGone)?;
        let id = self.framebuffer.ok_or(Diag::FramebufferMissing)?;

        ensure_current(context.as_ref())?;
        if !context.bind(id) {
            return Err(Diag::FramebufferMissing);
        }
        Ok(PainterHandle::Gpu(paint_device))
    }

    fn try_draw(&self, painter: &mut dyn Painter) -> Result<(), Diag> {
        if !painter.is_active() {
            return Err(Diag::InactivePainter);
        }
        let id = self.framebuffer.ok_or(Diag::FramebufferMissing)?;
        let context = self.context.upgrade().ok_or(Diag::ContextGone)?;
        ensure_current(context.as_ref())?;

        let physical = context.framebuffer_size(id).ok_or(Diag::FramebufferMissing)?;
        let ratio = self.state.device_pixel_ratio();
        let target = Rect::of_size(physical.logical(ratio));

        // single CPU readback per draw call
        let mut image = context.read_pixels(id).ok_or(Diag::ReadbackFailed)?;
        image.set_device_pixel_ratio(ratio);
        painter.draw_image(target, &image, image.rect());
        Ok(())
    }

    fn try_clear(&self, color: Color) -> Result<(), Diag> {
        let context = self.context.upgrade().ok_or(Diag::ContextGone)?;
        let id = self.framebuffer.ok_or(Diag::FramebufferMissing)?;
        ensure_current(context.as_ref())?;
        context.bind(id);
        context.clear_color_depth(id, color);
        context.release(id);
        Ok(())
    }
}

impl PaintBuffer for FboPaintBuffer {
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
        let result = self.try_start_painting();
        soft("FboPaintBuffer::start_painting", result)
    }

    fn done_painting(&mut self) {
        if let (Some(id), Some(context)) = (self.framebuffer, self.context.upgrade()) {
            if context.is_bound(id) {
                context.release(id);
                return;
            }
        }
        report("FboPaintBuffer::done_painting", &Diag::NotBound);
    }

    fn draw(&self, painter: &mut dyn Painter) {
        if let Err(diag) = self.try_draw(painter) {
            report("FboPaintBuffer::draw", &diag);
        }
    }

    fn clear(&mut self, color: Color) {
        if let Err(diag) = self.try_clear(color) {
            report("FboPaintBuffer::clear", &diag);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for FboPaintBuffer {
    fn drop(&mut self) {
        if let (Some(id), Some(context)) = (self.framebuffer.take(), self.context.upgrade()) {
            if context.is_bound(id) {
                context.release(id);
            }
            context.delete_framebuffer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::geometry::PhysicalSize;
    use crate::gpu::headless::{HeadlessGpu, HeadlessPaintDevice};
    use crate::image::PixelSurface;
    use crate::painter::SurfacePainter;

    struct Rig {
        gpu: Rc<HeadlessGpu>,
        device: Rc<HeadlessPaintDevice>,
    }

    impl Rig {
        fn new(samples: u32) -> Self {
            let gpu = HeadlessGpu::new(samples);
            let device = HeadlessPaintDevice::new(Rc::clone(&gpu), PhysicalSize::new(0, 0));
            Self { gpu, device }
        }

        fn buffer(&self, size: Size, ratio: f64) -> FboPaintBuffer {
            let context: Rc<dyn GpuContext> = Rc::clone(&self.gpu) as Rc<dyn GpuContext>;
            let device: Rc<dyn GpuPaintDevice> = Rc::clone(&self.device) as Rc<dyn GpuPaintDevice>;
            FboPaintBuffer::new(
                size,
                ratio,
                "main",
                Rc::downgrade(&context),
                Rc::downgrade(&device),
            )
        }
    }

    fn red() -> Color {
        Color::from_u8(255, 0, 0, 255)
    }

    fn canvas(width: u32, height: u32) -> Rc<RefCell<PixelSurface>> {
        Rc::new(RefCell::new(PixelSurface::new(PhysicalSize::new(width, height), 1.0)))
    }

    #[test]
    fn construction_allocates_framebuffer_and_sizes_the_device() {
        let rig = Rig::new(4);
        let buffer = rig.buffer(Size::new(100, 100), 2.0);

        let id = buffer.framebuffer().expect("framebuffer allocated at construction");
        assert_eq!(rig.gpu.framebuffer_size(id), Some(PhysicalSize::new(200, 200)));
        assert_eq!(rig.device.size(), PhysicalSize::new(200, 200));
        assert_eq!(rig.device.device_pixel_ratio(), 2.0);
        assert!(buffer.invalidated());
        assert!(!rig.gpu.is_bound(id));
    }

    #[test]
    fn start_painting_binds_and_done_painting_releases() {
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(10, 10), 1.0);
        let id = buffer.framebuffer().unwrap();

        let handle = buffer.start_painting().expect("all collaborators alive");
        assert!(rig.gpu.is_bound(id));
        assert!(handle.device().is_some());

        drop(handle);
        buffer.done_painting();
        assert!(!rig.gpu.is_bound(id));
    }

    #[test]
    fn done_painting_without_binding_is_a_diagnostic_no_op() {
        let _ = env_logger::builder().is_test(true).try_init();
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(10, 10), 1.0);
        buffer.done_painting();
        assert!(!rig.gpu.is_bound(buffer.framebuffer().unwrap()));
    }

    #[test]
    fn start_painting_fails_softly_when_collaborators_are_gone() {
        let rig = Rig::new(1);
        let context: Rc<dyn GpuContext> = Rc::clone(&rig.gpu) as Rc<dyn GpuContext>;
        let device: Rc<dyn GpuPaintDevice> =
            HeadlessPaintDevice::new(Rc::clone(&rig.gpu), PhysicalSize::new(0, 0))
                as Rc<dyn GpuPaintDevice>;
        let weak_device = Rc::downgrade(&device);
        let mut buffer = FboPaintBuffer::new(
            Size::new(10, 10),
            1.0,
            "main",
            Rc::downgrade(&context),
            weak_device,
        );
        let id = buffer.framebuffer().unwrap();

        drop(device); // host tears the paint device down
        assert!(buffer.start_painting().is_none());
        assert!(!rig.gpu.is_bound(id), "failed start_painting must leave the buffer unbound");
    }

    #[test]
    fn paint_then_draw_round_trips_with_rescale() {
        // logical 50x50 at ratio 2.0: storage is 100x100 physical
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(50, 50), 2.0);

        let handle = buffer.start_painting().unwrap();
        // paint in physical coordinates through the shared device
        rig.device.fill_rect(Rect::new(20, 20, 40, 40), red());
        drop(handle);
        buffer.done_painting();

        let canvas = canvas(50, 50);
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        painter.begin();
        buffer.draw(&mut painter);
        painter.end();

        // target rect is physical / ratio: the painted square lands at
        // logical (10,10)..(30,30)
        let canvas = canvas.borrow();
        assert_eq!(canvas.pixel(15, 15), [255, 0, 0, 255]);
        assert_eq!(canvas.pixel(5, 5), [0, 0, 0, 0]);
        assert_eq!(canvas.pixel(35, 35), [0, 0, 0, 0]);
    }

    #[test]
    fn draw_with_inactive_painter_changes_nothing() {
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(10, 10), 1.0);
        buffer.clear(red());

        let canvas = canvas(10, 10);
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        buffer.draw(&mut painter);

        assert_eq!(canvas.borrow().pixel(0, 0), [0, 0, 0, 0]);
        let image = rig.gpu.read_pixels(buffer.framebuffer().unwrap()).unwrap();
        assert_eq!(image.pixel(0, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn clear_is_uniform_and_leaves_the_buffer_unbound() {
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(8, 8), 1.0);
        buffer.clear(Color::from_u8(0, 255, 0, 255));

        let id = buffer.framebuffer().unwrap();
        assert!(!rig.gpu.is_bound(id));
        let image = rig.gpu.read_pixels(id).unwrap();
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(image.pixel(x, y), [0, 255, 0, 255]);
            }
        }
    }

    #[test]
    fn context_is_made_current_only_when_needed() {
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(10, 10), 1.0);
        assert_eq!(rig.gpu.make_current_calls(), 1, "construction switches once");

        buffer.clear(red());
        let handle = buffer.start_painting();
        drop(handle);
        buffer.done_painting();
        assert_eq!(rig.gpu.make_current_calls(), 1, "already-current context is not re-switched");
    }

    #[test]
    fn setters_reallocate_and_discard_content() {
        let rig = Rig::new(1);
        let mut buffer = rig.buffer(Size::new(10, 10), 1.0);
        buffer.clear(red());
        buffer.set_invalidated(false);
        let old = buffer.framebuffer().unwrap();

        buffer.set_size(Size::new(10, 10)); // no-op
        assert_eq!(buffer.framebuffer(), Some(old));
        assert!(!buffer.invalidated());

        buffer.set_size(Size::new(20, 10));
        let new = buffer.framebuffer().unwrap();
        assert_ne!(new, old);
        assert!(buffer.invalidated());
        assert!(!rig.gpu.is_framebuffer_valid(old), "old framebuffer must be freed");
        assert_eq!(rig.gpu.framebuffer_size(new), Some(PhysicalSize::new(20, 10)));
        let image = rig.gpu.read_pixels(new).unwrap();
        assert_eq!(image.pixel(0, 0), [0, 0, 0, 0], "no stale pixels after reallocation");
    }

    #[test]
    fn drop_frees_the_framebuffer() {
        let rig = Rig::new(1);
        let buffer = rig.buffer(Size::new(10, 10), 1.0);
        assert_eq!(rig.gpu.framebuffer_count(), 1);
        drop(buffer);
        assert_eq!(rig.gpu.framebuffer_count(), 0);
    }

    #[test]
    fn framebuffer_uses_the_contexts_sample_count() {
        let rig = Rig::new(8);
        let buffer = rig.buffer(Size::new(10, 10), 1.0);
        assert!(buffer.framebuffer().is_some());
        assert_eq!(rig.gpu.samples(), 8);
    }
}
