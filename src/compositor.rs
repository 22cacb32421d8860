//! Single-pass batch compositing of hardware paint buffers.
//!
//! Reading every framebuffer object back to the CPU and alpha-blending the
//! images one by one is expensive and composes incorrectly under partial
//! transparency. The batch compositor instead blends all buffers on the GPU:
//! each buffer is multisample-resolved into a scratch framebuffer and drawn
//! as a textured quad into an owned destination framebuffer, back to front,
//! and only the destination is read back, once.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::buffer::fbo::FboPaintBuffer;
use crate::buffer::PaintBuffer;
use crate::color::Color;
use crate::diag::{report, Diag};
use crate::geometry::{fuzzy_eq, Rect, Size};
use crate::gpu::{ensure_current, FramebufferId, GpuContext};
use crate::image::RgbaImage;
use crate::painter::Painter;

pub struct BatchCompositor {
    size: Size,
    device_pixel_ratio: f64,
    context: Weak<dyn GpuContext>,
    destination: Option<FramebufferId>,
    scratch: Option<FramebufferId>,
    /// Readback image reused across batch draws; dropped whenever the
    /// required size changes.
    readback: Option<RgbaImage>,
}

impl std::fmt::Debug for BatchCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCompositor")
            .field("size", &self.size)
            .field("device_pixel_ratio", &self.device_pixel_ratio)
            .field("destination", &self.destination)
            .field("scratch", &self.scratch)
            .finish()
    }
}

impl BatchCompositor {
    /// Creates the compositor and allocates its destination and scratch
    /// framebuffers immediately.
    pub fn new(size: Size, device_pixel_ratio: f64, context: Weak<dyn GpuContext>) -> Self {
        let mut compositor = Self {
            size,
            device_pixel_ratio,
            context,
            destination: None,
            scratch: None,
            readback: None,
        };
        compositor.reallocate_buffers();
        compositor
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    pub fn set_size(&mut self, size: Size) {
        if self.size != size {
            self.size = size;
            self.reallocate_buffers();
        }
    }

    pub fn set_device_pixel_ratio(&mut self, ratio: f64) {
        if !fuzzy_eq(self.device_pixel_ratio, ratio) {
            self.device_pixel_ratio = ratio;
            self.reallocate_buffers();
        }
    }

    /// Resize and rescale in a single reallocation.
    pub fn set_size_and_device_pixel_ratio(&mut self, size: Size, ratio: f64) {
        if self.size != size || !fuzzy_eq(self.device_pixel_ratio, ratio) {
            self.size = size;
            self.device_pixel_ratio = ratio;
            self.reallocate_buffers();
        }
    }

    /// Composites `buffers` in order onto `painter`. Later buffers end up on
    /// top. A single buffer is delegated to its own `draw`, skipping the
    /// batching machinery entirely. Buffers that are not hardware buffers, or
    /// whose framebuffer is gone, are skipped with a diagnostic.
    pub fn batch_draw(
        &mut self,
        buffers: &[Rc<RefCell<dyn PaintBuffer>>],
        painter: &mut dyn Painter,
    ) {
        if let Err(diag) = self.try_batch_draw(buffers, painter) {
            report("BatchCompositor::batch_draw", &diag);
        }
    }

    fn try_batch_draw(
        &mut self,
        buffers: &[Rc<RefCell<dyn PaintBuffer>>],
        painter: &mut dyn Painter,
    ) -> Result<(), Diag> {
        if !painter.is_active() {
            return Err(Diag::InactivePainter);
        }
        // a single buffer gains nothing from batching; short-circuit before
        // any context work
        if let [buffer] = buffers {
            buffer.borrow().draw(painter);
            return Ok(());
        }
        if buffers.is_empty() {
            return Ok(());
        }

        let context = self.context.upgrade().ok_or(Diag::ContextGone)?;
        ensure_current(context.as_ref())?;
        let destination = self.destination.ok_or(Diag::FramebufferMissing)?;
        let scratch = self.scratch.ok_or(Diag::FramebufferMissing)?;
        if !context.is_framebuffer_valid(destination) || !context.is_framebuffer_valid(scratch) {
            return Err(Diag::DestinationInvalid);
        }

        context.clear_color_depth(destination, Color::TRANSPARENT);
        for buffer in buffers {
            let buffer = buffer.borrow();
            let framebuffer = buffer
                .as_any()
                .downcast_ref::<FboPaintBuffer>()
                .and_then(FboPaintBuffer::framebuffer);
            let Some(framebuffer) = framebuffer else {
                report("BatchCompositor::batch_draw", &Diag::InvalidBatchBuffer);
                continue;
            };
            if !context.is_framebuffer_valid(framebuffer)
                || !context.resolve(scratch, framebuffer)
                || !context.composite(destination, scratch)
            {
                report("BatchCompositor::batch_draw", &Diag::InvalidBatchBuffer);
            }
        }

        let physical = context
            .framebuffer_size(destination)
            .ok_or(Diag::FramebufferMissing)?;
        // one readback for the whole batch, into the cached image
        if self.readback.as_ref().map(RgbaImage::size) != Some(physical) {
            self.readback = Some(RgbaImage::new(physical));
        }
        let image = self.readback.as_mut().ok_or(Diag::ReadbackFailed)?;
        if !context.read_pixels_into(destination, image) {
            return Err(Diag::ReadbackFailed);
        }
        image.set_device_pixel_ratio(self.device_pixel_ratio);

        let target = Rect::of_size(physical.logical(self.device_pixel_ratio));
        painter.draw_image(target, image, image.rect());
        Ok(())
    }

    /// Releases and frees both owned framebuffers, then allocates fresh ones
    /// at the configured physical size. Destination and scratch are
    /// single-sample: the scratch receives multisample resolves, the
    /// destination is read back.
    fn reallocate_buffers(&mut self) {
        const SITE: &str = "BatchCompositor::reallocate_buffers";
        self.release_buffers();
        self.readback = None;

        let Some(context) = self.context.upgrade() else {
            report(SITE, &Diag::ContextGone);
            return;
        };
        if let Err(diag) = ensure_current(context.as_ref()) {
            report(SITE, &diag);
            return;
        }
        let physical = self.size.physical(self.device_pixel_ratio);
        self.destination = context.create_framebuffer(physical, 1);
        self.scratch = context.create_framebuffer(physical, 1);
    }

    fn release_buffers(&mut self) {
        let context = self.context.upgrade();
        for id in [self.destination.take(), self.scratch.take()].into_iter().flatten() {
            if let Some(context) = &context {
                if context.is_bound(id) {
                    context.release(id);
                }
                context.delete_framebuffer(id);
            }
        }
    }
}

impl Drop for BatchCompositor {
    fn drop(&mut self) {
        self.release_buffers();
    }
}
