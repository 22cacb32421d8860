//! GPU capability seams consumed by the hardware paint buffer and the batch
//! compositor.
//!
//! The shared rendering context and the off-screen paint device are owned by
//! the host; paint buffers reference them weakly and resolve-or-fail on every
//! access. Framebuffer objects, in contrast, are exclusively owned through
//! their [`FramebufferId`] and must be released before reassignment or drop.

pub mod headless;

/// wgpu-backed rendering context.
#[cfg(feature = "backend_wgpu")]
pub mod wgpu;

use crate::color::Color;
use crate::diag::Diag;
use crate::geometry::PhysicalSize;
use crate::image::RgbaImage;

/// Identifier of a framebuffer object owned by a [`GpuContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(u64);

impl FramebufferId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Shared rendering context. Queried and driven by buffers, never owned.
///
/// All methods take `&self`; implementations use interior mutability. The
/// whole layer runs single-threaded on the thread owning the context, so
/// there is no locking anywhere.
pub trait GpuContext {
    /// Whether this context is the thread's current one. Callers are expected
    /// to check this before [`make_current`](Self::make_current), since
    /// switching contexts is observable in timing.
    fn is_current(&self) -> bool;

    /// Makes this context current on its surface. Returns `false` on failure.
    fn make_current(&self) -> bool;

    /// Multisample count configured on the context's surface format.
    fn samples(&self) -> u32;

    /// Creates a framebuffer object at the given physical size, with a
    /// combined depth/stencil attachment. `samples <= 1` means single-sample.
    fn create_framebuffer(&self, size: PhysicalSize, samples: u32) -> Option<FramebufferId>;

    fn delete_framebuffer(&self, id: FramebufferId);

    fn is_framebuffer_valid(&self, id: FramebufferId) -> bool;

    fn framebuffer_size(&self, id: FramebufferId) -> Option<PhysicalSize>;

    /// Binds the framebuffer as the active render target.
    fn bind(&self, id: FramebufferId) -> bool;

    /// Releases the binding if `id` is the bound framebuffer.
    fn release(&self, id: FramebufferId);

    fn is_bound(&self, id: FramebufferId) -> bool;

    /// Uniform color + depth clear of the given framebuffer. Does not leave
    /// the framebuffer bound.
    fn clear_color_depth(&self, id: FramebufferId, color: Color);

    /// Resolves possibly-multisampled `src` into single-sample `dst`.
    fn resolve(&self, dst: FramebufferId, src: FramebufferId) -> bool;

    /// Draws single-sample `src` as a textured quad over the whole of `dst`
    /// with source-over blending, linear filtering and clamp-to-edge wrapping.
    fn composite(&self, dst: FramebufferId, src: FramebufferId) -> bool;

    /// Reads the framebuffer back into `image`, which must already have the
    /// framebuffer's physical size.
    fn read_pixels_into(&self, id: FramebufferId, image: &mut RgbaImage) -> bool;

    /// Reads the framebuffer back into a freshly allocated image.
    fn read_pixels(&self, id: FramebufferId) -> Option<RgbaImage> {
        let size = self.framebuffer_size(id)?;
        let mut image = RgbaImage::new(size);
        self.read_pixels_into(id, &mut image).then_some(image)
    }
}

/// Shared off-screen paint device the context renders into. Owned by the
/// host; mutated by buffers only during reallocation.
pub trait GpuPaintDevice {
    fn size(&self) -> PhysicalSize;
    fn set_size(&self, size: PhysicalSize);
    fn device_pixel_ratio(&self) -> f64;
    fn set_device_pixel_ratio(&self, ratio: f64);
}

/// Makes `context` current if it is not already. Check-then-switch: the
/// switch is skipped when the context is already current.
pub(crate) fn ensure_current(context: &dyn GpuContext) -> Result<(), Diag> {
    if context.is_current() {
        return Ok(());
    }
    if context.make_current() {
        Ok(())
    } else {
        Err(Diag::MakeCurrentFailed)
    }
}
