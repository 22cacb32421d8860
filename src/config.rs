use std::rc::Weak;

use crate::buffer::fbo::FboPaintBuffer;
use crate::buffer::pixmap::PixmapPaintBuffer;
use crate::buffer::PaintBuffer;
use crate::diag::{report, Diag};
use crate::geometry::Size;
use crate::gpu::{GpuContext, GpuPaintDevice};

/// Rendering configuration for the paint-buffer layer.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Use the framebuffer-object backend when its collaborators are
    /// available.
    pub hardware_acceleration: bool,
    /// Multisample count to configure on the shared rendering context. The
    /// buffers themselves pick their sample count up from the context.
    pub multisamples: u32,
    /// Scale factor buffers are created with.
    pub device_pixel_ratio: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            hardware_acceleration: false,
            multisamples: 4,
            device_pixel_ratio: 1.0,
        }
    }
}

/// The shared collaborators the hardware backend needs, as weak references:
/// the host owns both and may tear them down at any time.
#[derive(Clone)]
pub struct GpuHandles {
    pub context: Weak<dyn GpuContext>,
    pub paint_device: Weak<dyn GpuPaintDevice>,
}

impl std::fmt::Debug for GpuHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuHandles").finish()
    }
}

/// Creates the paint buffer backend selected by `config`.
///
/// With hardware acceleration enabled and GPU collaborators supplied this
/// returns the framebuffer-object backend; otherwise the software backend.
/// Asking for acceleration without collaborators falls back to software with
/// a diagnostic.
pub fn create_paint_buffer(
    config: &RenderConfig,
    size: Size,
    layer_name: &str,
    gpu: Option<&GpuHandles>,
) -> Box<dyn PaintBuffer> {
    if config.hardware_acceleration {
        if let Some(gpu) = gpu {
            return Box::new(FboPaintBuffer::new(
                size,
                config.device_pixel_ratio,
                layer_name,
                gpu.context.clone(),
                gpu.paint_device.clone(),
            ));
        }
        report("create_paint_buffer", &Diag::ContextGone);
    }
    Box::new(PixmapPaintBuffer::new(size, config.device_pixel_ratio, layer_name))
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::geometry::PhysicalSize;
    use crate::gpu::headless::{HeadlessGpu, HeadlessPaintDevice};

    #[test]
    fn default_config_selects_software() {
        let buffer = create_paint_buffer(&RenderConfig::default(), Size::new(10, 10), "main", None);
        assert!(buffer.as_any().is::<PixmapPaintBuffer>());
        assert_eq!(buffer.size(), Size::new(10, 10));
    }

    #[test]
    fn acceleration_without_collaborators_falls_back_to_software() {
        let config = RenderConfig { hardware_acceleration: true, ..Default::default() };
        let buffer = create_paint_buffer(&config, Size::new(10, 10), "main", None);
        assert!(buffer.as_any().is::<PixmapPaintBuffer>());
    }

    #[test]
    fn acceleration_with_collaborators_selects_hardware() {
        let config = RenderConfig {
            hardware_acceleration: true,
            device_pixel_ratio: 2.0,
            ..Default::default()
        };
        let gpu = HeadlessGpu::new(config.multisamples);
        let device = HeadlessPaintDevice::new(Rc::clone(&gpu), PhysicalSize::new(0, 0));
        let context: Rc<dyn GpuContext> = gpu;
        let paint_device: Rc<dyn GpuPaintDevice> = device;
        let handles = GpuHandles {
            context: Rc::downgrade(&context),
            paint_device: Rc::downgrade(&paint_device),
        };

        let buffer = create_paint_buffer(&config, Size::new(10, 10), "main", Some(&handles));
        assert!(buffer.as_any().is::<FboPaintBuffer>());
        assert_eq!(buffer.device_pixel_ratio(), 2.0);
    }
}
