//! Software emulation of the shared GPU context and paint device.
//!
//! Always available, like the software paint buffer itself. The emulation
//! keeps one RGBA8 pixel array per framebuffer object and implements resolve,
//! source-over compositing and readback on the CPU, so the hardware code
//! paths run unchanged on machines without a usable GPU and in tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::color::Color;
use crate::diag::{report, Diag};
use crate::geometry::{PhysicalSize, Rect};
use crate::gpu::{FramebufferId, GpuContext, GpuPaintDevice};
use crate::image::{blend_rgba8, RgbaImage};

struct Framebuffer {
    size: PhysicalSize,
    #[allow(unused)]
    samples: u32,
    pixels: Vec<u8>,
}

impl Framebuffer {
    fn new(size: PhysicalSize, samples: u32) -> Self {
        Self { size, samples, pixels: vec![0u8; size.pixel_count() * 4] }
    }

    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.size.width as usize + x as usize) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[offset..offset + 4]);
        px
    }

    fn put_pixel(&mut self, x: u32, y: u32, px: [u8; 4]) {
        let offset = (y as usize * self.size.width as usize + x as usize) * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&px);
    }
}

/// CPU-emulated rendering context.
pub struct HeadlessGpu {
    framebuffers: RefCell<HashMap<FramebufferId, Framebuffer>>,
    next_id: Cell<u64>,
    bound: Cell<Option<FramebufferId>>,
    current: Cell<bool>,
    make_current_calls: Cell<u32>,
    samples: u32,
}

impl std::fmt::Debug for HeadlessGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessGpu")
            .field("framebuffers", &self.framebuffers.borrow().len())
            .field("bound", &self.bound.get())
            .field("samples", &self.samples)
            .finish()
    }
}

impl HeadlessGpu {
    pub fn new(samples: u32) -> Rc<Self> {
        Rc::new(Self {
            framebuffers: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            bound: Cell::new(None),
            current: Cell::new(false),
            make_current_calls: Cell::new(0),
            samples,
        })
    }

    /// Number of live framebuffer objects.
    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.borrow().len()
    }

    /// How often the context has been made current. Lets callers verify the
    /// check-then-switch discipline.
    pub fn make_current_calls(&self) -> u32 {
        self.make_current_calls.get()
    }

    pub fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.bound.get()
    }

    /// Source-over fills a rectangle (physical coordinates) into the
    /// currently bound framebuffer. This is the emulation's stand-in for
    /// drawing through the shared paint device.
    pub fn fill_rect(&self, rect: Rect, color: Color) {
        let Some(id) = self.bound.get() else {
            report("HeadlessGpu::fill_rect", &Diag::NotBound);
            return;
        };
        let mut framebuffers = self.framebuffers.borrow_mut();
        let Some(fb) = framebuffers.get_mut(&id) else {
            report("HeadlessGpu::fill_rect", &Diag::FramebufferMissing);
            return;
        };
        let src = color.to_rgba8();
        let x0 = rect.x.max(0) as u32;
        let y0 = rect.y.max(0) as u32;
        let x1 = (rect.x.saturating_add(rect.width as i32)).max(0) as u32;
        let y1 = (rect.y.saturating_add(rect.height as i32)).max(0) as u32;
        for y in y0..y1.min(fb.size.height) {
            for x in x0..x1.min(fb.size.width) {
                let px = blend_rgba8(src, fb.pixel(x, y));
                fb.put_pixel(x, y, px);
            }
        }
    }
}

impl GpuContext for HeadlessGpu {
    fn is_current(&self) -> bool {
        self.current.get()
    }

    fn make_current(&self) -> bool {
        self.make_current_calls.set(self.make_current_calls.get() + 1);
        self.current.set(true);
        true
    }

    fn samples(&self) -> u32 {
        self.samples
    }

    fn create_framebuffer(&self, size: PhysicalSize, samples: u32) -> Option<FramebufferId> {
        if size.pixel_count() == 0 {
            return None;
        }
        let id = FramebufferId::new(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.framebuffers.borrow_mut().insert(id, Framebuffer::new(size, samples));
        Some(id)
    }

    fn delete_framebuffer(&self, id: FramebufferId) {
        if self.bound.get() == Some(id) {
            self.bound.set(None);
        }
        self.framebuffers.borrow_mut().remove(&id);
    }

    fn is_framebuffer_valid(&self, id: FramebufferId) -> bool {
        self.framebuffers.borrow().contains_key(&id)
    }

    fn framebuffer_size(&self, id: FramebufferId) -> Option<PhysicalSize> {
        self.framebuffers.borrow().get(&id).map(|fb| fb.size)
    }

    fn bind(&self, id: FramebufferId) -> bool {
        if !self.is_framebuffer_valid(id) {
            return false;
        }
        self.bound.set(Some(id));
        true
    }

    fn release(&self, id: FramebufferId) {
        if self.bound.get() == Some(id) {
            self.bound.set(None);
        }
    }

    fn is_bound(&self, id: FramebufferId) -> bool {
        self.bound.get() == Some(id)
    }

    fn clear_color_depth(&self, id: FramebufferId, color: Color) {
        let mut framebuffers = self.framebuffers.borrow_mut();
        let Some(fb) = framebuffers.get_mut(&id) else {
            report("HeadlessGpu::clear_color_depth", &Diag::FramebufferMissing);
            return;
        };
        let px = color.to_rgba8();
        for chunk in fb.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px);
        }
    }

    fn resolve(&self, dst: FramebufferId, src: FramebufferId) -> bool {
        let mut framebuffers = self.framebuffers.borrow_mut();
        let Some(src_fb) = framebuffers.get(&src) else { return false };
        let (size, pixels) = (src_fb.size, src_fb.pixels.clone());
        let Some(dst_fb) = framebuffers.get_mut(&dst) else { return false };
        if dst_fb.size != size {
            return false;
        }
        // a multisample resolve degenerates to a copy in the emulation
        dst_fb.pixels = pixels;
        true
    }

    fn composite(&self, dst: FramebufferId, src: FramebufferId) -> bool {
        let mut framebuffers = self.framebuffers.borrow_mut();
        let Some(src_fb) = framebuffers.get(&src) else { return false };
        let (src_size, src_pixels) = (src_fb.size, src_fb.pixels.clone());
        let Some(dst_fb) = framebuffers.get_mut(&dst) else { return false };
        if src_size.pixel_count() == 0 {
            return false;
        }
        let src_at = |x: u32, y: u32| -> [u8; 4] {
            let offset = (y as usize * src_size.width as usize + x as usize) * 4;
            let mut px = [0u8; 4];
            px.copy_from_slice(&src_pixels[offset..offset + 4]);
            px
        };
        // stretch src over the whole destination, nearest sampling
        for y in 0..dst_fb.size.height {
            let sy = (y as u64 * src_size.height as u64 / dst_fb.size.height as u64) as u32;
            for x in 0..dst_fb.size.width {
                let sx = (x as u64 * src_size.width as u64 / dst_fb.size.width as u64) as u32;
                let px = blend_rgba8(src_at(sx, sy), dst_fb.pixel(x, y));
                dst_fb.put_pixel(x, y, px);
            }
        }
        true
    }

    fn read_pixels_into(&self, id: FramebufferId, image: &mut RgbaImage) -> bool {
        let framebuffers = self.framebuffers.borrow();
        let Some(fb) = framebuffers.get(&id) else { return false };
        if image.size() != fb.size || (image.stride as usize) < fb.size.width as usize * 4 {
            return false;
        }
        let row = fb.size.width as usize * 4;
        for y in 0..fb.size.height as usize {
            let src = &fb.pixels[y * row..(y + 1) * row];
            let offset = y * image.stride as usize;
            image.pixels[offset..offset + row].copy_from_slice(src);
        }
        true
    }
}

/// CPU-emulated shared paint device.
#[derive(Debug)]
pub struct HeadlessPaintDevice {
    gpu: Rc<HeadlessGpu>,
    size: Cell<PhysicalSize>,
    device_pixel_ratio: Cell<f64>,
}

impl HeadlessPaintDevice {
    pub fn new(gpu: Rc<HeadlessGpu>, size: PhysicalSize) -> Rc<Self> {
        Rc::new(Self {
            gpu,
            size: Cell::new(size),
            device_pixel_ratio: Cell::new(1.0),
        })
    }

    /// Draws into whatever framebuffer is currently bound on the context,
    /// matching how painting through a real shared paint device lands.
    pub fn fill_rect(&self, rect: Rect, color: Color) {
        self.gpu.fill_rect(rect, color);
    }
}

impl GpuPaintDevice for HeadlessPaintDevice {
    fn size(&self) -> PhysicalSize {
        self.size.get()
    }

    fn set_size(&self, size: PhysicalSize) {
        self.size.set(size);
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio.get()
    }

    fn set_device_pixel_ratio(&self, ratio: f64) {
        self.device_pixel_ratio.set(ratio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ensure_current;

    #[test]
    fn create_clear_and_read_back() {
        let gpu = HeadlessGpu::new(1);
        let id = gpu.create_framebuffer(PhysicalSize::new(4, 4), 1).unwrap();
        gpu.clear_color_depth(id, Color::from_u8(0, 0, 255, 255));
        let image = gpu.read_pixels(id).unwrap();
        assert_eq!(image.pixel(0, 0), [0, 0, 255, 255]);
        assert_eq!(image.pixel(3, 3), [0, 0, 255, 255]);
    }

    #[test]
    fn zero_sized_framebuffers_are_rejected() {
        let gpu = HeadlessGpu::new(1);
        assert!(gpu.create_framebuffer(PhysicalSize::new(0, 10), 1).is_none());
    }

    #[test]
    fn bind_release_tracking() {
        let gpu = HeadlessGpu::new(1);
        let id = gpu.create_framebuffer(PhysicalSize::new(2, 2), 1).unwrap();
        assert!(!gpu.is_bound(id));
        assert!(gpu.bind(id));
        assert!(gpu.is_bound(id));
        gpu.release(id);
        assert!(!gpu.is_bound(id));
        assert!(!gpu.bind(FramebufferId::new(999)));
    }

    #[test]
    fn ensure_current_switches_only_once() {
        let gpu = HeadlessGpu::new(1);
        assert!(ensure_current(&*gpu).is_ok());
        assert!(ensure_current(&*gpu).is_ok());
        assert_eq!(gpu.make_current_calls(), 1);
    }

    #[test]
    fn fill_rect_requires_a_bound_framebuffer() {
        let gpu = HeadlessGpu::new(1);
        let id = gpu.create_framebuffer(PhysicalSize::new(4, 4), 1).unwrap();
        // nothing bound: diagnostic no-op
        gpu.fill_rect(Rect::new(0, 0, 4, 4), Color::from_u8(255, 0, 0, 255));
        assert_eq!(gpu.read_pixels(id).unwrap().pixel(0, 0), [0, 0, 0, 0]);

        gpu.bind(id);
        gpu.fill_rect(Rect::new(1, 1, 2, 2), Color::from_u8(255, 0, 0, 255));
        gpu.release(id);
        let image = gpu.read_pixels(id).unwrap();
        assert_eq!(image.pixel(1, 1), [255, 0, 0, 255]);
        assert_eq!(image.pixel(0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn composite_blends_source_over() {
        let gpu = HeadlessGpu::new(1);
        let dst = gpu.create_framebuffer(PhysicalSize::new(2, 2), 1).unwrap();
        let src = gpu.create_framebuffer(PhysicalSize::new(2, 2), 1).unwrap();
        gpu.clear_color_depth(dst, Color::from_u8(255, 255, 255, 255));
        gpu.clear_color_depth(src, Color::new(1.0, 0.0, 0.0, 0.5));
        assert!(gpu.composite(dst, src));
        let image = gpu.read_pixels(dst).unwrap();
        let px = image.pixel(0, 0);
        assert_eq!(px[3], 255);
        assert!((px[1] as i32 - 127).abs() <= 2, "expected half-blended green channel, got {px:?}");
    }

    #[test]
    fn delete_framebuffer_unbinds_it() {
        let gpu = HeadlessGpu::new(1);
        let id = gpu.create_framebuffer(PhysicalSize::new(2, 2), 1).unwrap();
        gpu.bind(id);
        gpu.delete_framebuffer(id);
        assert_eq!(gpu.bound_framebuffer(), None);
        assert_eq!(gpu.framebuffer_count(), 0);
    }
}
