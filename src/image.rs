use anyhow::{ensure, Result};

use crate::color::Color;
use crate::geometry::{PhysicalSize, Rect, Size};

/// CPU-side RGBA8 image, as produced by a framebuffer readback.
///
/// `stride` is the row length in bytes and may exceed `width * 4` when the
/// producer pads rows. The device pixel ratio tag tells consumers how to map
/// the physical extents back to logical units.
#[derive(Clone)]
pub struct RgbaImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    device_pixel_ratio: f64,
}

impl std::fmt::Debug for RgbaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbaImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.pixels.len())
            .field("device_pixel_ratio", &self.device_pixel_ratio)
            .finish()
    }
}

impl RgbaImage {
    /// Allocates a zeroed (fully transparent) image.
    pub fn new(size: PhysicalSize) -> Self {
        let stride = size.width * 4;
        Self {
            pixels: vec![0u8; size.height as usize * stride as usize],
            width: size.width,
            height: size.height,
            stride,
            device_pixel_ratio: 1.0,
        }
    }

    pub fn from_raw(pixels: Vec<u8>, width: u32, height: u32, stride: u32) -> Result<Self> {
        ensure!(
            pixels.len() >= height as usize * stride as usize,
            "pixel buffer too small for image dimensions"
        );
        ensure!(stride >= width * 4, "stride shorter than a pixel row");
        Ok(Self { pixels, width, height, stride, device_pixel_ratio: 1.0 })
    }

    pub fn size(&self) -> PhysicalSize {
        PhysicalSize::new(self.width, self.height)
    }

    /// The image's own extents as a source rectangle at the origin.
    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    pub fn set_device_pixel_ratio(&mut self, ratio: f64) {
        self.device_pixel_ratio = ratio;
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = y as usize * self.stride as usize + x as usize * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[offset..offset + 4]);
        px
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, px: [u8; 4]) {
        let offset = y as usize * self.stride as usize + x as usize * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&px);
    }
}

/// Owned software raster storage of a pixmap paint buffer.
///
/// Pixels are RGBA8 with straight alpha, row-major, tightly packed. The
/// device pixel ratio tag lets consumers interpret the physical extents
/// against the logical size the buffer was configured with.
pub struct PixelSurface {
    pixels: Vec<u8>,
    size: PhysicalSize,
    device_pixel_ratio: f64,
}

impl std::fmt::Debug for PixelSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelSurface")
            .field("size", &self.size)
            .field("device_pixel_ratio", &self.device_pixel_ratio)
            .finish()
    }
}

impl PixelSurface {
    /// Allocates a transparent surface at the given physical size.
    pub fn new(size: PhysicalSize, device_pixel_ratio: f64) -> Self {
        Self {
            pixels: vec![0u8; size.pixel_count() * 4],
            size,
            device_pixel_ratio,
        }
    }

    pub fn from_raw(pixels: Vec<u8>, size: PhysicalSize, device_pixel_ratio: f64) -> Result<Self> {
        ensure!(
            pixels.len() >= size.pixel_count() * 4,
            "pixel buffer too small for surface dimensions"
        );
        Ok(Self { pixels, size, device_pixel_ratio })
    }

    pub fn size(&self) -> PhysicalSize {
        self.size
    }

    /// Logical extents, i.e. physical size divided by the scale tag.
    pub fn logical_size(&self) -> Size {
        self.size.logical(self.device_pixel_ratio)
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    /// Overwrites every pixel with `color`.
    pub fn fill(&mut self, color: Color) {
        let px = color.to_rgba8();
        for chunk in self.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px);
        }
    }

    /// Source-over fills a rectangle given in physical coordinates. Areas
    /// outside the surface are clipped.
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let src = color.to_rgba8();
        let x0 = rect.x.max(0) as u32;
        let y0 = rect.y.max(0) as u32;
        let x1 = (rect.x.saturating_add(rect.width as i32)).max(0) as u32;
        let y1 = (rect.y.saturating_add(rect.height as i32)).max(0) as u32;
        for y in y0..y1.min(self.size.height) {
            for x in x0..x1.min(self.size.width) {
                let px = blend_rgba8(src, self.pixel(x, y));
                self.put_pixel(x, y, px);
            }
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.size.width as usize + x as usize) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[offset..offset + 4]);
        px
    }

    pub(crate) fn put_pixel(&mut self, x: u32, y: u32, px: [u8; 4]) {
        let offset = (y as usize * self.size.width as usize + x as usize) * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&px);
    }

    /// Copies the surface contents out as an image carrying the same scale tag.
    pub fn to_image(&self) -> RgbaImage {
        let mut image = RgbaImage::new(self.size);
        image.pixels.copy_from_slice(&self.pixels);
        image.set_device_pixel_ratio(self.device_pixel_ratio);
        image
    }
}

/// Standard source-over compositing of straight-alpha RGBA8 pixels.
pub(crate) fn blend_rgba8(src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    let sa = src[3] as f32 / 255.0;
    if sa >= 1.0 {
        return src;
    }
    let da = dst[3] as f32 / 255.0;
    let oa = sa + da * (1.0 - sa);
    if oa <= 0.0 {
        return [0, 0, 0, 0];
    }
    let mut out = [0u8; 4];
    for c in 0..3 {
        let sc = src[c] as f32 / 255.0;
        let dc = dst[c] as f32 / 255.0;
        out[c] = (((sc * sa + dc * da * (1.0 - sa)) / oa) * 255.0).round() as u8;
    }
    out[3] = (oa * 255.0).round() as u8;
    out
}
