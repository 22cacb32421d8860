use std::fmt::Debug;

/// Width/height of a paint buffer in logical units.
///
/// Logical units are what the layout above this layer works in; multiplying by
/// the device pixel ratio yields the physical storage extents.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Debug for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Size {{ width: {}, height: {} }}", self.width, self.height)
    }
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Physical storage extents for this logical size at the given device
    /// pixel ratio. Components are rounded half-away-from-zero.
    pub fn physical(&self, device_pixel_ratio: f64) -> PhysicalSize {
        PhysicalSize {
            width: (self.width as f64 * device_pixel_ratio).round() as u32,
            height: (self.height as f64 * device_pixel_ratio).round() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Width/height in physical (device) pixels.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PhysicalSize {
    pub width: u32,
    pub height: u32,
}

impl Debug for PhysicalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysicalSize {{ width: {}, height: {} }}", self.width, self.height)
    }
}

impl PhysicalSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Converts back to logical units by dividing out the device pixel ratio.
    pub fn logical(&self, device_pixel_ratio: f64) -> Size {
        Size {
            width: (self.width as f64 / device_pixel_ratio).round() as u32,
            height: (self.height as f64 / device_pixel_ratio).round() as u32,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Axis-aligned rectangle. Units depend on context: logical for painter
/// targets, physical for pixel-surface coordinates.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle of the given size anchored at the origin.
    pub fn of_size(size: Size) -> Self {
        Self { x: 0, y: 0, width: size.width, height: size.height }
    }
}

/// Tolerance-based equality for device pixel ratios, so that repeated
/// `set_device_pixel_ratio` calls with a recomputed ratio do not trigger a
/// reallocation. Same tolerance model as Qt's `qFuzzyCompare`.
pub fn fuzzy_eq(a: f64, b: f64) -> bool {
    (a - b).abs() * 1e12 <= a.abs().min(b.abs())
}
