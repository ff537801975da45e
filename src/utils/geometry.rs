use std::fmt;

/// Size of a two-dimensional image or surface in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    /// Horizontal size
    pub width: u32,
    /// Vertical size
    pub height: u32,
}

impl Extent {
    /// Extent reported when the surface size is decided by the swapchain
    pub const UNDEFINED: Extent = Extent {
        width: u32::MAX,
        height: u32::MAX,
    };

    /// Creates a new extent
    pub const fn new(width: u32, height: u32) -> Extent {
        Extent { width, height }
    }

    /// Returns true if either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns true for [`Extent::UNDEFINED`]
    pub fn is_undefined(&self) -> bool {
        *self == Extent::UNDEFINED
    }
}

impl From<(u32, u32)> for Extent {
    #[inline]
    fn from((width, height): (u32, u32)) -> Extent {
        Extent { width, height }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Two-dimensional offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Offset {
    /// Horizontal position
    pub x: i32,
    /// Vertical position
    pub y: i32,
}

/// A rectangle, used for present regions and present rectangles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Position of the top-left corner
    pub offset: Offset,
    /// Size of the rectangle
    pub extent: Extent,
}

impl Rect {
    /// Creates a new rectangle
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Rect {
        Rect {
            offset: Offset { x, y },
            extent: Extent { width, height },
        }
    }

    /// Rectangle covering a whole `extent`
    pub const fn from_extent(extent: Extent) -> Rect {
        Rect {
            offset: Offset { x: 0, y: 0 },
            extent,
        }
    }

    /// Clamps the rectangle to `bounds`, returning `None` if nothing is left
    pub fn clamp_to(&self, bounds: Extent) -> Option<Rect> {
        let x0 = self.offset.x.max(0) as i64;
        let y0 = self.offset.y.max(0) as i64;
        let x1 = (self.offset.x as i64 + self.extent.width as i64).min(bounds.width as i64);
        let y1 = (self.offset.y as i64 + self.extent.height as i64).min(bounds.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0 as i32, y0 as i32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::{Extent, Rect};

    #[test]
    fn clamp() {
        let bounds = Extent::new(100, 50);
        assert_eq!(
            Rect::new(-10, 10, 50, 100).clamp_to(bounds),
            Some(Rect::new(0, 10, 40, 40))
        );
        assert_eq!(Rect::new(100, 0, 10, 10).clamp_to(bounds), None);
    }
}
