use std::ops::{Add, Sub};

/// A point in buffer-pixel space.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Point<N> {
    /// Horizontal coordinate
    pub x: N,
    /// Vertical coordinate
    pub y: N,
}

impl<N> Point<N> {
    /// Creates a new point from raw coordinates.
    pub const fn new(x: N, y: N) -> Self {
        Point { x, y }
    }
}

impl<N: Add<Output = N>> Add for Point<N> {
    type Output = Point<N>;

    fn add(self, other: Point<N>) -> Point<N> {
        Point::new(self.x + other.x, self.y + other.y)
    }
}

impl<N> From<(N, N)> for Point<N> {
    fn from((x, y): (N, N)) -> Point<N> {
        Point::new(x, y)
    }
}

/// A width/height pair in buffer-pixel space.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Size<N> {
    /// Width
    pub w: N,
    /// Height
    pub h: N,
}

impl<N> Size<N> {
    /// Creates a new size from raw width/height.
    pub const fn new(w: N, h: N) -> Self {
        Size { w, h }
    }
}

impl<N> From<(N, N)> for Size<N> {
    fn from((w, h): (N, N)) -> Size<N> {
        Size::new(w, h)
    }
}

/// An axis-aligned rectangle, given as a top-left `loc` and a `size`.
///
/// Used both for the plane manager's source/destination rectangles (§4.9)
/// and for `bo::Manager::lock`'s dirty-rect argument (§4.2).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Rect<N> {
    /// Top-left corner
    pub loc: Point<N>,
    /// Extent
    pub size: Size<N>,
}

impl<N: Copy> Rect<N> {
    /// Creates a new rectangle from a location and a size.
    pub const fn new(loc: Point<N>, size: Size<N>) -> Self {
        Rect { loc, size }
    }

    /// Creates a rectangle at the origin with the given size.
    pub const fn from_size(size: Size<N>) -> Self
    where
        N: Default,
    {
        Rect {
            loc: Point { x: N::default(), y: N::default() },
            size,
        }
    }
}

impl Rect<i32> {
    /// Returns `true` if this rectangle and `other` have identical extents
    /// (used by the Intel blit engine, which refuses to scale, §4.5).
    pub fn same_size(&self, other: &Rect<i32>) -> bool {
        self.size == other.size
    }
}

impl<N: Sub<Output = N> + Copy> Rect<N> {
    /// Width of the rectangle.
    pub fn width(&self) -> N {
        self.size.w
    }

    /// Height of the rectangle.
    pub fn height(&self) -> N {
        self.size.h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_same_size() {
        let a = Rect::new(Point::new(0, 0), Size::new(64, 32));
        let b = Rect::new(Point::new(10, 4), Size::new(64, 32));
        let c = Rect::new(Point::new(0, 0), Size::new(32, 32));
        assert!(a.same_size(&b));
        assert!(!a.same_size(&c));
    }
}
