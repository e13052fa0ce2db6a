use byteorder::{ByteOrder, LittleEndian};

/// Axis-aligned rectangle with inclusive `u32` bounds.
///
/// Constructors normalise the corners so that `x0 <= x1` and `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    /// Length of [`Rect::to_bytes`].
    pub const ENCODED_LEN: usize = 16;

    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Rect {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn point(x: u32, y: u32) -> Self {
        Rect::new(x, y, x, y)
    }

    /// True when the two rectangles share at least one cell; touching
    /// edges count.
    pub fn intersects(&self, other: &Rect) -> bool {
        other.x0 <= self.x1 && other.x1 >= self.x0 && other.y0 <= self.y1 && other.y1 >= self.y0
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x0 <= other.x0 && self.y0 <= other.y0 && self.x1 >= other.x1 && self.y1 >= other.y1
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn center(&self) -> (u32, u32) {
        (midpoint(self.x0, self.x1), midpoint(self.y0, self.y1))
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        LittleEndian::write_u32_into(&[self.x0, self.y0, self.x1, self.y1], &mut buf);
        buf
    }

    /// Decodes a rectangle; `None` unless `bytes` is exactly
    /// [`Rect::ENCODED_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Rect> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut coords = [0u32; 4];
        LittleEndian::read_u32_into(bytes, &mut coords);
        Some(Rect::new(coords[0], coords[1], coords[2], coords[3]))
    }
}

fn midpoint(a: u32, b: u32) -> u32 {
    (a / 2) + (b / 2) + (a & b & 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_normalises_corners() {
        let r = Rect::new(1, 1, 0, 0);
        assert_eq!(r, Rect::new(0, 0, 1, 1));
        assert_eq!((r.x0, r.y0, r.x1, r.y1), (0, 0, 1, 1));
    }

    #[test]
    fn intersection_is_inclusive() {
        let a = Rect::new(0, 0, 2, 2);
        assert!(a.intersects(&Rect::new(2, 2, 5, 5)));
        assert!(a.intersects(&Rect::point(1, 1)));
        assert!(!a.intersects(&Rect::new(3, 0, 4, 2)));
        assert!(!a.intersects(&Rect::new(0, 3, 2, 4)));
        assert!(Rect::new(0, 0, 10, 10).intersects(&Rect::new(4, 4, 5, 5)));
    }

    #[test]
    fn union_and_contains() {
        let u = Rect::new(0, 5, 1, 6).union(&Rect::new(4, 0, 7, 1));
        assert_eq!(u, Rect::new(0, 0, 7, 6));
        assert!(u.contains(&Rect::new(0, 5, 1, 6)));
        assert!(!Rect::new(0, 5, 1, 6).contains(&u));
    }

    #[test]
    fn center_does_not_overflow() {
        assert_eq!(Rect::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX).center(), (u32::MAX, u32::MAX));
        assert_eq!(Rect::new(3, 4, 5, 4).center(), (4, 4));
        assert_eq!(Rect::new(0, 0, 1, 1).center(), (0, 0));
    }

    #[test]
    fn bytes_roundtrip_and_reject_bad_length() {
        let r = Rect::new(9, 8, 70_000, 65_536);
        assert_eq!(Rect::from_bytes(&r.to_bytes()), Some(r));
        assert_eq!(Rect::from_bytes(b"short"), None);
    }
}
