//! Hilbert curve over the full `u32 x u32` plane.

/// Side length of the curve's grid: every `u32` coordinate is a cell.
const ORDER: u32 = 32;

/// Maps a cell to its distance along the Hilbert curve.
///
/// Consecutive indices are always edge-adjacent cells, which keeps
/// rectangles that are close in the plane close in sort order.
pub fn xy_to_index(x: u32, y: u32) -> u64 {
    let n: u64 = 1 << ORDER;
    let (mut x, mut y) = (u64::from(x), u64::from(y));
    let mut d: u64 = 0;
    let mut s: u64 = n / 2;
    while s > 0 {
        let rx = u64::from(x & s != 0);
        let ry = u64::from(y & s != 0);
        d += s * s * ((3 * rx) ^ ry);
        if ry == 0 {
            if rx == 1 {
                x = n - 1 - x;
                y = n - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

/// Inverse of [`xy_to_index`].
pub fn index_to_xy(index: u64) -> (u32, u32) {
    let n: u64 = 1 << ORDER;
    let (mut x, mut y) = (0u64, 0u64);
    let mut t = index;
    let mut s: u64 = 1;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        if ry == 0 {
            if rx == 1 {
                x = s - 1 - x;
                y = s - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    (x as u32, y as u32)
}
