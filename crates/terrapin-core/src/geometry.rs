#![forbid(unsafe_code)]

//! Angular math and geometric re-exports.
//!
//! Headings follow the turtle convention: 0° points up (−y on a y-down
//! surface) and angles grow clockwise, so 90° points right. All public
//! heading values are normalized into `[0, 360)`.
//!
//! Affine transforms, points, and rectangles come from [`kurbo`].

pub use kurbo::{Affine, Point, Rect, Vec2};

/// Normalize an angle in degrees into `[0, 360)`.
#[inline]
#[must_use]
pub fn normalize_degrees(angle: f64) -> f64 {
    let n = angle.rem_euclid(360.0);
    // rem_euclid can round to exactly 360.0 for tiny negative inputs.
    if n >= 360.0 { 0.0 } else { n }
}

/// Signed angular delta for a clockwise sweep from `start` to `end`.
///
/// The result is in `[0, 360)`: sweeping clockwise by the returned amount
/// from `start` lands on `end`.
#[inline]
#[must_use]
pub fn clockwise_delta(start: f64, end: f64) -> f64 {
    normalize_degrees(end - start)
}

/// Signed angular delta for a counter-clockwise sweep from `start` to `end`.
///
/// The result is in `(-360, 0]`: sweeping by the returned (negative) amount
/// from `start` lands on `end`.
#[inline]
#[must_use]
pub fn counter_clockwise_delta(start: f64, end: f64) -> f64 {
    -normalize_degrees(start - end)
}

/// Unit vector for a heading in degrees (0° = up, clockwise positive).
#[inline]
#[must_use]
pub fn heading_to_vec(heading: f64) -> Vec2 {
    let rad = heading.to_radians();
    Vec2::new(rad.sin(), -rad.cos())
}

/// Heading in degrees for a direction vector, normalized into `[0, 360)`.
///
/// A zero vector maps to heading 0.
#[inline]
#[must_use]
pub fn vec_to_heading(v: Vec2) -> f64 {
    if v.x == 0.0 && v.y == 0.0 {
        return 0.0;
    }
    normalize_degrees(v.x.atan2(-v.y).to_degrees())
}

/// Linear interpolation between two points.
#[inline]
#[must_use]
pub fn lerp_point(from: Point, to: Point, fraction: f64) -> Point {
    Point::new(
        from.x + (to.x - from.x) * fraction,
        from.y + (to.y - from.y) * fraction,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
