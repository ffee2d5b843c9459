#![forbid(unsafe_code)]

//! Pluggable turtle shapes.
//!
//! A [`TurtleShape`] turns a turtle's visual state into surface calls and
//! answers hit tests. Image-backed and animated-GIF shapes live behind
//! this trait in the windowing layer; the engine only ships
//! [`ClassicShape`], a vector triangle used as the default and in tests.

use std::time::Duration;

use kurbo::{Point, Vec2};
use terrapin_core::color::Color;
use terrapin_core::geometry::heading_to_vec;

use crate::surface::Surface;

/// Snapshot of the turtle state a shape needs to paint itself.
#[derive(Debug, Clone, Copy)]
pub struct ShapeContext {
    /// Turtle position in the parent pane's coordinates.
    pub position: Point,
    /// Heading in degrees, 0 = up, clockwise.
    pub direction: f64,
    /// Uniform scale factor.
    pub scale: f64,
    /// Opacity in `[0, 1]` (1 = opaque).
    pub opacity: f64,
    /// Selected view index.
    pub view: usize,
    /// Selected animation frame index.
    pub frame: usize,
    /// Current pen color (used for outlines).
    pub pen_color: Color,
    /// Current fill color (used for bodies).
    pub fill_color: Color,
}

/// Renders and hit-tests a turtle.
pub trait TurtleShape: Send + Sync {
    /// Paint the turtle onto the surface.
    fn paint(&self, cx: &ShapeContext, surface: &mut dyn Surface);

    /// Whether a point (in the same coordinates as `cx.position`) hits
    /// the shape.
    fn hit_test(&self, cx: &ShapeContext, point: Point) -> bool;

    /// Number of selectable views.
    fn view_count(&self) -> usize {
        1
    }

    /// Number of animation frames per view.
    fn frame_count(&self) -> usize {
        1
    }

    /// Delay between animation frames; zero for static shapes.
    fn frame_duration(&self) -> Duration {
        Duration::ZERO
    }
}

/// The default vector turtle: an isosceles triangle pointing along the
/// heading, filled with the fill color and outlined with the pen color.
#[derive(Debug, Clone, Copy)]
pub struct ClassicShape {
    size: f64,
}

impl ClassicShape {
    /// Create a triangle shape with the given tip-to-base length.
    #[must_use]
    pub fn new(size: f64) -> Self {
        Self {
            size: size.max(1.0),
        }
    }

    fn corners(&self, cx: &ShapeContext) -> [Point; 3] {
        let len = self.size * cx.scale;
        let ahead = heading_to_vec(cx.direction);
        // Perpendicular (90° clockwise of the heading).
        let side = Vec2::new(-ahead.y, ahead.x);
        let tip = cx.position + ahead * len;
        let base = cx.position - ahead * (len * 0.4);
        [
            tip,
            base + side * (len * 0.5),
            base - side * (len * 0.5),
        ]
    }
}

impl Default for ClassicShape {
    fn default() -> Self {
        Self::new(12.0)
    }
}

impl TurtleShape for ClassicShape {
    fn paint(&self, cx: &ShapeContext, surface: &mut dyn Surface) {
        let corners = self.corners(cx);
        surface.fill_polygon(&corners, cx.fill_color.scale_alpha(cx.opacity));
        let outline = cx.pen_color.scale_alpha(cx.opacity);
        for i in 0..3 {
            surface.draw_line(corners[i], corners[(i + 1) % 3], 1.0, outline);
        }
    }

    fn hit_test(&self, cx: &ShapeContext, point: Point) -> bool {
        // Coarse circular hit area around the body; exact triangle
        // containment is not worth the trouble at teaching scale.
        let radius = self.size * cx.scale;
        (point - cx.position).hypot() <= radius
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{DisplayList, DrawOp};

    fn cx() -> ShapeContext {
        ShapeContext {
            position: Point::new(50.0, 50.0),
            direction: 0.0,
            scale: 1.0,
            opacity: 1.0,
            view: 0,
            frame: 0,
            pen_color: Color::BLACK,
            fill_color: Color::GREEN,
        }
    }

    #[test]
    fn paints_a_polygon_and_outline() {
        let shape = ClassicShape::default();
        let mut list = DisplayList::new();
        shape.paint(&cx(), &mut list);
        assert!(matches!(list.ops()[0], DrawOp::Polygon { .. }));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn tip_points_along_heading() {
        let shape = ClassicShape::new(10.0);
        let corners = shape.corners(&cx());
        // Heading 0 = up: the tip is above the position.
        assert!((corners[0].x - 50.0).abs() < 1e-9);
        assert!(corners[0].y < 50.0);
    }

    #[test]
    fn hit_test_is_centered_on_position() {
        let shape = ClassicShape::new(10.0);
        let context = cx();
        assert!(shape.hit_test(&context, Point::new(50.0, 50.0)));
        assert!(shape.hit_test(&context, Point::new(55.0, 50.0)));
        assert!(!shape.hit_test(&context, Point::new(80.0, 50.0)));
    }

    #[test]
    fn static_shape_defaults() {
        let shape = ClassicShape::default();
        assert_eq!(shape.view_count(), 1);
        assert_eq!(shape.frame_count(), 1);
        assert_eq!(shape.frame_duration(), Duration::ZERO);
    }
}
