#![forbid(unsafe_code)]

//! Abstract drawing surface and retained display lists.
//!
//! The engine never rasterizes. Everything that would be drawn is issued
//! against the [`Surface`] trait; the windowing layer implements it over a
//! real 2D context. Internally, panes cache their rendered output as a
//! [`DisplayList`] — a recorded vector of [`DrawOp`]s that itself
//! implements [`Surface`], so the same painting code can target a real
//! backend or a cache.
//!
//! Replaying a list into another surface applies an affine transform and
//! an opacity factor, which is how child panes are composited into their
//! parent's cache.

use kurbo::{Affine, Point, Rect};
use terrapin_core::color::Color;

/// Opaque reference to an image owned by the windowing layer.
///
/// The engine passes handles through; decoding and pixel storage live
/// behind the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u32);

/// An abstract 2D drawing surface.
pub trait Surface {
    /// Fill an axis-aligned rectangle.
    fn fill_rect(&mut self, rect: Rect, color: Color);

    /// Stroke the outline of an axis-aligned rectangle.
    fn stroke_rect(&mut self, rect: Rect, width: f64, color: Color);

    /// Draw a line segment.
    fn draw_line(&mut self, from: Point, to: Point, width: f64, color: Color);

    /// Fill a closed polygon.
    fn fill_polygon(&mut self, points: &[Point], color: Color);

    /// Draw text anchored at a baseline point.
    fn draw_text(&mut self, anchor: Point, text: &str, color: Color);

    /// Draw an image under a placement transform.
    fn draw_image(&mut self, image: ImageHandle, placement: Affine, opacity: f64);
}

/// A single recorded drawing operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    /// Filled axis-aligned rectangle.
    FillRect {
        /// Rectangle in local coordinates.
        rect: Rect,
        /// Fill color.
        color: Color,
    },
    /// Stroked axis-aligned rectangle.
    StrokeRect {
        /// Rectangle in local coordinates.
        rect: Rect,
        /// Stroke width.
        width: f64,
        /// Stroke color.
        color: Color,
    },
    /// Line segment.
    Line {
        /// Start point.
        from: Point,
        /// End point.
        to: Point,
        /// Stroke width.
        width: f64,
        /// Stroke color.
        color: Color,
    },
    /// Filled polygon.
    Polygon {
        /// Vertices in order.
        points: Vec<Point>,
        /// Fill color.
        color: Color,
    },
    /// Text run.
    Text {
        /// Baseline anchor.
        anchor: Point,
        /// The text.
        text: String,
        /// Text color.
        color: Color,
    },
    /// Image blit.
    Image {
        /// Backend image reference.
        image: ImageHandle,
        /// Placement transform.
        placement: Affine,
        /// Opacity factor in `[0, 1]`.
        opacity: f64,
    },
}

/// A recorded sequence of drawing operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayList {
    ops: Vec<DrawOp>,
}

impl DisplayList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all recorded operations.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Number of recorded operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The recorded operations, in order.
    #[must_use]
    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    /// Append a raw operation.
    pub fn push(&mut self, op: DrawOp) {
        self.ops.push(op);
    }

    /// Replay every operation into `target`, mapping geometry through
    /// `transform` and scaling alpha by `opacity`.
    ///
    /// Rectangles stay rectangles under axis-aligned transforms; under
    /// rotation a fill becomes a polygon and a stroke becomes four lines.
    /// Line and stroke widths are not scaled by the transform.
    pub fn replay(&self, target: &mut dyn Surface, transform: Affine, opacity: f64) {
        let axis_aligned = is_axis_aligned(transform);
        for op in &self.ops {
            match op {
                DrawOp::FillRect { rect, color } => {
                    let color = color.scale_alpha(opacity);
                    if axis_aligned {
                        target.fill_rect(map_rect(transform, *rect), color);
                    } else {
                        target.fill_polygon(&map_corners(transform, *rect), color);
                    }
                }
                DrawOp::StrokeRect { rect, width, color } => {
                    let color = color.scale_alpha(opacity);
                    if axis_aligned {
                        target.stroke_rect(map_rect(transform, *rect), *width, color);
                    } else {
                        let c = map_corners(transform, *rect);
                        for i in 0..4 {
                            target.draw_line(c[i], c[(i + 1) % 4], *width, color);
                        }
                    }
                }
                DrawOp::Line {
                    from,
                    to,
                    width,
                    color,
                } => {
                    target.draw_line(
                        transform * *from,
                        transform * *to,
                        *width,
                        color.scale_alpha(opacity),
                    );
                }
                DrawOp::Polygon { points, color } => {
                    let mapped: Vec<Point> = points.iter().map(|p| transform * *p).collect();
                    target.fill_polygon(&mapped, color.scale_alpha(opacity));
                }
                DrawOp::Text {
                    anchor,
                    text,
                    color,
                } => {
                    target.draw_text(transform * *anchor, text, color.scale_alpha(opacity));
                }
                DrawOp::Image {
                    image,
                    placement,
                    opacity: image_opacity,
                } => {
                    target.draw_image(*image, transform * *placement, image_opacity * opacity);
                }
            }
        }
    }
}

impl Surface for DisplayList {
    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.ops.push(DrawOp::FillRect { rect, color });
    }

    fn stroke_rect(&mut self, rect: Rect, width: f64, color: Color) {
        self.ops.push(DrawOp::StrokeRect { rect, width, color });
    }

    fn draw_line(&mut self, from: Point, to: Point, width: f64, color: Color) {
        self.ops.push(DrawOp::Line {
            from,
            to,
            width,
            color,
        });
    }

    fn fill_polygon(&mut self, points: &[Point], color: Color) {
        self.ops.push(DrawOp::Polygon {
            points: points.to_vec(),
            color,
        });
    }

    fn draw_text(&mut self, anchor: Point, text: &str, color: Color) {
        self.ops.push(DrawOp::Text {
            anchor,
            text: text.to_string(),
            color,
        });
    }

    fn draw_image(&mut self, image: ImageHandle, placement: Affine, opacity: f64) {
        self.ops.push(DrawOp::Image {
            image,
            placement,
            opacity,
        });
    }
}

fn is_axis_aligned(transform: Affine) -> bool {
    let [_, b, c, _, _, _] = transform.as_coeffs();
    b == 0.0 && c == 0.0
}

fn map_rect(transform: Affine, rect: Rect) -> Rect {
    let p0 = transform * Point::new(rect.x0, rect.y0);
    let p1 = transform * Point::new(rect.x1, rect.y1);
    Rect::from_points(p0, p1)
}

fn map_corners(transform: Affine, rect: Rect) -> [Point; 4] {
    [
        transform * Point::new(rect.x0, rect.y0),
        transform * Point::new(rect.x1, rect.y0),
        transform * Point::new(rect.x1, rect.y1),
        transform * Point::new(rect.x0, rect.y1),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
