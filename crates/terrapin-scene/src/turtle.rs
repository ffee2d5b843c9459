#![forbid(unsafe_code)]

//! Turtles: movable actors that draw trails and animate their motion.
//!
//! Every motion operation computes its final geometric outcome first.
//! With a zero move/turn speed (or no parent pane) the outcome is applied
//! immediately; otherwise the motion is decomposed into weighted segments
//! and driven by a sequence-backed [`Animation`] whose finalizer snaps
//! the exact final position and direction, protecting against sampling
//! drift.
//!
//! # Range policies
//!
//! A step under a non-`Window` policy is split at the boundary of the
//! active rectangle (the explicit range, or the parent pane's bounds):
//! `Fence` stops at the first boundary, `Bounce` mirrors the heading
//! across the crossed edge and keeps going, `Wrap` re-enters from the
//! opposite edge at the same perpendicular coordinate. `Window` never
//! clips.
//!
//! While a motion animates, the in-flight line segment lives in a pane
//! overlay that is rewritten each progress step; completed segments are
//! committed into the pane's raw content by the animation's finalizer.

use std::sync::Arc;
use std::time::Duration;

use kurbo::{Point, Rect, Vec2};
use terrapin_core::animator::{Animator, SequenceAnimator, Weighted};
use terrapin_core::color::Color;
use terrapin_core::geometry::{
    clockwise_delta, heading_to_vec, lerp_point, normalize_degrees,
};
use terrapin_core::timer::TickTimer;

use crate::animation::{self, Animation};
use crate::engine::{Engine, World};
use crate::error::SceneError;
use crate::pane;
use crate::shape::{ClassicShape, ShapeContext, TurtleShape};
use crate::store::{AnimId, PaneId, TurtleId};
use crate::surface::Surface;

/// What happens when a step would leave the active rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// No clipping at all.
    #[default]
    Window,
    /// Stop at the first boundary crossing.
    Fence,
    /// Mirror the heading across the crossed edge and continue.
    Bounce,
    /// Re-enter from the opposite edge and continue.
    Wrap,
}

/// Default move/turn speed: milliseconds of animation per unit of weight.
pub const DEFAULT_MOVE_TURN_SPEED: f64 = 2.0;

const EDGE_EPS: f64 = 1e-9;
const MAX_SPLITS: usize = 64;

pub(crate) struct TurtleState {
    pub(crate) parent: Option<PaneId>,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) direction: f64,
    pub(crate) pen_down: bool,
    pub(crate) pen_width: f64,
    pub(crate) pen_color: Color,
    pub(crate) fill_color: Color,
    pub(crate) visible: bool,
    pub(crate) shape: Arc<dyn TurtleShape>,
    pub(crate) view: usize,
    pub(crate) frame: usize,
    pub(crate) transparency: f64,
    pub(crate) scale: f64,
    pub(crate) range_policy: RangePolicy,
    pub(crate) range: Option<Rect>,
    pub(crate) move_turn_speed: f64,
    pub(crate) active: Option<AnimId>,
    pub(crate) polygon: Option<Vec<Point>>,
    pub(crate) frame_timer: Option<TickTimer>,
    seg_counter: u64,
}

impl TurtleState {
    fn new() -> Self {
        Self {
            parent: None,
            x: 0.0,
            y: 0.0,
            direction: 0.0,
            pen_down: true,
            pen_width: 1.0,
            pen_color: Color::BLACK,
            fill_color: Color::BLACK,
            visible: true,
            shape: Arc::new(ClassicShape::default()),
            view: 0,
            frame: 0,
            transparency: 0.0,
            scale: 1.0,
            range_policy: RangePolicy::Window,
            range: None,
            move_turn_speed: DEFAULT_MOVE_TURN_SPEED,
            active: None,
            polygon: None,
            frame_timer: None,
            seg_counter: 0,
        }
    }
}

/// Handle to a turtle in an engine's world. Cheap to clone.
#[derive(Clone)]
pub struct Turtle {
    pub(crate) id: TurtleId,
    pub(crate) engine: Arc<Engine>,
}

impl std::fmt::Debug for Turtle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Turtle").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Motion planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SegmentPlan {
    Move { from: Point, to: Point },
    Turn { from: f64, delta: f64 },
    Jump { to: Point },
}

impl SegmentPlan {
    fn weight(&self) -> u32 {
        match *self {
            Self::Move { from, to } => (to - from).hypot().round() as u32,
            Self::Turn { delta, .. } => delta.abs().round() as u32,
            Self::Jump { .. } => 0,
        }
    }
}

fn rect_contains(rect: Rect, p: Point) -> bool {
    p.x >= rect.x0 - EDGE_EPS
        && p.x <= rect.x1 + EDGE_EPS
        && p.y >= rect.y0 - EDGE_EPS
        && p.y <= rect.y1 + EDGE_EPS
}

fn clamp_to_rect(rect: Rect, p: Point) -> Point {
    Point::new(p.x.clamp(rect.x0, rect.x1), p.y.clamp(rect.y0, rect.y1))
}

/// Minimum parametric distance to the rectangle boundary along `u`, with
/// flags for which edge kind is crossed (both at a corner).
fn nearest_crossing(
    rect: Rect,
    pos: Point,
    u: Vec2,
    remaining: f64,
) -> Option<(f64, bool, bool)> {
    let vertical = if u.x > 0.0 {
        Some((rect.x1 - pos.x) / u.x)
    } else if u.x < 0.0 {
        Some((rect.x0 - pos.x) / u.x)
    } else {
        None
    };
    let horizontal = if u.y > 0.0 {
        Some((rect.y1 - pos.y) / u.y)
    } else if u.y < 0.0 {
        Some((rect.y0 - pos.y) / u.y)
    } else {
        None
    };
    let in_range = |t: &f64| *t >= -EDGE_EPS && *t <= remaining + EDGE_EPS;
    let v = vertical.filter(in_range);
    let h = horizontal.filter(in_range);
    let best = match (v, h) {
        (None, None) => return None,
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (Some(a), Some(b)) => a.min(b),
    }
    .max(0.0);
    let tol = 1e-6;
    Some((
        best,
        v.is_some_and(|t| (t - best).abs() <= tol),
        h.is_some_and(|t| (t - best).abs() <= tol),
    ))
}

/// Split a step into boundary-respecting segments.
fn plan_step(
    start: Point,
    direction: f64,
    length: f64,
    policy: RangePolicy,
    rect: Option<Rect>,
) -> Vec<SegmentPlan> {
    let unclipped = |start: Point| {
        vec![SegmentPlan::Move {
            from: start,
            to: start + heading_to_vec(direction) * length,
        }]
    };
    let rect = match rect {
        Some(rect) if policy != RangePolicy::Window => rect,
        _ => return unclipped(start),
    };
    if !rect_contains(rect, start) {
        // Starting outside the active rectangle: nothing to clip against.
        return unclipped(start);
    }

    let mut plans = Vec::new();
    let mut pos = start;
    let mut dir = direction;
    let sign = if length < 0.0 { -1.0 } else { 1.0 };
    let mut remaining = length.abs();
    let mut splits = 0;
    while remaining > EDGE_EPS {
        splits += 1;
        let u = heading_to_vec(dir) * sign;
        let target = pos + u * remaining;
        if rect_contains(rect, target) || splits > MAX_SPLITS {
            plans.push(SegmentPlan::Move { from: pos, to: target });
            break;
        }
        let Some((t, crossed_vertical, crossed_horizontal)) =
            nearest_crossing(rect, pos, u, remaining)
        else {
            plans.push(SegmentPlan::Move { from: pos, to: target });
            break;
        };
        let hit = clamp_to_rect(rect, pos + u * t);
        if t > EDGE_EPS {
            plans.push(SegmentPlan::Move { from: pos, to: hit });
        }
        pos = hit;
        remaining -= t;
        match policy {
            RangePolicy::Fence => break,
            RangePolicy::Bounce => {
                let mut mirrored = dir;
                if crossed_vertical {
                    mirrored = normalize_degrees(-mirrored);
                }
                if crossed_horizontal {
                    mirrored = normalize_degrees(180.0 - mirrored);
                }
                if mirrored != dir {
                    let cw = clockwise_delta(dir, mirrored);
                    let delta = if cw <= 180.0 { cw } else { cw - 360.0 };
                    plans.push(SegmentPlan::Turn { from: dir, delta });
                    dir = mirrored;
                }
            }
            RangePolicy::Wrap => {
                let mut next = hit;
                if crossed_vertical {
                    next.x = if (hit.x - rect.x1).abs() <= EDGE_EPS {
                        rect.x0
                    } else {
                        rect.x1
                    };
                }
                if crossed_horizontal {
                    next.y = if (hit.y - rect.y1).abs() <= EDGE_EPS {
                        rect.y0
                    } else {
                        rect.y1
                    };
                }
                plans.push(SegmentPlan::Jump { to: next });
                pos = next;
            }
            RangePolicy::Window => unreachable!("window policy never splits"),
        }
    }
    plans
}

// ---------------------------------------------------------------------------
// Leaf animators
// ---------------------------------------------------------------------------

struct MoveAnimator {
    turtle: TurtleId,
    pane: PaneId,
    from: Point,
    to: Point,
    draw: bool,
    width: f64,
    color: Color,
    overlay: String,
}

impl Animator<World> for MoveAnimator {
    fn animate(&self, w: &mut World, fraction: f64) {
        let p = lerp_point(self.from, self.to, fraction.clamp(0.0, 1.0));
        if let Some(st) = w.turtles.get_mut(self.turtle.0) {
            st.x = p.x;
            st.y = p.y;
        }
        if self.draw {
            let mut live = crate::surface::DisplayList::new();
            live.draw_line(self.from, p, self.width, self.color);
            let _ = pane::set_overlay_in(w, self.pane, &self.overlay, live);
        }
        pane::invalidate_up(w, self.pane);
    }
}

struct TurnAnimator {
    turtle: TurtleId,
    pane: PaneId,
    start: f64,
    delta: f64,
}

impl TurnAnimator {
    fn direction_at(&self, fraction: f64) -> f64 {
        normalize_degrees(self.start + fraction * self.delta)
    }
}

impl Animator<World> for TurnAnimator {
    fn animate(&self, w: &mut World, fraction: f64) {
        let direction = self.direction_at(fraction.clamp(0.0, 1.0));
        if let Some(st) = w.turtles.get_mut(self.turtle.0) {
            st.direction = direction;
        }
        pane::invalidate_up(w, self.pane);
    }
}

struct JumpAnimator {
    turtle: TurtleId,
    pane: PaneId,
    to: Point,
}

impl Animator<World> for JumpAnimator {
    fn animate(&self, w: &mut World, _fraction: f64) {
        if let Some(st) = w.turtles.get_mut(self.turtle.0) {
            st.x = self.to.x;
            st.y = self.to.y;
        }
        pane::invalidate_up(w, self.pane);
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

impl Turtle {
    /// Create an unparented turtle with the classic shape, pen down.
    #[must_use]
    pub fn new(engine: &Arc<Engine>) -> Self {
        let mut w = engine.lock();
        let id = TurtleId(w.turtles.insert(TurtleState::new()));
        Self {
            id,
            engine: Arc::clone(engine),
        }
    }

    /// This turtle's id.
    #[must_use]
    pub fn id(&self) -> TurtleId {
        self.id
    }

    /// Current position in parent-pane coordinates.
    pub fn position(&self) -> Result<Point, SceneError> {
        let w = self.engine.lock();
        let st = w.turtle(self.id)?;
        Ok(Point::new(st.x, st.y))
    }

    /// Current heading in degrees, `[0, 360)`.
    pub fn direction(&self) -> Result<f64, SceneError> {
        let w = self.engine.lock();
        Ok(w.turtle(self.id)?.direction)
    }

    /// Teleport without drawing. Rejected while a motion animates.
    pub fn set_position(&self, x: f64, y: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.turtle_mut(self.id)?;
        if st.active.is_some() {
            return Err(SceneError::MotionActive);
        }
        st.x = x;
        st.y = y;
        let parent = st.parent;
        if let Some(parent) = parent {
            pane::invalidate_up(&mut w, parent);
        }
        Ok(())
    }

    /// Set the heading directly. Rejected while a motion animates.
    pub fn set_direction(&self, degrees: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.turtle_mut(self.id)?;
        if st.active.is_some() {
            return Err(SceneError::MotionActive);
        }
        st.direction = normalize_degrees(degrees);
        let parent = st.parent;
        if let Some(parent) = parent {
            pane::invalidate_up(&mut w, parent);
        }
        Ok(())
    }

    // --- Pen & appearance --------------------------------------------------

    /// Lower the pen: subsequent moves draw.
    pub fn pen_down(&self) -> Result<(), SceneError> {
        self.with_state(|st| st.pen_down = true)
    }

    /// Raise the pen: subsequent moves do not draw.
    pub fn pen_up(&self) -> Result<(), SceneError> {
        self.with_state(|st| st.pen_down = false)
    }

    /// Whether the pen is down.
    pub fn is_pen_down(&self) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        Ok(w.turtle(self.id)?.pen_down)
    }

    /// Set the trail stroke width.
    pub fn set_pen_width(&self, width: f64) -> Result<(), SceneError> {
        self.with_state(|st| st.pen_width = width.max(0.0))
    }

    /// Set the trail color.
    pub fn set_pen_color(&self, color: Color) -> Result<(), SceneError> {
        self.with_state(|st| st.pen_color = color)
    }

    /// The trail color.
    pub fn pen_color(&self) -> Result<Color, SceneError> {
        let w = self.engine.lock();
        Ok(w.turtle(self.id)?.pen_color)
    }

    /// Set the fill color used by `end_fill` and the default shape body.
    pub fn set_fill_color(&self, color: Color) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| st.fill_color = color)
    }

    /// Show the turtle's shape.
    pub fn show(&self) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| st.visible = true)
    }

    /// Hide the turtle's shape (trails still draw).
    pub fn hide(&self) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| st.visible = false)
    }

    /// Whether the shape is painted.
    pub fn is_visible(&self) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        Ok(w.turtle(self.id)?.visible)
    }

    /// Replace the shape.
    pub fn set_shape(&self, shape: Arc<dyn TurtleShape>) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| {
            st.shape = shape;
            st.view = 0;
            st.frame = 0;
        })
    }

    /// Select a view; wraps modulo the shape's view count.
    pub fn set_view(&self, view: usize) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| {
            let count = st.shape.view_count().max(1);
            st.view = view % count;
        })
    }

    /// Select a frame; wraps modulo the shape's frame count.
    pub fn set_frame(&self, frame: usize) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| {
            let count = st.shape.frame_count().max(1);
            st.frame = frame % count;
        })
    }

    /// Transparency in `[0, 1]`; 0 is opaque.
    pub fn set_transparency(&self, transparency: f64) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| st.transparency = transparency.clamp(0.0, 1.0))
    }

    /// Uniform scale factor for the shape.
    pub fn set_scale(&self, scale: f64) -> Result<(), SceneError> {
        self.with_state_invalidating(|st| st.scale = scale.max(0.0))
    }

    /// Drive the shape's animation frames from its own tick timer.
    pub fn animate_frames(&self, enabled: bool) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        if !enabled {
            w.turtle_mut(self.id)?.frame_timer = None;
            return Ok(());
        }
        let (frames, period, running) = {
            let st = w.turtle(self.id)?;
            (
                st.shape.frame_count(),
                st.shape.frame_duration(),
                st.frame_timer.is_some(),
            )
        };
        if frames <= 1 || period.is_zero() || running {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.engine);
        let id = self.id;
        let timer = TickTimer::new(self.engine.scheduler(), move || {
            let Some(engine) = weak.upgrade() else { return };
            let mut w = engine.lock();
            let Ok(st) = w.turtle_mut(id) else { return };
            let count = st.shape.frame_count();
            if count > 1 {
                st.frame = (st.frame + 1) % count;
            }
            let parent = st.parent;
            if let Some(parent) = parent {
                pane::invalidate_up(&mut w, parent);
            }
        });
        timer.set_period(period);
        w.turtle_mut(self.id)?.frame_timer = Some(timer);
        Ok(())
    }

    // --- Fill capture ------------------------------------------------------

    /// Start capturing an open polygon at the current position.
    pub fn begin_fill(&self) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.turtle_mut(self.id)?;
        if st.active.is_some() {
            return Err(SceneError::MotionActive);
        }
        st.polygon = Some(vec![Point::new(st.x, st.y)]);
        Ok(())
    }

    /// Close the captured polygon and fill it into the parent pane.
    pub fn end_fill(&self) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let (points, parent, color) = {
            let st = w.turtle_mut(self.id)?;
            if st.active.is_some() {
                return Err(SceneError::MotionActive);
            }
            (st.polygon.take(), st.parent, st.fill_color)
        };
        if let (Some(points), Some(parent)) = (points, parent)
            && points.len() >= 3
        {
            if let Ok(p) = w.pane_mut(parent) {
                p.content.fill_polygon(&points, color);
            }
            pane::invalidate_up(&mut w, parent);
        }
        Ok(())
    }

    // --- Range policy ------------------------------------------------------

    /// Set what happens at the boundary of the active rectangle.
    pub fn set_range_policy(&self, policy: RangePolicy) -> Result<(), SceneError> {
        self.with_state(|st| st.range_policy = policy)
    }

    /// The current range policy.
    pub fn range_policy(&self) -> Result<RangePolicy, SceneError> {
        let w = self.engine.lock();
        Ok(w.turtle(self.id)?.range_policy)
    }

    /// Set an explicit range rectangle; `None` falls back to the parent
    /// pane's bounds.
    pub fn set_range(&self, range: Option<Rect>) -> Result<(), SceneError> {
        self.with_state(|st| st.range = range)
    }

    /// Milliseconds of animation per unit of motion weight; 0 disables
    /// animation entirely.
    pub fn set_move_turn_speed(&self, speed: f64) -> Result<(), SceneError> {
        self.with_state(|st| st.move_turn_speed = speed.max(0.0))
    }

    /// The current move/turn speed factor.
    pub fn move_turn_speed(&self) -> Result<f64, SceneError> {
        let w = self.engine.lock();
        Ok(w.turtle(self.id)?.move_turn_speed)
    }

    // --- Motion ------------------------------------------------------------

    /// Step forward (negative lengths step backward), honoring the range
    /// policy. Rejected while another motion animates.
    pub fn step(&self, length: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let plans = {
            let st = w.turtle(self.id)?;
            if st.active.is_some() {
                return Err(SceneError::MotionActive);
            }
            let rect = active_rect(&w, st);
            plan_step(
                Point::new(st.x, st.y),
                st.direction,
                length,
                st.range_policy,
                rect,
            )
        };
        start_motion(&self.engine, &mut w, self.id, plans)
    }

    /// Move straight to a point, drawing if the pen is down. The heading
    /// is unchanged and the range policy does not apply.
    pub fn move_to(&self, x: f64, y: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let plans = {
            let st = w.turtle(self.id)?;
            if st.active.is_some() {
                return Err(SceneError::MotionActive);
            }
            vec![SegmentPlan::Move {
                from: Point::new(st.x, st.y),
                to: Point::new(x, y),
            }]
        };
        start_motion(&self.engine, &mut w, self.id, plans)
    }

    /// Turn by an angle: positive clockwise, negative counter-clockwise.
    /// Full revolutions collapse (turning 450° animates 90°).
    pub fn turn(&self, angle: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let plans = {
            let st = w.turtle(self.id)?;
            if st.active.is_some() {
                return Err(SceneError::MotionActive);
            }
            let delta = if angle >= 0.0 {
                normalize_degrees(angle)
            } else {
                -normalize_degrees(-angle)
            };
            vec![SegmentPlan::Turn {
                from: st.direction,
                delta,
            }]
        };
        start_motion(&self.engine, &mut w, self.id, plans)
    }

    /// Turn counter-clockwise by an angle.
    pub fn turn_left(&self, angle: f64) -> Result<(), SceneError> {
        self.turn(-angle)
    }

    /// Turn to an absolute heading along the shorter arc.
    pub fn turn_to(&self, target: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let plans = {
            let st = w.turtle(self.id)?;
            if st.active.is_some() {
                return Err(SceneError::MotionActive);
            }
            let cw = clockwise_delta(st.direction, normalize_degrees(target));
            let delta = if cw <= 180.0 { cw } else { cw - 360.0 };
            vec![SegmentPlan::Turn {
                from: st.direction,
                delta,
            }]
        };
        start_motion(&self.engine, &mut w, self.id, plans)
    }

    /// Handle to the animation currently driving this turtle, if any.
    #[must_use]
    pub fn active_animation(&self) -> Option<Animation> {
        let w = self.engine.lock();
        let id = w.turtles.get(self.id.0)?.active?;
        animation::handle_for(&self.engine, &w, id)
    }

    /// Step and block until the motion finishes.
    pub fn step_and_wait(&self, length: f64) -> Result<(), SceneError> {
        self.step(length)?;
        self.wait_for_motion()
    }

    /// Turn and block until the motion finishes.
    pub fn turn_and_wait(&self, angle: f64) -> Result<(), SceneError> {
        self.turn(angle)?;
        self.wait_for_motion()
    }

    /// Block until the active motion (if any) finishes.
    pub fn wait_for_motion(&self) -> Result<(), SceneError> {
        match self.active_animation() {
            Some(animation) => animation.wait_for_completion(),
            None => Ok(()),
        }
    }

    /// Whether a point (in parent-pane coordinates) hits the shape.
    pub fn hit_test(&self, point: Point) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        let st = w.turtle(self.id)?;
        Ok(st.shape.hit_test(&shape_context(st), point))
    }

    fn with_state(&self, f: impl FnOnce(&mut TurtleState)) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        f(w.turtle_mut(self.id)?);
        Ok(())
    }

    fn with_state_invalidating(
        &self,
        f: impl FnOnce(&mut TurtleState),
    ) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.turtle_mut(self.id)?;
        let parent = st.parent;
        f(st);
        if let Some(parent) = parent {
            pane::invalidate_up(&mut w, parent);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// World-side helpers
// ---------------------------------------------------------------------------

fn active_rect(w: &World, st: &TurtleState) -> Option<Rect> {
    if let Some(rect) = st.range {
        return Some(rect);
    }
    let parent = st.parent?;
    let pane = w.panes.get(parent.0)?;
    Some(Rect::new(0.0, 0.0, pane.width, pane.height))
}

fn shape_context(st: &TurtleState) -> ShapeContext {
    ShapeContext {
        position: Point::new(st.x, st.y),
        direction: st.direction,
        scale: st.scale,
        opacity: 1.0 - st.transparency,
        view: st.view,
        frame: st.frame,
        pen_color: st.pen_color,
        fill_color: st.fill_color,
    }
}

/// Paint a turtle into its parent pane's cache.
pub(crate) fn paint(w: &World, id: TurtleId, surface: &mut dyn Surface) {
    let Some(st) = w.turtles.get(id.0) else { return };
    if !st.visible {
        return;
    }
    st.shape.paint(&shape_context(st), surface);
}

/// Apply motion plans immediately: positions and directions mutate in
/// place and pen-down segments land straight in the pane content.
fn apply_instant(w: &mut World, id: TurtleId, plans: &[SegmentPlan]) {
    let (parent, lines) = {
        let Some(st) = w.turtles.get_mut(id.0) else {
            return;
        };
        let mut lines = Vec::new();
        for plan in plans {
            match *plan {
                SegmentPlan::Move { from, to } => {
                    st.x = to.x;
                    st.y = to.y;
                    if st.pen_down {
                        lines.push((from, to, st.pen_width, st.pen_color));
                    }
                    if let Some(polygon) = st.polygon.as_mut() {
                        polygon.push(to);
                    }
                }
                SegmentPlan::Turn { from, delta } => {
                    st.direction = normalize_degrees(from + delta);
                }
                SegmentPlan::Jump { to } => {
                    st.x = to.x;
                    st.y = to.y;
                }
            }
        }
        (st.parent, lines)
    };
    if let Some(parent) = parent {
        if !lines.is_empty()
            && let Ok(pane) = w.pane_mut(parent)
        {
            for (from, to, width, color) in lines {
                pane.content.draw_line(from, to, width, color);
            }
        }
        pane::invalidate_up(w, parent);
    }
}

/// Run motion plans: immediately at speed 0 (or unparented, or
/// weightless), otherwise through a sequence-backed animation.
fn start_motion(
    engine: &Arc<Engine>,
    w: &mut World,
    id: TurtleId,
    plans: Vec<SegmentPlan>,
) -> Result<(), SceneError> {
    if plans.is_empty() {
        return Ok(());
    }
    let total: u64 = plans.iter().map(|p| u64::from(p.weight())).sum();
    let (speed, parent, pen_down, pen_width, pen_color, base_seg) = {
        let st = w.turtle_mut(id)?;
        let base = st.seg_counter;
        st.seg_counter += plans.len() as u64;
        (
            st.move_turn_speed,
            st.parent,
            st.pen_down,
            st.pen_width,
            st.pen_color,
            base,
        )
    };
    let Some(pane) = parent else {
        apply_instant(w, id, &plans);
        return Ok(());
    };
    if speed <= 0.0 || total == 0 {
        apply_instant(w, id, &plans);
        return Ok(());
    }

    // Fold the exact final outcome for the epilogue.
    let (start_pos, start_dir) = {
        let st = w.turtle(id)?;
        (Point::new(st.x, st.y), st.direction)
    };
    let mut final_pos = start_pos;
    let mut final_dir = start_dir;
    let mut segments: Vec<Weighted<World>> = Vec::new();
    let mut committed_lines = Vec::new();
    let mut overlay_names = Vec::new();
    let mut polygon_points = Vec::new();
    for (k, plan) in plans.iter().enumerate() {
        match *plan {
            SegmentPlan::Move { from, to } => {
                final_pos = to;
                polygon_points.push(to);
                let overlay = format!("__motion/{:?}/{}", id, base_seg + k as u64);
                if pen_down {
                    committed_lines.push((from, to));
                }
                overlay_names.push(overlay.clone());
                segments.push(Weighted::new(
                    MoveAnimator {
                        turtle: id,
                        pane,
                        from,
                        to,
                        draw: pen_down,
                        width: pen_width,
                        color: pen_color,
                        overlay,
                    },
                    plan.weight(),
                ));
            }
            SegmentPlan::Turn { from, delta } => {
                final_dir = normalize_degrees(from + delta);
                segments.push(Weighted::new(
                    TurnAnimator {
                        turtle: id,
                        pane,
                        start: from,
                        delta,
                    },
                    plan.weight(),
                ));
            }
            SegmentPlan::Jump { to } => {
                final_pos = to;
                segments.push(Weighted::new(
                    JumpAnimator {
                        turtle: id,
                        pane,
                        to,
                    },
                    0,
                ));
            }
        }
    }

    let duration = Duration::from_millis((total as f64 * speed).round() as u64);
    let epilogue = Box::new(move |w: &mut World| {
        if let Some(st) = w.turtles.get_mut(id.0) {
            st.x = final_pos.x;
            st.y = final_pos.y;
            st.direction = final_dir;
            st.active = None;
            if let Some(polygon) = st.polygon.as_mut() {
                polygon.extend(polygon_points.iter().copied());
            }
        }
        for name in &overlay_names {
            pane::remove_overlay_in(w, pane, name);
        }
        if !committed_lines.is_empty()
            && let Ok(p) = w.pane_mut(pane)
        {
            for &(from, to) in &committed_lines {
                p.content.draw_line(from, to, pen_width, pen_color);
            }
        }
        pane::invalidate_up(w, pane);
    });

    let animation = animation::create(
        engine,
        w,
        duration,
        Arc::new(SequenceAnimator::new(segments)),
        epilogue,
    );
    w.turtle_mut(id)?.active = Some(animation.id);
    if let Err(err) = animation::start_in_world(engine, w, animation.id) {
        if let Ok(st) = w.turtle_mut(id) {
            st.active = None;
        }
        return Err(err);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::Pane;
    use crate::surface::{DisplayList, DrawOp};
    use terrapin_core::sched::Scheduler;

    fn engine() -> Arc<Engine> {
        Engine::with_scheduler(Scheduler::new())
    }

    /// Pane + turtle at (50, 50) facing up, instant motion.
    fn rig(engine: &Arc<Engine>) -> (Pane, Turtle) {
        let pane = Pane::new(engine, 100.0, 100.0);
        let turtle = Turtle::new(engine);
        pane.add_turtle(&turtle).unwrap();
        turtle.set_move_turn_speed(0.0).unwrap();
        turtle.set_position(50.0, 50.0).unwrap();
        (pane, turtle)
    }

    fn line_ops(pane: &Pane) -> Vec<(Point, Point)> {
        let mut out = DisplayList::new();
        pane.render(&mut out).unwrap();
        out.ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::Line { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn zero_speed_step_is_synchronous() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.step(10.0).unwrap();
        assert!(turtle.active_animation().is_none());
        assert_eq!(turtle.position().unwrap(), Point::new(50.0, 40.0));
        engine.scheduler().shutdown();
    }

    #[test]
    fn window_policy_never_clips() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.step(60.0).unwrap();
        let p = turtle.position().unwrap();
        assert!((p.x - 50.0).abs() < 1e-9);
        assert!((p.y + 10.0).abs() < 1e-9);
        engine.scheduler().shutdown();
    }

    #[test]
    fn fence_stops_exactly_at_the_boundary() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_range_policy(RangePolicy::Fence).unwrap();
        turtle
            .set_range(Some(Rect::new(0.0, 0.0, 100.0, 100.0)))
            .unwrap();
        turtle.step(60.0).unwrap();
        let p = turtle.position().unwrap();
        assert!((p.x - 50.0).abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);
        assert_eq!(turtle.direction().unwrap(), 0.0);
        engine.scheduler().shutdown();
    }

    #[test]
    fn bounce_mirrors_off_the_right_edge() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_range_policy(RangePolicy::Bounce).unwrap();
        turtle.set_position(80.0, 50.0).unwrap();
        turtle.set_direction(90.0).unwrap(); // due right
        turtle.step(30.0).unwrap();
        // 20 to the edge, 10 mirrored back.
        let p = turtle.position().unwrap();
        assert!((p.x - 90.0).abs() < 1e-6);
        assert!((p.y - 50.0).abs() < 1e-6);
        assert!((turtle.direction().unwrap() - 270.0).abs() < 1e-6);
        engine.scheduler().shutdown();
    }

    #[test]
    fn bounce_at_the_edge_reflects_immediately() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_range_policy(RangePolicy::Bounce).unwrap();
        turtle.set_position(100.0, 50.0).unwrap();
        turtle.set_direction(90.0).unwrap();
        turtle.step(30.0).unwrap();
        let p = turtle.position().unwrap();
        assert!((p.x - 70.0).abs() < 1e-6);
        assert!((turtle.direction().unwrap() - 270.0).abs() < 1e-6);
        engine.scheduler().shutdown();
    }

    #[test]
    fn bounce_mirrors_off_a_horizontal_edge() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_range_policy(RangePolicy::Bounce).unwrap();
        turtle.set_position(50.0, 10.0).unwrap();
        turtle.set_direction(45.0).unwrap(); // up-right
        turtle.step_and_wait(30.0).unwrap();
        // Crosses the top edge and comes back down-right: 180 - 45 = 135.
        assert!((turtle.direction().unwrap() - 135.0).abs() < 1e-6);
        assert!(turtle.position().unwrap().y > 0.0);
        engine.scheduler().shutdown();
    }

    #[test]
    fn wrap_reenters_from_the_opposite_edge() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_range_policy(RangePolicy::Wrap).unwrap();
        turtle.set_position(90.0, 50.0).unwrap();
        turtle.set_direction(90.0).unwrap();
        turtle.step(20.0).unwrap();
        let p = turtle.position().unwrap();
        assert!((p.x - 10.0).abs() < 1e-6);
        assert!((p.y - 50.0).abs() < 1e-6);
        // Direction unchanged.
        assert!((turtle.direction().unwrap() - 90.0).abs() < 1e-6);
        engine.scheduler().shutdown();
    }

    #[test]
    fn pen_down_step_commits_a_trail_line() {
        let engine = engine();
        let (pane, turtle) = rig(&engine);
        turtle.step(20.0).unwrap();
        let lines = line_ops(&pane);
        assert!(lines.contains(&(Point::new(50.0, 50.0), Point::new(50.0, 30.0))));
        engine.scheduler().shutdown();
    }

    #[test]
    fn pen_up_step_draws_nothing() {
        let engine = engine();
        let (pane, turtle) = rig(&engine);
        turtle.pen_up().unwrap();
        turtle.step(20.0).unwrap();
        assert!(line_ops(&pane)
            .iter()
            .all(|(from, _)| *from != Point::new(50.0, 50.0)));
        engine.scheduler().shutdown();
    }

    #[test]
    fn move_to_keeps_heading_and_draws() {
        let engine = engine();
        let (pane, turtle) = rig(&engine);
        turtle.move_to(80.0, 90.0).unwrap();
        assert_eq!(turtle.position().unwrap(), Point::new(80.0, 90.0));
        assert_eq!(turtle.direction().unwrap(), 0.0);
        assert!(line_ops(&pane).contains(&(Point::new(50.0, 50.0), Point::new(80.0, 90.0))));
        engine.scheduler().shutdown();
    }

    #[test]
    fn turn_collapses_full_revolutions() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.turn(450.0).unwrap();
        assert!((turtle.direction().unwrap() - 90.0).abs() < 1e-9);
        turtle.turn_left(90.0).unwrap();
        assert!(turtle.direction().unwrap().abs() < 1e-9);
        engine.scheduler().shutdown();
    }

    #[test]
    fn turn_to_takes_the_shorter_arc() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.turn_to(350.0).unwrap();
        assert!((turtle.direction().unwrap() - 350.0).abs() < 1e-9);
        turtle.turn_to(10.0).unwrap();
        assert!((turtle.direction().unwrap() - 10.0).abs() < 1e-9);
        engine.scheduler().shutdown();
    }

    #[test]
    fn animated_step_rejects_concurrent_mutation() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_move_turn_speed(2.0).unwrap();
        turtle.step(60.0).unwrap();
        assert!(turtle.active_animation().is_some());
        assert_eq!(turtle.set_direction(90.0), Err(SceneError::MotionActive));
        assert_eq!(turtle.step(5.0), Err(SceneError::MotionActive));
        turtle.wait_for_motion().unwrap();
        // The finalizer cleared the slot; mutation is allowed again.
        assert!(turtle.active_animation().is_none());
        turtle.set_direction(90.0).unwrap();
        engine.scheduler().shutdown();
    }

    #[test]
    fn animated_step_lands_exactly_on_the_target() {
        let engine = engine();
        let (pane, turtle) = rig(&engine);
        turtle.set_move_turn_speed(1.0).unwrap();
        turtle.step_and_wait(60.0).unwrap();
        assert_eq!(turtle.position().unwrap(), Point::new(50.0, -10.0));
        // The trail was committed into the pane content on completion.
        assert!(line_ops(&pane).contains(&(Point::new(50.0, 50.0), Point::new(50.0, -10.0))));
        engine.scheduler().shutdown();
    }

    #[test]
    fn animated_bounce_ends_with_mirrored_direction() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.set_range_policy(RangePolicy::Bounce).unwrap();
        turtle.set_move_turn_speed(0.2).unwrap();
        turtle.set_position(80.0, 50.0).unwrap();
        turtle.set_direction(90.0).unwrap();
        turtle.step_and_wait(30.0).unwrap();
        let p = turtle.position().unwrap();
        assert!((p.x - 90.0).abs() < 1e-6);
        assert!((turtle.direction().unwrap() - 270.0).abs() < 1e-6);
        engine.scheduler().shutdown();
    }

    #[test]
    fn fill_capture_produces_a_polygon() {
        let engine = engine();
        let (pane, turtle) = rig(&engine);
        turtle.set_fill_color(Color::GREEN).unwrap();
        turtle.begin_fill().unwrap();
        turtle.step(10.0).unwrap();
        turtle.turn(90.0).unwrap();
        turtle.step(10.0).unwrap();
        turtle.end_fill().unwrap();

        let mut out = DisplayList::new();
        pane.render(&mut out).unwrap();
        let polygon = out.ops().iter().find_map(|op| match op {
            DrawOp::Polygon { points, color } if *color == Color::GREEN => Some(points.clone()),
            _ => None,
        });
        let points = polygon.expect("fill polygon missing");
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], Point::new(50.0, 50.0));
        engine.scheduler().shutdown();
    }

    #[test]
    fn unparented_turtle_moves_without_drawing() {
        let engine = engine();
        let turtle = Turtle::new(&engine);
        turtle.set_move_turn_speed(5.0).unwrap();
        turtle.step(10.0).unwrap();
        // No parent pane: applied immediately despite the nonzero speed.
        assert!(turtle.active_animation().is_none());
        assert_eq!(turtle.position().unwrap(), Point::new(0.0, -10.0));
        engine.scheduler().shutdown();
    }

    #[test]
    fn hit_test_uses_the_shape() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        assert!(turtle.hit_test(Point::new(50.0, 50.0)).unwrap());
        assert!(!turtle.hit_test(Point::new(0.0, 0.0)).unwrap());
        engine.scheduler().shutdown();
    }

    #[test]
    fn negative_step_moves_backward() {
        let engine = engine();
        let (_pane, turtle) = rig(&engine);
        turtle.step(-20.0).unwrap();
        assert_eq!(turtle.position().unwrap(), Point::new(50.0, 70.0));
        engine.scheduler().shutdown();
    }

    proptest::proptest! {
        #[test]
        fn proptest_bounce_and_wrap_never_escape_the_rect(
            x in 0.0f64..100.0,
            y in 0.0f64..100.0,
            direction in 0.0f64..360.0,
            length in 0.0f64..250.0,
            wrap in proptest::bool::ANY,
        ) {
            let rect = Rect::new(0.0, 0.0, 100.0, 100.0);
            let policy = if wrap { RangePolicy::Wrap } else { RangePolicy::Bounce };
            let plans = plan_step(Point::new(x, y), direction, length, policy, Some(rect));
            let mut pos = Point::new(x, y);
            for plan in &plans {
                match *plan {
                    SegmentPlan::Move { to, .. } | SegmentPlan::Jump { to } => pos = to,
                    SegmentPlan::Turn { .. } => {}
                }
            }
            proptest::prop_assert!(pos.x >= -1e-6 && pos.x <= 100.0 + 1e-6);
            proptest::prop_assert!(pos.y >= -1e-6 && pos.y <= 100.0 + 1e-6);
        }
    }
}
