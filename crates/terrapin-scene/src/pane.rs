#![forbid(unsafe_code)]

//! Panes: rectangular, z-ordered drawing surfaces arranged in a tree.
//!
//! A pane owns its children's membership (re-parenting detaches first),
//! a dirty flag, and a cached rendered [`DisplayList`]. Mutations mark
//! the pane dirty and propagate invalidation to the root; `repaint`
//! recomposes caches lazily and is a no-op when clean.
//!
//! # Mouse broadcast rules
//!
//! Events travel parent→child, front-to-back among children, in local
//! coordinates. A pane receives an event when it is *wanting* — a release
//! for a button it holds from a press, or a drag while any button is held
//! — regardless of pointer containment, or when the pointer is inside it
//! and no higher pane with a painted background has consumed the event.
//! Consumption stops broadcast to panes further back; it never stops
//! delivery to wanting panes. A press for an already-held button or a
//! release for a button not held is an invalid duplicate and is dropped.
//!
//! # Key broadcast rules
//!
//! Key events first pass through the entry pane's key repeater, then are
//! delivered to every pane in the subtree unconditionally.

use std::sync::Arc;
use std::time::Duration;

use kurbo::{Affine, Point, Rect};
use terrapin_core::color::Color;
use terrapin_core::event::{
    KeyCode, KeyEvent, MouseButton, MouseButtons, MouseEvent, MouseEventKind,
};
use terrapin_core::geometry::normalize_degrees;
use terrapin_core::timer::TickTimer;

use crate::engine::{Engine, World};
use crate::error::SceneError;
use crate::keyrepeat::KeyRepeaterState;
use crate::store::{PaneId, TurtleId};
use crate::surface::{DisplayList, Surface};
use crate::turtle::{self, Turtle};

/// Notified (outside the lock) whenever a pane is invalidated; the
/// windowing layer uses this to schedule a platform repaint.
pub trait PaneListener: Send + Sync {
    /// Called after `pane` was marked dirty.
    fn pane_invalidated(&self, pane: PaneId);
}

/// A child of a pane: another pane or a turtle, in one z-ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneNode {
    /// A nested pane.
    Pane(PaneId),
    /// A turtle actor.
    Turtle(TurtleId),
}

impl From<&Pane> for SceneNode {
    fn from(pane: &Pane) -> Self {
        Self::Pane(pane.id)
    }
}

impl From<&Turtle> for SceneNode {
    fn from(turtle: &Turtle) -> Self {
        Self::Turtle(turtle.id)
    }
}

type MouseHook = Arc<dyn Fn(&MouseEvent) + Send + Sync>;
type KeyHook = Arc<dyn Fn(&KeyEvent) + Send + Sync>;
type TickHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct PaneState {
    pub(crate) parent: Option<PaneId>,
    /// Z-ordered children; the front-most is last.
    pub(crate) children: Vec<SceneNode>,
    /// Derived projection of `children`, same relative order.
    pub(crate) pane_children: Vec<PaneId>,
    /// Derived projection of `children`, same relative order.
    pub(crate) turtle_children: Vec<TurtleId>,
    pub(crate) width: f64,
    pub(crate) height: f64,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) x_center: f64,
    pub(crate) y_center: f64,
    pub(crate) rotation: f64,
    pub(crate) border_width: f64,
    pub(crate) border_color: Color,
    pub(crate) background: Color,
    pub(crate) draw_background: bool,
    pub(crate) transparency: f64,
    pub(crate) overlays: Vec<(String, DisplayList)>,
    pub(crate) dirty: bool,
    pub(crate) cache: DisplayList,
    pub(crate) content: DisplayList,
    pub(crate) to_parent: Affine,
    pub(crate) to_local: Affine,
    pub(crate) held: MouseButtons,
    pub(crate) last_mouse: Option<MouseEvent>,
    pub(crate) listeners: Vec<Arc<dyn PaneListener>>,
    pub(crate) on_mouse: Option<MouseHook>,
    pub(crate) on_key: Option<KeyHook>,
    pub(crate) on_tick: Option<TickHook>,
    pub(crate) tick_timer: Option<TickTimer>,
    pub(crate) repeat: KeyRepeaterState,
}

impl PaneState {
    fn new(width: f64, height: f64) -> Self {
        let mut state = Self {
            parent: None,
            children: Vec::new(),
            pane_children: Vec::new(),
            turtle_children: Vec::new(),
            width: width.max(1.0),
            height: height.max(1.0),
            x: 0.0,
            y: 0.0,
            x_center: 0.0,
            y_center: 0.0,
            rotation: 0.0,
            border_width: 0.0,
            border_color: Color::BLACK,
            background: Color::WHITE,
            draw_background: true,
            transparency: 0.0,
            overlays: Vec::new(),
            dirty: true,
            cache: DisplayList::new(),
            content: DisplayList::new(),
            to_parent: Affine::IDENTITY,
            to_local: Affine::IDENTITY,
            held: MouseButtons::empty(),
            last_mouse: None,
            listeners: Vec::new(),
            on_mouse: None,
            on_key: None,
            on_tick: None,
            tick_timer: None,
            repeat: KeyRepeaterState::default(),
        };
        state.recompute_transforms();
        state
    }

    fn recompute_transforms(&mut self) {
        if self.rotation == 0.0 {
            // Pure translation, rounded to whole units.
            let tx = (self.x - self.x_center).round();
            let ty = (self.y - self.y_center).round();
            self.to_parent = Affine::translate((tx, ty));
            self.to_local = Affine::translate((-tx, -ty));
        } else {
            let transform = Affine::translate((self.x, self.y))
                * Affine::rotate(self.rotation.to_radians())
                * Affine::translate((-self.x_center, -self.y_center));
            self.to_parent = transform;
            self.to_local = transform.inverse();
        }
    }

    fn contains_local(&self, p: Point) -> bool {
        p.x >= 0.0 && p.x <= self.width && p.y >= 0.0 && p.y <= self.height
    }

    fn wants(&self, event: &MouseEvent) -> bool {
        match event.kind {
            MouseEventKind::Release(button) => self.held.contains(button.into()),
            // Any held button makes the pane track drags, not just the
            // button that started one here; preserved from the original
            // behavior.
            MouseEventKind::Drag(_) => !self.held.is_empty(),
            _ => false,
        }
    }

    /// A pane that paints no background does not block mouse events from
    /// panes behind it.
    fn blocks_mouse(&self) -> bool {
        self.draw_background
    }
}

/// Handle to a pane in an engine's world. Cheap to clone.
#[derive(Clone)]
pub struct Pane {
    pub(crate) id: PaneId,
    pub(crate) engine: Arc<Engine>,
}

impl std::fmt::Debug for Pane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pane").field("id", &self.id).finish()
    }
}

impl Pane {
    /// Create an unparented pane. Dimensions are clamped to at least 1.
    #[must_use]
    pub fn new(engine: &Arc<Engine>, width: f64, height: f64) -> Self {
        let mut w = engine.lock();
        let id = PaneId(w.panes.insert(PaneState::new(width, height)));
        Self {
            id,
            engine: Arc::clone(engine),
        }
    }

    /// This pane's id.
    #[must_use]
    pub fn id(&self) -> PaneId {
        self.id
    }

    // --- Geometry ----------------------------------------------------------

    /// Width and height.
    pub fn size(&self) -> Result<(f64, f64), SceneError> {
        let w = self.engine.lock();
        let st = w.pane(self.id)?;
        Ok((st.width, st.height))
    }

    /// Resize. Dimensions are clamped to at least 1.
    pub fn set_size(&self, width: f64, height: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        st.width = width.max(1.0);
        st.height = height.max(1.0);
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Position of the anchor in parent coordinates.
    pub fn position(&self) -> Result<Point, SceneError> {
        let w = self.engine.lock();
        let st = w.pane(self.id)?;
        Ok(Point::new(st.x, st.y))
    }

    /// Move the anchor.
    pub fn set_position(&self, x: f64, y: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        st.x = x;
        st.y = y;
        st.recompute_transforms();
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// The anchor point within the pane (also the rotation pivot).
    pub fn center(&self) -> Result<Point, SceneError> {
        let w = self.engine.lock();
        let st = w.pane(self.id)?;
        Ok(Point::new(st.x_center, st.y_center))
    }

    /// Move the anchor point within the pane.
    pub fn set_center(&self, x: f64, y: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        st.x_center = x;
        st.y_center = y;
        st.recompute_transforms();
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Rotation in degrees, normalized into `[0, 360)`.
    pub fn rotation(&self) -> Result<f64, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.rotation)
    }

    /// Rotate about the center point.
    pub fn set_rotation(&self, degrees: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        st.rotation = normalize_degrees(degrees);
        st.recompute_transforms();
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Map a point from parent coordinates into this pane.
    pub fn to_local(&self, p: Point) -> Result<Point, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.to_local * p)
    }

    /// Map a point from this pane into parent coordinates.
    pub fn to_parent(&self, p: Point) -> Result<Point, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.to_parent * p)
    }

    /// Whether a point in local coordinates lies inside the pane.
    pub fn contains(&self, p: Point) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.contains_local(p))
    }

    // --- Appearance --------------------------------------------------------

    /// Set border width and color; width 0 disables the border.
    pub fn set_border(&self, width: f64, color: Color) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        st.border_width = width.max(0.0);
        st.border_color = color;
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Background fill color.
    pub fn background(&self) -> Result<Color, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.background)
    }

    /// Set the background fill color.
    pub fn set_background(&self, color: Color) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.background = color;
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Enable or disable background painting. A pane without a painted
    /// background is transparent to the mouse as well.
    pub fn set_background_enabled(&self, enabled: bool) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.draw_background = enabled;
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Whether the background is painted.
    pub fn is_background_enabled(&self) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.draw_background)
    }

    /// Transparency in `[0, 1]`; 0 is opaque.
    pub fn set_transparency(&self, transparency: f64) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.transparency = transparency.clamp(0.0, 1.0);
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    // --- Tree & z-order ----------------------------------------------------

    /// Parent pane, if attached.
    pub fn parent(&self) -> Result<Option<Pane>, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.parent.map(|id| Pane {
            id,
            engine: Arc::clone(&self.engine),
        }))
    }

    /// Add a pane as the front-most child. A pane already attached
    /// elsewhere is detached from its old parent first.
    pub fn add_pane(&self, child: &Pane) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        if child.id == self.id || is_ancestor(&w, child.id, self.id)? {
            return Err(SceneError::WouldCycle);
        }
        if let Some(old) = w.pane(child.id)?.parent {
            detach_from_parent(&mut w, old, SceneNode::Pane(child.id));
        }
        w.pane_mut(self.id)?.children.push(SceneNode::Pane(child.id));
        w.pane_mut(child.id)?.parent = Some(self.id);
        rebuild_sublists(&mut w, self.id);
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Add a turtle as the front-most child, re-parenting if needed.
    pub fn add_turtle(&self, child: &Turtle) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        if let Some(old) = w.turtle(child.id)?.parent {
            detach_from_parent(&mut w, old, SceneNode::Turtle(child.id));
        }
        w.pane_mut(self.id)?
            .children
            .push(SceneNode::Turtle(child.id));
        w.turtle_mut(child.id)?.parent = Some(self.id);
        rebuild_sublists(&mut w, self.id);
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Remove a direct child. Errors when the node is not a child of
    /// this pane. A removed pane synthesizes release events for every
    /// mouse button it still believes is held.
    pub fn remove(&self, node: impl Into<SceneNode>) -> Result<(), SceneError> {
        let node = node.into();
        let mut w = self.engine.lock();
        if !w.pane(self.id)?.children.contains(&node) {
            return Err(SceneError::NotAChild);
        }
        detach_from_parent(&mut w, self.id, node);
        match node {
            SceneNode::Pane(id) => w.pane_mut(id)?.parent = None,
            SceneNode::Turtle(id) => w.turtle_mut(id)?.parent = None,
        }
        Ok(())
    }

    /// Detach this pane from its parent, if any.
    pub fn detach(&self) -> Result<(), SceneError> {
        let parent = {
            let w = self.engine.lock();
            w.pane(self.id)?.parent
        };
        match parent {
            Some(parent) => Pane {
                id: parent,
                engine: Arc::clone(&self.engine),
            }
            .remove(SceneNode::Pane(self.id)),
            None => Ok(()),
        }
    }

    /// The z-ordered child list (front-most last).
    pub fn children(&self) -> Result<Vec<SceneNode>, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.children.clone())
    }

    /// The pane children, in the same relative order as `children`.
    pub fn pane_children(&self) -> Result<Vec<Pane>, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?
            .pane_children
            .iter()
            .map(|&id| Pane {
                id,
                engine: Arc::clone(&self.engine),
            })
            .collect())
    }

    /// The turtle children, in the same relative order as `children`.
    pub fn turtle_children(&self) -> Result<Vec<Turtle>, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?
            .turtle_children
            .iter()
            .map(|&id| Turtle {
                id,
                engine: Arc::clone(&self.engine),
            })
            .collect())
    }

    /// Move a child to the front (drawn last, on top).
    pub fn bring_to_front(&self, node: impl Into<SceneNode>) -> Result<(), SceneError> {
        self.reorder(node.into(), None, true)
    }

    /// Move a child to the back (drawn first).
    pub fn bring_to_back(&self, node: impl Into<SceneNode>) -> Result<(), SceneError> {
        self.reorder(node.into(), None, false)
    }

    /// Place a child immediately in front of a reference child.
    pub fn bring_to_front_of(
        &self,
        node: impl Into<SceneNode>,
        reference: impl Into<SceneNode>,
    ) -> Result<(), SceneError> {
        self.reorder(node.into(), Some(reference.into()), true)
    }

    /// Place a child immediately behind a reference child.
    pub fn bring_to_back_of(
        &self,
        node: impl Into<SceneNode>,
        reference: impl Into<SceneNode>,
    ) -> Result<(), SceneError> {
        self.reorder(node.into(), Some(reference.into()), false)
    }

    fn reorder(
        &self,
        node: SceneNode,
        reference: Option<SceneNode>,
        front: bool,
    ) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        let index = st
            .children
            .iter()
            .position(|&c| c == node)
            .ok_or(SceneError::NotAChild)?;
        if let Some(reference) = reference {
            if reference == node {
                return Ok(());
            }
            if !st.children.contains(&reference) {
                return Err(SceneError::NotAChild);
            }
        }
        st.children.remove(index);
        let at = match reference {
            None => {
                if front {
                    st.children.len()
                } else {
                    0
                }
            }
            Some(reference) => {
                let ref_index = st
                    .children
                    .iter()
                    .position(|&c| c == reference)
                    .ok_or(SceneError::NotAChild)?;
                if front { ref_index + 1 } else { ref_index }
            }
        };
        st.children.insert(at, node);
        rebuild_sublists(&mut w, self.id);
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    // --- Content, overlays, repaint ----------------------------------------

    /// Record drawing operations into the pane's raw content.
    pub fn draw<F>(&self, f: F) -> Result<(), SceneError>
    where
        F: FnOnce(&mut dyn Surface),
    {
        let mut w = self.engine.lock();
        f(&mut w.pane_mut(self.id)?.content);
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Clear the pane's raw content (turtle trails and `draw` output).
    pub fn clear(&self) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.content.clear();
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Install or replace a named overlay, painted above the raw content
    /// in insertion order.
    pub fn set_overlay(&self, name: &str, overlay: DisplayList) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        set_overlay_in(&mut w, self.id, name, overlay)?;
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Remove a named overlay. Returns whether it existed.
    pub fn remove_overlay(&self, name: &str) -> Result<bool, SceneError> {
        let mut w = self.engine.lock();
        let st = w.pane_mut(self.id)?;
        let before = st.overlays.len();
        st.overlays.retain(|(n, _)| n != name);
        let removed = st.overlays.len() != before;
        if removed {
            invalidate_up(&mut w, self.id);
        }
        Ok(removed)
    }

    /// Whether the pane needs repainting.
    pub fn is_dirty(&self) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.dirty)
    }

    /// Mark this pane (and every ancestor) as needing a repaint.
    pub fn invalidate(&self) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane(self.id)?;
        invalidate_up(&mut w, self.id);
        Ok(())
    }

    /// Recompose this pane's cached output if dirty; no-op when clean.
    pub fn repaint(&self) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane(self.id)?;
        ensure_repaint(&mut w, self.id);
        Ok(())
    }

    /// Repaint if needed, then replay the cached output onto a surface.
    pub fn render(&self, surface: &mut dyn Surface) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane(self.id)?;
        ensure_repaint(&mut w, self.id);
        let st = w.pane(self.id)?;
        st.cache
            .replay(surface, Affine::IDENTITY, 1.0 - st.transparency);
        Ok(())
    }

    // --- Listeners & hooks -------------------------------------------------

    /// Register an invalidation listener.
    pub fn add_listener(&self, listener: Arc<dyn PaneListener>) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.listeners.push(listener);
        Ok(())
    }

    /// Install the mouse hook, called after routing decides this pane
    /// receives an event.
    pub fn set_on_mouse(
        &self,
        hook: impl Fn(&MouseEvent) + Send + Sync + 'static,
    ) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.on_mouse = Some(Arc::new(hook));
        Ok(())
    }

    /// Install the key hook, called for every key event broadcast through
    /// this pane's subtree.
    pub fn set_on_key(
        &self,
        hook: impl Fn(&KeyEvent) + Send + Sync + 'static,
    ) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.on_key = Some(Arc::new(hook));
        Ok(())
    }

    /// Install the periodic tick hook; drive it with
    /// [`set_tick_period`](Self::set_tick_period).
    pub fn set_on_tick(&self, hook: impl Fn() + Send + Sync + 'static) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.on_tick = Some(Arc::new(hook));
        Ok(())
    }

    /// Set the tick period; zero disables ticking.
    pub fn set_tick_period(&self, period: Duration) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        self.ensure_tick_timer(&mut w)?;
        if let Some(timer) = &w.pane(self.id)?.tick_timer {
            timer.set_period(period);
        }
        Ok(())
    }

    /// Enable or disable ticking without touching the period.
    pub fn set_tick_enabled(&self, enabled: bool) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        self.ensure_tick_timer(&mut w)?;
        if let Some(timer) = &w.pane(self.id)?.tick_timer {
            timer.set_enabled(enabled);
        }
        Ok(())
    }

    /// Marshal the tick hook through the installed UI dispatcher.
    pub fn set_tick_ui_sync(&self, sync: bool) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        self.ensure_tick_timer(&mut w)?;
        if let Some(timer) = &w.pane(self.id)?.tick_timer {
            timer.set_ui_sync(sync);
        }
        Ok(())
    }

    fn ensure_tick_timer(&self, w: &mut World) -> Result<(), SceneError> {
        if w.pane(self.id)?.tick_timer.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.engine);
        let id = self.id;
        let timer = TickTimer::new(self.engine.scheduler(), move || {
            let Some(engine) = weak.upgrade() else { return };
            let hook = {
                let w = engine.lock();
                w.panes.get(id.0).and_then(|p| p.on_tick.clone())
            };
            if let Some(hook) = hook {
                hook();
            }
        });
        w.pane_mut(self.id)?.tick_timer = Some(timer);
        Ok(())
    }

    // --- Key repeat configuration ------------------------------------------

    /// Set the global key-repeat period; zero leaves repeating to the
    /// platform.
    pub fn set_key_repeat(&self, period: Duration) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.repeat.period = period;
        Ok(())
    }

    /// Override the repeat period for one key.
    pub fn set_key_repeat_override(
        &self,
        code: KeyCode,
        period: Duration,
    ) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.repeat.overrides.insert(code, period);
        Ok(())
    }

    /// Remove a per-key repeat override.
    pub fn clear_key_repeat_override(&self, code: KeyCode) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane_mut(self.id)?.repeat.overrides.remove(&code);
        Ok(())
    }

    /// Whether a key is currently tracked as held.
    pub fn is_key_held(&self, code: KeyCode) -> Result<bool, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.repeat.is_held(code))
    }

    // --- Event entry points ------------------------------------------------

    /// Route a mouse event (positioned in this pane's local coordinates)
    /// through the subtree.
    pub fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane(self.id)?;
        route_mouse(&mut w, self.id, event);
        Ok(())
    }

    /// Run a key event through this pane's repeater, then broadcast it to
    /// the whole subtree.
    pub fn dispatch_key(&self, event: KeyEvent) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        w.pane(self.id)?;
        if let Some(event) = crate::keyrepeat::process(&self.engine, &mut w, self.id, event) {
            broadcast_key(&mut w, self.id, event);
        }
        Ok(())
    }

    /// Buttons this pane holds from presses it received.
    pub fn held_buttons(&self) -> Result<MouseButtons, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.held)
    }

    /// The last mouse event delivered to this pane.
    pub fn last_mouse(&self) -> Result<Option<MouseEvent>, SceneError> {
        let w = self.engine.lock();
        Ok(w.pane(self.id)?.last_mouse)
    }
}

// ---------------------------------------------------------------------------
// World-side helpers
// ---------------------------------------------------------------------------

/// Mark `id` and every ancestor dirty, notifying listeners (deferred).
pub(crate) fn invalidate_up(w: &mut World, id: PaneId) {
    let mut current = Some(id);
    while let Some(pane) = current {
        let (parent, listeners) = {
            let Ok(st) = w.pane_mut(pane) else { break };
            st.dirty = true;
            let listeners = if st.listeners.is_empty() {
                None
            } else {
                Some(st.listeners.clone())
            };
            (st.parent, listeners)
        };
        if let Some(listeners) = listeners {
            w.defer(Box::new(move || {
                for listener in &listeners {
                    listener.pane_invalidated(pane);
                }
            }));
        }
        current = parent;
    }
}

/// Rebuild the derived pane/turtle sub-lists by filtering the main list.
pub(crate) fn rebuild_sublists(w: &mut World, id: PaneId) {
    let Ok(st) = w.pane_mut(id) else { return };
    st.pane_children = st
        .children
        .iter()
        .filter_map(|node| match node {
            SceneNode::Pane(p) => Some(*p),
            SceneNode::Turtle(_) => None,
        })
        .collect();
    st.turtle_children = st
        .children
        .iter()
        .filter_map(|node| match node {
            SceneNode::Turtle(t) => Some(*t),
            SceneNode::Pane(_) => None,
        })
        .collect();
}

/// Remove `node` from `parent`'s lists. A removed pane synthesizes
/// releases for buttons it still holds so it never ends up with a stuck
/// button.
pub(crate) fn detach_from_parent(w: &mut World, parent: PaneId, node: SceneNode) {
    if let Ok(st) = w.pane_mut(parent) {
        st.children.retain(|&c| c != node);
    }
    rebuild_sublists(w, parent);
    invalidate_up(w, parent);
    if let SceneNode::Pane(pane) = node {
        synthesize_releases(w, pane);
    }
}

fn synthesize_releases(w: &mut World, id: PaneId) {
    let Ok(st) = w.pane(id) else { return };
    let held = st.held;
    let position = st
        .last_mouse
        .map(|m| m.position)
        .unwrap_or(Point::new(0.0, 0.0));
    for button in [MouseButton::Left, MouseButton::Right, MouseButton::Middle] {
        if held.contains(button.into()) {
            deliver_own_mouse(
                w,
                id,
                MouseEvent::new(MouseEventKind::Release(button), position),
            );
        }
    }
}

fn is_ancestor(w: &World, candidate: PaneId, of: PaneId) -> Result<bool, SceneError> {
    let mut current = w.pane(of)?.parent;
    while let Some(pane) = current {
        if pane == candidate {
            return Ok(true);
        }
        current = w.pane(pane)?.parent;
    }
    Ok(false)
}

pub(crate) fn set_overlay_in(
    w: &mut World,
    id: PaneId,
    name: &str,
    overlay: DisplayList,
) -> Result<(), SceneError> {
    let st = w.pane_mut(id)?;
    match st.overlays.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => *existing = overlay,
        None => st.overlays.push((name.to_string(), overlay)),
    }
    Ok(())
}

pub(crate) fn remove_overlay_in(w: &mut World, id: PaneId, name: &str) {
    if let Ok(st) = w.pane_mut(id) {
        st.overlays.retain(|(n, _)| n != name);
    }
}

/// Recompose the cached output of a dirty pane subtree.
///
/// Invalidation always propagates upward, so a clean pane implies a clean
/// subtree and the recursion can stop immediately.
pub(crate) fn ensure_repaint(w: &mut World, id: PaneId) {
    let (dirty, children) = match w.panes.get(id.0) {
        Some(st) => (st.dirty, st.children.clone()),
        None => return,
    };
    if !dirty {
        return;
    }
    for node in &children {
        if let SceneNode::Pane(child) = node {
            ensure_repaint(w, *child);
        }
    }

    let mut cache = DisplayList::new();
    if let Ok(st) = w.pane(id) {
        if st.draw_background && !st.background.is_transparent() {
            cache.fill_rect(
                Rect::new(0.0, 0.0, st.width, st.height),
                st.background,
            );
        }
        for op in st.content.ops() {
            cache.push(op.clone());
        }
        for (_, overlay) in &st.overlays {
            for op in overlay.ops() {
                cache.push(op.clone());
            }
        }
    }
    // Children in z-order: earlier entries first, front-most last (on top).
    for node in &children {
        match node {
            SceneNode::Pane(child) => {
                if let Ok(ch) = w.pane(*child) {
                    ch.cache
                        .replay(&mut cache, ch.to_parent, 1.0 - ch.transparency);
                }
            }
            SceneNode::Turtle(t) => turtle::paint(w, *t, &mut cache),
        }
    }
    if let Ok(st) = w.pane(id)
        && st.border_width > 0.0
    {
        cache.stroke_rect(
            Rect::new(0.0, 0.0, st.width, st.height),
            st.border_width,
            st.border_color,
        );
    }
    if let Ok(st) = w.pane_mut(id) {
        st.cache = cache;
        st.dirty = false;
    }
}

/// Route a mouse event through `id`'s subtree (event in local coords).
pub(crate) fn route_mouse(w: &mut World, id: PaneId, event: MouseEvent) {
    let pane_kids = match w.panes.get(id.0) {
        Some(st) => st.pane_children.clone(),
        None => return,
    };
    // Front-to-back: later children are in front.
    let mut blocked = false;
    for child in pane_kids.iter().rev() {
        let Some(ch) = w.panes.get(child.0) else {
            continue;
        };
        let local = ch.to_local * event.position;
        let wanting = ch.wants(&event);
        let inside = ch.contains_local(local);
        let blocks = ch.blocks_mouse();
        if wanting || (inside && !blocked) {
            route_mouse(w, *child, event.at(local));
        }
        if inside && !blocked && blocks {
            blocked = true;
        }
    }

    let Some(st) = w.panes.get(id.0) else { return };
    let wanting = st.wants(&event);
    let inside = st.contains_local(event.position);
    if wanting || (inside && !blocked) {
        deliver_own_mouse(w, id, event);
    }
}

/// Deliver an event to the pane itself: held-button bookkeeping plus the
/// user hook. Duplicate presses and unmatched releases are dropped here.
fn deliver_own_mouse(w: &mut World, id: PaneId, event: MouseEvent) {
    let Some(st) = w.panes.get_mut(id.0) else {
        return;
    };
    let deliver = match event.kind {
        MouseEventKind::Press(button) => {
            let bit = button.into();
            if st.held.contains(bit) {
                false
            } else {
                st.held.insert(bit);
                true
            }
        }
        MouseEventKind::Release(button) => {
            let bit = button.into();
            if st.held.contains(bit) {
                st.held.remove(bit);
                true
            } else {
                false
            }
        }
        MouseEventKind::Drag(_) | MouseEventKind::Move => true,
    };
    if !deliver {
        return;
    }
    st.last_mouse = Some(event);
    let hook = st.on_mouse.clone();
    if let Some(hook) = hook {
        w.defer(Box::new(move || hook(&event)));
    }
}

/// Deliver a key event to every pane in the subtree, unconditionally.
pub(crate) fn broadcast_key(w: &mut World, id: PaneId, event: KeyEvent) {
    let (kids, hook) = match w.panes.get(id.0) {
        Some(st) => (st.pane_children.clone(), st.on_key.clone()),
        None => return,
    };
    if let Some(hook) = hook {
        w.defer(Box::new(move || hook(&event)));
    }
    for child in kids {
        broadcast_key(w, child, event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
