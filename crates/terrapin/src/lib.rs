#![forbid(unsafe_code)]

//! Terrapin public facade crate.
//!
//! Re-exports the stable surface of the engine crates and offers a
//! prelude for day-to-day usage:
//!
//! ```
//! use terrapin::prelude::*;
//!
//! let engine = Engine::new();
//! let root = Pane::new(&engine, 400.0, 300.0);
//! let turtle = Turtle::new(&engine);
//! root.add_turtle(&turtle).unwrap();
//! turtle.set_move_turn_speed(0.0).unwrap();
//! turtle.set_position(200.0, 150.0).unwrap();
//! turtle.step(50.0).unwrap();
//! ```

// --- Core re-exports -------------------------------------------------------

pub use terrapin_core::animator::{Animator, CompositeAnimator, SequenceAnimator, Weighted};
pub use terrapin_core::color::Color;
pub use terrapin_core::event::{
    KeyCode, KeyEvent, KeyEventKind, Modifiers, MouseButton, MouseButtons, MouseEvent,
    MouseEventKind,
};
pub use terrapin_core::geometry::{Affine, Point, Rect, Vec2};
pub use terrapin_core::sched::{ScheduleError, Scheduler, TaskHandle};
pub use terrapin_core::timer::TickTimer;
pub use terrapin_core::ui::{self, InlineDispatcher, UiDispatcher, UiTask};

// --- Scene re-exports ------------------------------------------------------

pub use terrapin_scene::animation::{Animation, AnimationStatus, PROGRESS_TICK};
pub use terrapin_scene::engine::Engine;
pub use terrapin_scene::error::SceneError;
pub use terrapin_scene::pane::{Pane, PaneListener, SceneNode};
pub use terrapin_scene::shape::{ClassicShape, ShapeContext, TurtleShape};
pub use terrapin_scene::surface::{DisplayList, DrawOp, ImageHandle, Surface};
pub use terrapin_scene::turtle::{DEFAULT_MOVE_TURN_SPEED, RangePolicy, Turtle};
pub use terrapin_scene::{PaneId, TurtleId};

/// Standard result type for terrapin APIs.
pub type Result<T> = std::result::Result<T, SceneError>;

/// Everything most programs need.
pub mod prelude {
    pub use crate::{
        Animation, AnimationStatus, ClassicShape, Color, DisplayList, Engine, KeyCode, KeyEvent,
        KeyEventKind, MouseButton, MouseEvent, MouseEventKind, Pane, PaneListener, Point,
        RangePolicy, Rect, SceneError, SceneNode, Surface, Turtle, TurtleShape,
    };
}
