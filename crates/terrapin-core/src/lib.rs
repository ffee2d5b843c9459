#![forbid(unsafe_code)]

//! Core primitives for the Terrapin engine.
//!
//! This crate holds everything below the scene graph: geometric and angular
//! math, color, canonical input event types, the shared background
//! [`Scheduler`](sched::Scheduler), the self-rescheduling
//! [`TickTimer`](timer::TickTimer), the weighted
//! [`Animator`](animator::Animator) composition family, and the UI-thread
//! dispatcher seam.
//!
//! Nothing in here knows about panes or turtles; the types are either pure
//! (animators, angles) or world-agnostic (the scheduler runs boxed tasks).

pub mod animator;
pub mod color;
pub mod event;
pub mod geometry;
pub mod sched;
pub mod timer;
pub mod ui;

pub use animator::{Animator, CompositeAnimator, SequenceAnimator, Weighted};
pub use color::Color;
pub use event::{
    KeyCode, KeyEvent, KeyEventKind, Modifiers, MouseButton, MouseButtons, MouseEvent,
    MouseEventKind,
};
pub use sched::{ScheduleError, Scheduler, TaskHandle};
pub use timer::TickTimer;
pub use ui::{InlineDispatcher, UiDispatcher};
