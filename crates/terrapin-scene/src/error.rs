#![forbid(unsafe_code)]

//! Scene-level error type.

use std::fmt;

use terrapin_core::sched::ScheduleError;

/// Errors surfaced by scene-graph and animation operations.
///
/// Every variant except [`Schedule`](Self::Schedule) is a precondition
/// violation: a programming mistake in calling code, reported immediately
/// and never retried or swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneError {
    /// The handle refers to an object that no longer exists.
    Gone,
    /// A membership or z-order operation named an object that is not a
    /// child of this pane.
    NotAChild,
    /// Attaching the pane would create a cycle in the tree.
    WouldCycle,
    /// A turtle mutation was attempted while an animation is active on it.
    MotionActive,
    /// The animation was already started (or has already run).
    AlreadyStarted,
    /// A blocking wait was attempted on the UI thread.
    WaitOnUiThread,
    /// The background scheduler rejected the work.
    Schedule(ScheduleError),
}

impl fmt::Display for SceneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone => write!(f, "object no longer exists"),
            Self::NotAChild => write!(f, "object is not a child of this pane"),
            Self::WouldCycle => write!(f, "attaching here would create a cycle"),
            Self::MotionActive => write!(f, "turtle already has an active animation"),
            Self::AlreadyStarted => write!(f, "animation was already started"),
            Self::WaitOnUiThread => {
                write!(f, "waiting for an animation on the UI thread would deadlock")
            }
            Self::Schedule(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SceneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Schedule(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ScheduleError> for SceneError {
    fn from(err: ScheduleError) -> Self {
        Self::Schedule(err)
    }
}
