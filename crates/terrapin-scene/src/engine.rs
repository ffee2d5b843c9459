#![forbid(unsafe_code)]

//! The engine: one global ordering lock around the whole object graph.
//!
//! Every pane, turtle, and animation lives inside the [`World`]; the
//! world sits behind a single mutex owned by [`Engine`]. Public handles
//! lock the world for the entire body of each operation, which makes
//! compound invariants (dirty flags, z-order sub-lists, animation slots)
//! atomic without per-field locks — the whole system behaves as if
//! single-threaded.
//!
//! The mutex guard doubles as the capability token: engine-internal code
//! receives `&mut World` and never locks again. User callbacks (tick,
//! mouse, key hooks, animation finalizers) are queued on the world while
//! the lock is held and run by the guard *after* it releases, so a
//! callback that calls back into the engine re-acquires the lock through
//! an ordinary public operation instead of deadlocking.

use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use terrapin_core::sched::Scheduler;

use crate::animation::AnimationState;
use crate::error::SceneError;
use crate::pane::PaneState;
use crate::store::{AnimId, PaneId, Slots, TurtleId};
use crate::turtle::TurtleState;

/// A callback queued while the world lock is held, run after release.
pub(crate) type DeferredJob = Box<dyn FnOnce() + Send>;

/// The lock-protected object graph.
pub(crate) struct World {
    pub(crate) panes: Slots<PaneState>,
    pub(crate) turtles: Slots<TurtleState>,
    pub(crate) animations: Slots<AnimationState>,
    deferred: Vec<DeferredJob>,
}

impl World {
    fn new() -> Self {
        Self {
            panes: Slots::new(),
            turtles: Slots::new(),
            animations: Slots::new(),
            deferred: Vec::new(),
        }
    }

    /// Queue a user callback to run once the lock is released.
    pub(crate) fn defer(&mut self, job: DeferredJob) {
        self.deferred.push(job);
    }

    pub(crate) fn pane(&self, id: PaneId) -> Result<&PaneState, SceneError> {
        self.panes.get(id.0).ok_or(SceneError::Gone)
    }

    pub(crate) fn pane_mut(&mut self, id: PaneId) -> Result<&mut PaneState, SceneError> {
        self.panes.get_mut(id.0).ok_or(SceneError::Gone)
    }

    pub(crate) fn turtle(&self, id: TurtleId) -> Result<&TurtleState, SceneError> {
        self.turtles.get(id.0).ok_or(SceneError::Gone)
    }

    pub(crate) fn turtle_mut(&mut self, id: TurtleId) -> Result<&mut TurtleState, SceneError> {
        self.turtles.get_mut(id.0).ok_or(SceneError::Gone)
    }

    pub(crate) fn animation_mut(&mut self, id: AnimId) -> Result<&mut AnimationState, SceneError> {
        self.animations.get_mut(id.0).ok_or(SceneError::Gone)
    }
}

/// The engine: the global lock, the world behind it, and the scheduler
/// that drives timed work.
pub struct Engine {
    world: Mutex<World>,
    sched: Scheduler,
}

impl Engine {
    /// Create an engine using the process-wide shared scheduler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_scheduler(Scheduler::shared().clone())
    }

    /// Create an engine with its own scheduler (used by tests to keep
    /// timing isolated).
    #[must_use]
    pub fn with_scheduler(sched: Scheduler) -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(World::new()),
            sched,
        })
    }

    /// The scheduler timed engine work runs on.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Acquire the global lock.
    ///
    /// Recovery rather than panic on poisoning: a panicked engine path
    /// must not wedge every later operation.
    pub(crate) fn lock(&self) -> WorldGuard<'_> {
        WorldGuard {
            guard: Some(self.world.lock().unwrap_or_else(PoisonError::into_inner)),
        }
    }
}

/// Guard over the world; drains deferred callbacks after releasing.
pub(crate) struct WorldGuard<'a> {
    guard: Option<MutexGuard<'a, World>>,
}

impl Deref for WorldGuard<'_> {
    type Target = World;

    fn deref(&self) -> &World {
        self.guard.as_ref().expect("guard taken before drop")
    }
}

impl DerefMut for WorldGuard<'_> {
    fn deref_mut(&mut self) -> &mut World {
        self.guard.as_mut().expect("guard taken before drop")
    }
}

impl Drop for WorldGuard<'_> {
    fn drop(&mut self) {
        let jobs = match self.guard.as_mut() {
            Some(world) => std::mem::take(&mut world.deferred),
            None => return,
        };
        // Release the lock first; callbacks re-enter through public ops.
        self.guard = None;
        for job in jobs {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::warn!(
                    target: "terrapin.engine",
                    "user callback panicked; engine state is unaffected"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn deferred_jobs_run_after_release() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut w = engine.lock();
            let c = Arc::clone(&counter);
            w.defer(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
            // Not yet: lock still held.
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        engine.scheduler().shutdown();
    }

    #[test]
    fn deferred_job_may_relock_the_engine() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let observed = Arc::new(AtomicUsize::new(0));
        {
            let mut w = engine.lock();
            let inner = Arc::clone(&engine);
            let obs = Arc::clone(&observed);
            w.defer(Box::new(move || {
                // Re-entering through a fresh lock must not deadlock.
                let w = inner.lock();
                obs.store(w.panes.len() + 1, Ordering::SeqCst);
            }));
        }
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        engine.scheduler().shutdown();
    }

    #[test]
    fn panicking_deferred_job_is_contained() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut w = engine.lock();
            w.defer(Box::new(|| panic!("bad callback")));
            let c = Arc::clone(&counter);
            w.defer(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // The panic was swallowed and the second job still ran.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        engine.scheduler().shutdown();
    }
}
