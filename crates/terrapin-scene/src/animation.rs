#![forbid(unsafe_code)]

//! Bounded-duration animation driving.
//!
//! An [`Animation`] owns one animator and a duration. Once started, a
//! repeating scheduler task samples the elapsed fraction every
//! [`PROGRESS_TICK`] and applies it through the animator; when the
//! fraction reaches 1 the animation stops itself.
//!
//! # Completion protocol
//!
//! `stop` cancels the progress task, marks the animation stopped, and
//! schedules (never runs inline) a one-shot completion task. Completion
//! applies `animate(1.0)` exactly once more — the final state always
//! lands even when timing skipped the exact 1.0 sample — then runs the
//! internal epilogue (exact final position, slot bookkeeping), then the
//! user finalizer (panics swallowed), then marks the animation completed
//! and wakes any blocked waiter. The one exception is a zero-duration
//! animation, which completes synchronously inside `start` so the caller
//! observes the finalizer having run before `start` returns.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use terrapin_core::animator::Animator;
use terrapin_core::ui;
use web_time::Instant;

use crate::engine::{Engine, World};
use crate::error::SceneError;
use crate::store::AnimId;

/// Interval between animation progress samples.
pub const PROGRESS_TICK: Duration = Duration::from_millis(50);

/// Lifecycle state of an animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationStatus {
    /// Created but not yet started.
    NotStarted,
    /// Progress task is sampling.
    Running,
    /// Stopped; completion is in flight.
    Stopped,
    /// Fully completed; terminal.
    Completed,
}

/// Flag + condvar a blocked waiter sleeps on.
pub(crate) struct CompletionGate {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl CompletionGate {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut done = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait(&self) {
        let mut done = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .cond
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// World-side state of one animation.
pub(crate) struct AnimationState {
    pub(crate) status: AnimationStatus,
    duration: Duration,
    started_at: Option<Instant>,
    task: Option<terrapin_core::sched::TaskHandle>,
    animator: Arc<dyn Animator<World>>,
    epilogue: Option<Box<dyn FnOnce(&mut World) + Send>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
    gate: Arc<CompletionGate>,
}

/// Handle to an animation. Cheap to clone; the animation itself lives in
/// the world and is terminal once completed — handles are not reusable to
/// start a second run.
#[derive(Clone)]
pub struct Animation {
    pub(crate) id: AnimId,
    pub(crate) engine: Arc<Engine>,
    gate: Arc<CompletionGate>,
}

impl fmt::Debug for Animation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Animation")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Create an animation in the world. The epilogue runs under the lock at
/// completion, before the user finalizer.
pub(crate) fn create(
    engine: &Arc<Engine>,
    w: &mut World,
    duration: Duration,
    animator: Arc<dyn Animator<World>>,
    epilogue: Box<dyn FnOnce(&mut World) + Send>,
) -> Animation {
    let gate = Arc::new(CompletionGate::new());
    let id = AnimId(w.animations.insert(AnimationState {
        status: AnimationStatus::NotStarted,
        duration,
        started_at: None,
        task: None,
        animator,
        epilogue: Some(epilogue),
        on_complete: None,
        gate: Arc::clone(&gate),
    }));
    Animation {
        id,
        engine: Arc::clone(engine),
        gate,
    }
}

/// Rebuild a handle for an animation that still lives in the world.
pub(crate) fn handle_for(engine: &Arc<Engine>, w: &World, id: AnimId) -> Option<Animation> {
    let st = w.animations.get(id.0)?;
    Some(Animation {
        id,
        engine: Arc::clone(engine),
        gate: Arc::clone(&st.gate),
    })
}

pub(crate) fn start_in_world(
    engine: &Arc<Engine>,
    w: &mut World,
    id: AnimId,
) -> Result<(), SceneError> {
    let st = w.animation_mut(id)?;
    if st.status != AnimationStatus::NotStarted {
        return Err(SceneError::AlreadyStarted);
    }
    if st.duration.is_zero() {
        st.status = AnimationStatus::Stopped;
        complete_in_world(w, id);
        return Ok(());
    }
    st.status = AnimationStatus::Running;
    st.started_at = Some(Instant::now());

    let weak = Arc::downgrade(engine);
    let task = match engine
        .scheduler()
        .run_repeating(PROGRESS_TICK, PROGRESS_TICK, move || {
            progress_tick(&weak, id);
        }) {
        Ok(task) => task,
        Err(err) => {
            let st = w.animation_mut(id)?;
            st.status = AnimationStatus::NotStarted;
            st.started_at = None;
            return Err(err.into());
        }
    };
    w.animation_mut(id)?.task = Some(task);
    Ok(())
}

pub(crate) fn stop_in_world(engine: &Arc<Engine>, w: &mut World, id: AnimId) {
    let Some(st) = w.animations.get_mut(id.0) else {
        return;
    };
    match st.status {
        AnimationStatus::Running | AnimationStatus::NotStarted => {
            if let Some(task) = st.task.take() {
                task.cancel();
            }
            st.status = AnimationStatus::Stopped;
        }
        AnimationStatus::Stopped | AnimationStatus::Completed => return,
    }

    let weak = Arc::downgrade(engine);
    match engine.scheduler().run_now(move || completion_task(&weak, id)) {
        Ok(_) => {}
        Err(err) => {
            // Without a worker (shutdown mid-test) complete inline rather
            // than stranding a waiter.
            tracing::warn!(target: "terrapin.anim", %err, "completing inline");
            complete_in_world(w, id);
        }
    }
}

fn completion_task(weak: &Weak<Engine>, id: AnimId) {
    let Some(engine) = weak.upgrade() else {
        return;
    };
    let mut w = engine.lock();
    complete_in_world(&mut w, id);
}

pub(crate) fn complete_in_world(w: &mut World, id: AnimId) {
    let animator = match w.animations.get_mut(id.0) {
        Some(st) => Arc::clone(&st.animator),
        None => return,
    };
    // The final state is always applied, even when sampling never hit 1.0.
    animator.animate(w, 1.0);

    let Some(mut st) = w.animations.remove(id.0) else {
        return;
    };
    if let Some(epilogue) = st.epilogue.take() {
        epilogue(w);
    }
    let on_complete = st.on_complete.take();
    let gate = st.gate;
    w.defer(Box::new(move || {
        if let Some(finish) = on_complete
            && catch_unwind(AssertUnwindSafe(finish)).is_err()
        {
            tracing::warn!(
                target: "terrapin.anim",
                "animation finalizer panicked; completion continues"
            );
        }
        gate.set();
    }));
}

fn progress_tick(weak: &Weak<Engine>, id: AnimId) {
    let Some(engine) = weak.upgrade() else {
        return;
    };
    let mut w = engine.lock();
    let Some(st) = w.animations.get_mut(id.0) else {
        return;
    };
    if st.status != AnimationStatus::Running {
        return;
    }
    let Some(started) = st.started_at else {
        return;
    };
    let duration = st.duration;
    let animator = Arc::clone(&st.animator);
    let fraction = (started.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0);
    animator.animate(&mut w, fraction);
    if fraction >= 1.0 {
        stop_in_world(&engine, &mut w, id);
    }
}

impl Animation {
    /// Start the animation.
    ///
    /// A second start — or a start after `stop` — is a precondition error.
    /// A zero-duration animation completes synchronously: its finalizer
    /// has run by the time this returns.
    pub fn start(&self) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        start_in_world(&self.engine, &mut w, self.id)
    }

    /// Stop the animation and schedule completion.
    ///
    /// Idempotent, and safe to call even if the animation never started
    /// (it jumps straight to its final state).
    pub fn stop(&self) {
        let mut w = self.engine.lock();
        stop_in_world(&self.engine, &mut w, self.id);
    }

    /// Install the completion finalizer. Only allowed before `start`.
    pub fn set_on_complete(
        &self,
        finish: impl FnOnce() + Send + 'static,
    ) -> Result<(), SceneError> {
        let mut w = self.engine.lock();
        let st = w
            .animations
            .get_mut(self.id.0)
            .ok_or(SceneError::AlreadyStarted)?;
        if st.status != AnimationStatus::NotStarted {
            return Err(SceneError::AlreadyStarted);
        }
        st.on_complete = Some(Box::new(finish));
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> AnimationStatus {
        if self.gate.is_set() {
            return AnimationStatus::Completed;
        }
        let w = self.engine.lock();
        match w.animations.get(self.id.0) {
            Some(st) => st.status,
            // Slot already gone: completion is in flight.
            None => AnimationStatus::Stopped,
        }
    }

    /// Whether the animation has fully completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.gate.is_set()
    }

    /// Block the calling thread until the animation completes.
    ///
    /// Refuses to run on the UI thread: the completion task may itself
    /// need that thread, so waiting there would deadlock.
    pub fn wait_for_completion(&self) -> Result<(), SceneError> {
        if ui::dispatcher().is_ui_thread() {
            return Err(SceneError::WaitOnUiThread);
        }
        self.gate.wait();
        Ok(())
    }

    /// `start` followed by `wait_for_completion`.
    pub fn start_and_wait(&self) -> Result<(), SceneError> {
        self.start()?;
        self.wait_for_completion()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use terrapin_core::sched::Scheduler;

    /// Records every sampled fraction.
    struct Sampler {
        samples: Arc<Mutex<Vec<f64>>>,
    }

    impl Animator<World> for Sampler {
        fn animate(&self, _cx: &mut World, fraction: f64) {
            self.samples.lock().unwrap().push(fraction);
        }
    }

    fn sampler() -> (Arc<dyn Animator<World>>, Arc<Mutex<Vec<f64>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Sampler {
                samples: Arc::clone(&samples),
            }),
            samples,
        )
    }

    fn new_animation(
        engine: &Arc<Engine>,
        duration: Duration,
    ) -> (Animation, Arc<Mutex<Vec<f64>>>) {
        let (animator, samples) = sampler();
        let mut w = engine.lock();
        let anim = create(engine, &mut w, duration, animator, Box::new(|_| {}));
        drop(w);
        (anim, samples)
    }

    #[test]
    fn zero_duration_completes_before_start_returns() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, samples) = new_animation(&engine, Duration::ZERO);
        let finished = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&finished);
        anim.set_on_complete(move || f.store(true, Ordering::SeqCst))
            .unwrap();

        anim.start().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(anim.is_completed());
        assert_eq!(anim.status(), AnimationStatus::Completed);
        assert_eq!(samples.lock().unwrap().as_slice(), &[1.0]);
        engine.scheduler().shutdown();
    }

    #[test]
    fn double_start_is_a_precondition_error() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, _) = new_animation(&engine, Duration::from_millis(200));
        anim.start().unwrap();
        assert_eq!(anim.start(), Err(SceneError::AlreadyStarted));
        anim.stop();
        engine.scheduler().shutdown();
    }

    #[test]
    fn stop_twice_is_a_noop() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, _) = new_animation(&engine, Duration::from_millis(200));
        anim.start().unwrap();
        anim.stop();
        anim.stop();
        anim.wait_for_completion().unwrap();
        engine.scheduler().shutdown();
    }

    #[test]
    fn stop_before_start_jumps_to_final_state() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, samples) = new_animation(&engine, Duration::from_millis(200));
        anim.stop();
        anim.wait_for_completion().unwrap();
        assert_eq!(samples.lock().unwrap().last(), Some(&1.0));
        engine.scheduler().shutdown();
    }

    #[test]
    fn wait_observes_final_fraction() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, samples) = new_animation(&engine, Duration::from_millis(120));
        anim.start_and_wait().unwrap();
        let samples = samples.lock().unwrap();
        assert!(!samples.is_empty());
        assert_eq!(*samples.last().unwrap(), 1.0);
        // Fractions never decrease.
        for pair in samples.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        engine.scheduler().shutdown();
    }

    #[test]
    fn panicking_finalizer_does_not_strand_waiters() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, _) = new_animation(&engine, Duration::ZERO);
        anim.set_on_complete(|| panic!("finalizer failure")).unwrap();
        anim.start_and_wait().unwrap();
        assert!(anim.is_completed());
        engine.scheduler().shutdown();
    }

    #[test]
    fn finalizer_cannot_be_set_after_start() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, _) = new_animation(&engine, Duration::from_millis(150));
        anim.start().unwrap();
        assert_eq!(
            anim.set_on_complete(|| {}),
            Err(SceneError::AlreadyStarted)
        );
        anim.stop();
        engine.scheduler().shutdown();
    }

    #[test]
    fn status_progression() {
        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, _) = new_animation(&engine, Duration::from_millis(150));
        assert_eq!(anim.status(), AnimationStatus::NotStarted);
        anim.start().unwrap();
        assert_eq!(anim.status(), AnimationStatus::Running);
        anim.wait_for_completion().unwrap();
        assert_eq!(anim.status(), AnimationStatus::Completed);
        engine.scheduler().shutdown();
    }

    #[test]
    fn waiting_on_the_ui_thread_fails_fast() {
        struct FakeUi {
            ui_thread: std::thread::ThreadId,
        }

        impl ui::UiDispatcher for FakeUi {
            fn run(&self, task: ui::UiTask) {
                task();
            }
            fn run_blocking(&self, task: ui::UiTask) {
                task();
            }
            fn is_ui_thread(&self) -> bool {
                std::thread::current().id() == self.ui_thread
            }
        }

        // Install marks *this* test thread as the UI thread; other test
        // threads are unaffected. A racing earlier install means the guard
        // is simply not exercised, so skip in that case.
        let installed = ui::install(Arc::new(FakeUi {
            ui_thread: std::thread::current().id(),
        }))
        .is_ok();
        if !installed && !ui::dispatcher().is_ui_thread() {
            return;
        }

        let engine = Engine::with_scheduler(Scheduler::new());
        let (anim, _) = new_animation(&engine, Duration::from_millis(100));
        anim.start().unwrap();
        assert_eq!(anim.wait_for_completion(), Err(SceneError::WaitOnUiThread));
        anim.stop();
        engine.scheduler().shutdown();
    }
}
