#![forbid(unsafe_code)]

//! Self-rescheduling periodic tick timer.
//!
//! A [`TickTimer`] owns at most one pending one-shot on the
//! [`Scheduler`](crate::sched::Scheduler) at a time. Each firing invokes
//! the owner's tick hook and then schedules the next firing relative to
//! *now* — drift is tolerated so that a slow hook delays only itself and
//! never builds a backlog.
//!
//! # Invariants
//!
//! 1. Period 0 means disabled; `set_period` with the current value is a
//!    no-op and does not disturb the pending firing.
//! 2. While the hook is running, the in-progress flag suppresses
//!    rescheduling from `set_period`/`set_enabled`; the firing itself
//!    reschedules when it completes, reading the then-current settings.
//! 3. Disabling cancels the pending firing; a firing already in progress
//!    completes normally. Enable/disable are idempotent.
//! 4. A panicking hook is caught and logged; the timer keeps ticking.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::sched::{Scheduler, TaskHandle};
use crate::ui;

struct TimerState {
    period: Duration,
    enabled: bool,
    in_progress: bool,
    pending: Option<TaskHandle>,
    sync_ui: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    on_tick: Box<dyn Fn() + Send + Sync>,
    sched: Scheduler,
}

/// A periodic callback driver owned by one engine object.
pub struct TickTimer {
    inner: Arc<TimerInner>,
}

impl TickTimer {
    /// Create a disabled timer (period 0) around a tick hook.
    #[must_use]
    pub fn new(sched: &Scheduler, on_tick: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState {
                    period: Duration::ZERO,
                    enabled: true,
                    in_progress: false,
                    pending: None,
                    sync_ui: false,
                }),
                on_tick: Box::new(on_tick),
                sched: sched.clone(),
            }),
        }
    }

    /// Current period. Zero means the timer is disabled.
    #[must_use]
    pub fn period(&self) -> Duration {
        lock(&self.inner).period
    }

    /// Whether the timer is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        lock(&self.inner).enabled
    }

    /// Set the tick period.
    ///
    /// An unchanged period is a no-op. Otherwise any pending firing is
    /// cancelled and, if the timer is enabled and the period is non-zero,
    /// the next firing is scheduled a full period out.
    pub fn set_period(&self, period: Duration) {
        let mut st = lock(&self.inner);
        if st.period == period {
            return;
        }
        if let Some(handle) = st.pending.take() {
            handle.cancel();
        }
        st.period = period;
        if st.enabled && !period.is_zero() && !st.in_progress {
            schedule_next(&self.inner, &mut st);
        }
    }

    /// Enable or disable the timer. Idempotent.
    ///
    /// Disabling cancels the pending firing but lets a firing already in
    /// progress complete normally.
    pub fn set_enabled(&self, enabled: bool) {
        let mut st = lock(&self.inner);
        if st.enabled == enabled {
            return;
        }
        st.enabled = enabled;
        if enabled {
            if !st.period.is_zero() && !st.in_progress && st.pending.is_none() {
                schedule_next(&self.inner, &mut st);
            }
        } else if let Some(handle) = st.pending.take() {
            handle.cancel();
        }
    }

    /// Marshal the tick hook through the installed UI dispatcher.
    pub fn set_ui_sync(&self, sync: bool) {
        lock(&self.inner).sync_ui = sync;
    }
}

impl Drop for TickTimer {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner).pending.take() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for TickTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner);
        f.debug_struct("TickTimer")
            .field("period", &st.period)
            .field("enabled", &st.enabled)
            .field("in_progress", &st.in_progress)
            .finish()
    }
}

fn lock(inner: &TimerInner) -> MutexGuard<'_, TimerState> {
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn schedule_next(inner: &Arc<TimerInner>, st: &mut TimerState) {
    let weak = Arc::downgrade(inner);
    match inner.sched.run_after(st.period, move || fire(&weak)) {
        Ok(handle) => st.pending = Some(handle),
        Err(err) => {
            tracing::warn!(target: "terrapin.timer", %err, "could not schedule tick");
        }
    }
}

fn fire(weak: &Weak<TimerInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let sync_ui = {
        let mut st = lock(&inner);
        st.pending = None;
        if !st.enabled || st.period.is_zero() {
            return;
        }
        st.in_progress = true;
        st.sync_ui
    };

    let hook_owner = Arc::clone(&inner);
    let invoke = move || {
        if catch_unwind(AssertUnwindSafe(|| (hook_owner.on_tick)())).is_err() {
            tracing::warn!(target: "terrapin.timer", "tick hook panicked; timer continues");
        }
    };
    if sync_ui {
        ui::dispatcher().run_blocking(Box::new(invoke));
    } else {
        invoke();
    }

    let mut st = lock(&inner);
    st.in_progress = false;
    if st.enabled && !st.period.is_zero() && st.pending.is_none() {
        schedule_next(&inner, &mut st);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
