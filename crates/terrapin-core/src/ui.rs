#![forbid(unsafe_code)]

//! UI-thread dispatcher seam.
//!
//! The engine never owns a UI thread; the windowing layer installs a
//! [`UiDispatcher`] once at startup and the engine marshals work through
//! it (UI-synchronized tick timers) or queries it (the deadlock guard in
//! blocking animation waits). When nothing is installed, the
//! [`InlineDispatcher`] fallback runs tasks on the calling thread and
//! reports that no thread is the UI thread.

use std::fmt;
use std::sync::{Arc, OnceLock};

/// A boxed unit of work handed to the UI thread.
pub type UiTask = Box<dyn FnOnce() + Send>;

/// Marshals work onto the windowing layer's UI thread.
pub trait UiDispatcher: Send + Sync {
    /// Queue a task on the UI thread and return immediately.
    fn run(&self, task: UiTask);

    /// Run a task on the UI thread and wait for it to finish.
    ///
    /// Implementations must degrade to a plain call when already on the
    /// UI thread instead of deadlocking against their own queue.
    fn run_blocking(&self, task: UiTask);

    /// Whether the calling thread is the UI thread.
    fn is_ui_thread(&self) -> bool;
}

/// Fallback dispatcher used when the windowing layer installs nothing:
/// tasks run inline on the calling thread, which is never considered the
/// UI thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl UiDispatcher for InlineDispatcher {
    fn run(&self, task: UiTask) {
        task();
    }

    fn run_blocking(&self, task: UiTask) {
        task();
    }

    fn is_ui_thread(&self) -> bool {
        false
    }
}

/// Error returned when a dispatcher is installed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherInstalled;

impl fmt::Display for DispatcherInstalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a UI dispatcher is already installed")
    }
}

impl std::error::Error for DispatcherInstalled {}

static DISPATCHER: OnceLock<Arc<dyn UiDispatcher>> = OnceLock::new();

/// Install the process-wide UI dispatcher. May succeed at most once.
pub fn install(dispatcher: Arc<dyn UiDispatcher>) -> Result<(), DispatcherInstalled> {
    DISPATCHER.set(dispatcher).map_err(|_| DispatcherInstalled)
}

/// The installed dispatcher, or the inline fallback.
#[must_use]
pub fn dispatcher() -> Arc<dyn UiDispatcher> {
    DISPATCHER
        .get_or_init(|| Arc::new(InlineDispatcher))
        .clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inline_dispatcher_runs_tasks_on_caller() {
        let counter = Arc::new(AtomicUsize::new(0));
        let d = InlineDispatcher;
        let c = Arc::clone(&counter);
        d.run(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = Arc::clone(&counter);
        d.run_blocking(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!d.is_ui_thread());
    }

    #[test]
    fn dispatcher_falls_back_to_inline() {
        // Whatever other tests installed, the fallback path must yield a
        // usable dispatcher.
        let d = dispatcher();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        d.run(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
    }
}
