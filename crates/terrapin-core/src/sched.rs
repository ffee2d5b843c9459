#![forbid(unsafe_code)]

//! Shared background scheduler.
//!
//! One worker thread drains a due-time min-heap of boxed tasks. The
//! scheduler is deliberately minimal: it exists to *time* engine work
//! (animation progress, tick timers, key-repeat scans), not to provide
//! throughput. Callers that need parallelism do not get it here.
//!
//! # Invariants
//!
//! 1. Tasks run on the worker thread, never on the submitting thread.
//! 2. A cancelled handle never fires again (a firing already in progress
//!    completes normally).
//! 3. Repeating tasks are rescheduled relative to the *completion* of the
//!    previous run, so a slow task delays itself without compounding.
//! 4. A panicking task is caught and logged; the worker thread survives.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Pending tasks exceed the cap | Submission fails with [`ScheduleError::QueueFull`] |
//! | Submission after [`shutdown`](Scheduler::shutdown) | [`ScheduleError::ShutDown`] |
//! | Zero repeat period | Clamped to 1 ms to avoid a busy loop |

use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use web_time::Instant;

/// Maximum number of pending entries before submission is rejected.
pub const MAX_PENDING: usize = 4096;

/// Error returned when the scheduler cannot accept a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// The pending-task queue is at capacity.
    QueueFull,
    /// The scheduler has been shut down.
    ShutDown,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "scheduler queue is full"),
            Self::ShutDown => write!(f, "scheduler has been shut down"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Cancellation handle for a scheduled task.
///
/// Cancellation is idempotent and always safe: a firing already in
/// progress completes normally, and everything after it is suppressed.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Cancel the task. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum TaskBody {
    Once(Box<dyn FnOnce() + Send>),
    Repeating {
        run: Arc<dyn Fn() + Send + Sync>,
        period: Duration,
    },
}

struct Entry {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    body: TaskBody,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap (a max-heap) pops the earliest due time.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedState {
    entries: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

struct SchedInner {
    state: Mutex<SchedState>,
    wakeup: Condvar,
}

/// Handle to a scheduler instance. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

impl Scheduler {
    /// Create a scheduler with its own worker thread.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(SchedInner {
            state: Mutex::new(SchedState {
                entries: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name("terrapin-sched".into())
            .spawn(move || worker_loop(&worker))
            .expect("failed to spawn scheduler worker");
        Self { inner }
    }

    /// The process-wide shared scheduler, created on first use.
    pub fn shared() -> &'static Scheduler {
        static SHARED: OnceLock<Scheduler> = OnceLock::new();
        SHARED.get_or_init(Scheduler::new)
    }

    /// Run a task on the worker as soon as possible.
    pub fn run_now(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<TaskHandle, ScheduleError> {
        self.run_after(Duration::ZERO, task)
    }

    /// Run a task once after `delay`.
    pub fn run_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<TaskHandle, ScheduleError> {
        self.submit(Instant::now() + delay, TaskBody::Once(Box::new(task)))
    }

    /// Run a task after `delay`, then repeatedly every `period`.
    ///
    /// Each repetition is scheduled `period` after the previous run
    /// *completes*; a zero period is clamped to 1 ms.
    pub fn run_repeating(
        &self,
        delay: Duration,
        period: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Result<TaskHandle, ScheduleError> {
        let period = period.max(Duration::from_millis(1));
        self.submit(
            Instant::now() + delay,
            TaskBody::Repeating {
                run: Arc::new(task),
                period,
            },
        )
    }

    /// Number of entries currently waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Stop the worker thread and reject all further submissions.
    ///
    /// Pending entries are dropped without running. Used by tests; the
    /// shared scheduler is never shut down.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shutdown = true;
        state.entries.clear();
        self.inner.wakeup.notify_all();
    }

    fn submit(&self, due: Instant, body: TaskBody) -> Result<TaskHandle, ScheduleError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(ScheduleError::ShutDown);
        }
        if state.entries.len() >= MAX_PENDING {
            return Err(ScheduleError::QueueFull);
        }
        state.seq += 1;
        let seq = state.seq;
        state.entries.push(Entry {
            due,
            seq,
            cancelled: Arc::clone(&cancelled),
            body,
        });
        self.inner.wakeup.notify_all();
        Ok(TaskHandle { cancelled })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(inner: &Arc<SchedInner>) {
    let mut state = inner
        .state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        // Two-step peek-then-pop keeps the heap borrow disjoint.
        let next_due = state.entries.peek().map(|entry| entry.due);
        let ready = match next_due {
            None => {
                state = inner
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }
            Some(due) if due > now => {
                let wait = due - now;
                state = inner
                    .wakeup
                    .wait_timeout(state, wait)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                continue;
            }
            Some(_) => state.entries.pop().expect("peeked entry vanished"),
        };
        drop(state);

        let Entry {
            cancelled, body, ..
        } = ready;
        let resched = if cancelled.load(Ordering::SeqCst) {
            None
        } else {
            match body {
                TaskBody::Once(task) => {
                    run_caught(task);
                    None
                }
                TaskBody::Repeating { run, period } => {
                    let again = Arc::clone(&run);
                    run_caught(move || run());
                    Some((again, period))
                }
            }
        };

        state = inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((run, period)) = resched
            && !cancelled.load(Ordering::SeqCst)
            && !state.shutdown
        {
            state.seq += 1;
            let seq = state.seq;
            state.entries.push(Entry {
                due: Instant::now() + period,
                seq,
                cancelled,
                body: TaskBody::Repeating { run, period },
            });
        }
    }
}

fn run_caught(task: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::warn!(
            target: "terrapin.sched",
            "scheduled task panicked; worker continues"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const LONG: Duration = Duration::from_secs(2);

    #[test]
    fn run_now_fires() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        sched.run_now(move || tx.send(1).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(LONG).unwrap(), 1);
        sched.shutdown();
    }

    #[test]
    fn run_after_fires_once() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        sched
            .run_after(Duration::from_millis(10), move || tx.send(7).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(LONG).unwrap(), 7);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        sched.shutdown();
    }

    #[test]
    fn cancelled_task_never_fires() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = sched
            .run_after(Duration::from_millis(100), move || tx.send(()).unwrap())
            .unwrap();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        sched.shutdown();
    }

    #[test]
    fn repeating_task_fires_repeatedly() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = sched
            .run_repeating(Duration::ZERO, Duration::from_millis(10), move || {
                let _ = tx.send(());
            })
            .unwrap();
        for _ in 0..3 {
            rx.recv_timeout(LONG).unwrap();
        }
        handle.cancel();
        sched.shutdown();
    }

    #[test]
    fn cancel_stops_repeating_task() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = sched
            .run_repeating(Duration::ZERO, Duration::from_millis(10), move || {
                let _ = tx.send(());
            })
            .unwrap();
        rx.recv_timeout(LONG).unwrap();
        handle.cancel();
        // Drain anything in flight, then expect silence.
        while rx.recv_timeout(Duration::from_millis(100)).is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        sched.shutdown();
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let sched = Scheduler::new();
        let far = Duration::from_secs(3600);
        for _ in 0..MAX_PENDING {
            sched.run_after(far, || {}).unwrap();
        }
        assert_eq!(
            sched.run_after(far, || {}).unwrap_err(),
            ScheduleError::QueueFull
        );
        sched.shutdown();
    }

    #[test]
    fn submission_after_shutdown_fails() {
        let sched = Scheduler::new();
        sched.shutdown();
        assert_eq!(sched.run_now(|| {}).unwrap_err(), ScheduleError::ShutDown);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        sched.run_now(|| panic!("boom")).unwrap();
        sched.run_now(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(LONG).unwrap();
        sched.shutdown();
    }

    #[test]
    fn earlier_due_time_runs_first() {
        let sched = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        sched
            .run_after(Duration::from_millis(80), move || tx2.send(2).unwrap())
            .unwrap();
        sched
            .run_after(Duration::from_millis(10), move || tx.send(1).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(LONG).unwrap(), 1);
        assert_eq!(rx.recv_timeout(LONG).unwrap(), 2);
        sched.shutdown();
    }

    #[test]
    fn error_display() {
        assert!(ScheduleError::QueueFull.to_string().contains("full"));
        assert!(ScheduleError::ShutDown.to_string().contains("shut down"));
    }
}
