#![forbid(unsafe_code)]

//! Key-repeat synthesis.
//!
//! Each pane owns a repeater that tracks held keys and, when a repeat
//! period is configured, emits synthetic `Repeat` key events on a
//! scheduler scan task — independent of whatever auto-repeat the platform
//! does. Platform auto-repeat presses for an already-held key are
//! swallowed while synthesis is active (the engine generates its own
//! cadence) and passed through as repeats when it is not.
//!
//! Invariant: a key code is in the held map iff a press was accepted and
//! no matching release has been processed yet.

use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use terrapin_core::event::{KeyCode, KeyEvent, KeyEventKind, Modifiers};
use terrapin_core::sched::TaskHandle;
use web_time::Instant;

use crate::engine::{Engine, World};
use crate::pane;
use crate::store::PaneId;

/// Interval of the held-key scan task.
pub(crate) const SCAN_TICK: Duration = Duration::from_millis(10);

pub(crate) struct HeldKey {
    last_fire: Instant,
    modifiers: Modifiers,
}

pub(crate) struct KeyRepeaterState {
    /// Global repeat period; zero leaves repeating to the platform.
    pub(crate) period: Duration,
    /// Per-key overrides of the global period.
    pub(crate) overrides: AHashMap<KeyCode, Duration>,
    held: AHashMap<KeyCode, HeldKey>,
    scan: Option<TaskHandle>,
}

impl Default for KeyRepeaterState {
    fn default() -> Self {
        Self {
            period: Duration::ZERO,
            overrides: AHashMap::new(),
            held: AHashMap::new(),
            scan: None,
        }
    }
}

impl KeyRepeaterState {
    pub(crate) fn effective_period(&self, code: KeyCode) -> Duration {
        self.overrides.get(&code).copied().unwrap_or(self.period)
    }

    pub(crate) fn is_held(&self, code: KeyCode) -> bool {
        self.held.contains_key(&code)
    }
}

impl Drop for KeyRepeaterState {
    fn drop(&mut self) {
        if let Some(handle) = self.scan.take() {
            handle.cancel();
        }
    }
}

/// Track a key event through the pane's repeater.
///
/// Returns the event to broadcast into the subtree, or `None` when the
/// event is swallowed (platform auto-repeat while synthesis is active).
pub(crate) fn process(
    engine: &Arc<Engine>,
    w: &mut World,
    pane: PaneId,
    event: KeyEvent,
) -> Option<KeyEvent> {
    match event.kind {
        KeyEventKind::Press | KeyEventKind::Repeat => {
            let (already_held, synthesizing) = {
                let st = w.pane_mut(pane).ok()?;
                let repeat = &st.repeat;
                (
                    repeat.is_held(event.code),
                    !repeat.effective_period(event.code).is_zero(),
                )
            };
            if already_held {
                // Platform auto-repeat for a key we are tracking.
                return if synthesizing {
                    None
                } else {
                    Some(event.with_kind(KeyEventKind::Repeat))
                };
            }
            {
                let st = w.pane_mut(pane).ok()?;
                st.repeat.held.insert(
                    event.code,
                    HeldKey {
                        last_fire: Instant::now(),
                        modifiers: event.modifiers,
                    },
                );
            }
            if synthesizing {
                ensure_scan(engine, w, pane);
            }
            Some(event.with_kind(KeyEventKind::Press))
        }
        KeyEventKind::Release => {
            let st = w.pane_mut(pane).ok()?;
            st.repeat.held.remove(&event.code);
            if st.repeat.held.is_empty()
                && let Some(handle) = st.repeat.scan.take()
            {
                handle.cancel();
            }
            Some(event)
        }
    }
}

fn ensure_scan(engine: &Arc<Engine>, w: &mut World, pane: PaneId) {
    let Ok(st) = w.pane_mut(pane) else { return };
    if st.repeat.scan.is_some() {
        return;
    }
    let weak = Arc::downgrade(engine);
    match engine
        .scheduler()
        .run_repeating(SCAN_TICK, SCAN_TICK, move || scan_tick(&weak, pane))
    {
        Ok(handle) => st.repeat.scan = Some(handle),
        Err(err) => {
            tracing::warn!(target: "terrapin.keys", %err, "could not start key-repeat scan");
        }
    }
}

fn scan_tick(weak: &Weak<Engine>, pane: PaneId) {
    let Some(engine) = weak.upgrade() else {
        return;
    };
    let mut w = engine.lock();
    let now = Instant::now();
    let mut due = Vec::new();
    {
        let Ok(st) = w.pane_mut(pane) else { return };
        let period = st.repeat.period;
        let overrides = st.repeat.overrides.clone();
        for (code, held) in st.repeat.held.iter_mut() {
            let p = overrides.get(code).copied().unwrap_or(period);
            if !p.is_zero() && now.duration_since(held.last_fire) >= p {
                held.last_fire = now;
                due.push(
                    KeyEvent::new(*code)
                        .with_modifiers(held.modifiers)
                        .with_kind(KeyEventKind::Repeat),
                );
            }
        }
    }
    for event in due {
        pane::broadcast_key(&mut w, pane, event);
    }
}
