#![forbid(unsafe_code)]

//! Fraction-driven animator composition.
//!
//! An [`Animator`] maps an animation progress fraction in `[0, 1]` onto a
//! side effect against a bound context (for the engine, the scene world).
//! Animators must be idempotent per fraction: calling `animate` twice with
//! the same value must leave the context in the same state, because
//! composite animators replay earlier segments at fraction 1.0 on every
//! progress step.
//!
//! [`SequenceAnimator`] plays weighted sub-animators back to back, giving
//! each a share of the global fraction proportional to its weight.
//! [`CompositeAnimator`] drives several animators in parallel with the
//! same fraction.
//!
//! # Invariants
//!
//! 1. For monotonically increasing fractions, the current-segment index of
//!    a sequence is non-decreasing.
//! 2. A zero-total-weight sequence collapses to "jump to the end": any
//!    fraction above 0 maps to the last segment at local fraction 1.
//! 3. `animate(f)` replays every segment *before* the current one at
//!    fraction 1.0 first, so visual work done by passed segments (drawn
//!    lines) is always fully present.

/// Maps a progress fraction onto a side effect against `C`.
pub trait Animator<C>: Send + Sync {
    /// Apply the state for `fraction`, clamped by callers into `[0, 1]`.
    fn animate(&self, cx: &mut C, fraction: f64);
}

/// An animator tagged with its relative duration contribution.
///
/// Weights are non-negative integers — rounded distances for moves,
/// rounded angular deltas for turns.
pub struct Weighted<C> {
    animator: Box<dyn Animator<C>>,
    weight: u32,
}

impl<C> Weighted<C> {
    /// Wrap an animator with its weight.
    #[must_use]
    pub fn new(animator: impl Animator<C> + 'static, weight: u32) -> Self {
        Self {
            animator: Box::new(animator),
            weight,
        }
    }

    /// The weight of this segment.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The wrapped animator.
    #[must_use]
    pub fn animator(&self) -> &dyn Animator<C> {
        &*self.animator
    }
}

impl<C> std::fmt::Debug for Weighted<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Weighted")
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Plays weighted sub-animators back to back.
pub struct SequenceAnimator<C> {
    segments: Vec<Weighted<C>>,
    total: u64,
}

impl<C> SequenceAnimator<C> {
    /// Build a sequence from weighted segments.
    ///
    /// An empty sequence is a no-op animator.
    #[must_use]
    pub fn new(segments: Vec<Weighted<C>>) -> Self {
        let total = segments.iter().map(|s| u64::from(s.weight)).sum();
        Self { segments, total }
    }

    /// Sum of all segment weights.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.total
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the sequence has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The current segment index and its local fraction for a global
    /// fraction.
    ///
    /// Returns `None` for an empty sequence. With zero total weight the
    /// sequence is degenerate: fraction 0 maps to segment 0 at local
    /// fraction 0, anything above 0 maps to the last segment at local
    /// fraction 1.
    #[must_use]
    pub fn segment_for_fraction(&self, fraction: f64) -> Option<(usize, f64)> {
        if self.segments.is_empty() {
            return None;
        }
        let f = fraction.clamp(0.0, 1.0);
        let last = self.segments.len() - 1;
        if self.total == 0 {
            return Some(if f > 0.0 { (last, 1.0) } else { (0, 0.0) });
        }
        let total = self.total as f64;
        let mut acc = 0.0;
        for (i, seg) in self.segments.iter().enumerate() {
            let share = f64::from(seg.weight) / total;
            if f < acc + share || i == last {
                let local = if share == 0.0 {
                    1.0
                } else {
                    ((f - acc) / share).clamp(0.0, 1.0)
                };
                return Some((i, local));
            }
            acc += share;
        }
        unreachable!("loop always returns at the last segment");
    }
}

impl<C> Animator<C> for SequenceAnimator<C> {
    fn animate(&self, cx: &mut C, fraction: f64) {
        let Some((index, local)) = self.segment_for_fraction(fraction) else {
            return;
        };
        // Segments already passed are replayed at their final state before
        // the current one runs; drawn-line overlays depend on this order.
        for seg in &self.segments[..index] {
            seg.animator.animate(cx, 1.0);
        }
        self.segments[index].animator.animate(cx, local);
    }
}

impl<C> std::fmt::Debug for SequenceAnimator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAnimator")
            .field("segments", &self.segments.len())
            .field("total_weight", &self.total)
            .finish()
    }
}

/// Drives several animators in parallel with the same fraction.
pub struct CompositeAnimator<C> {
    parts: Vec<Box<dyn Animator<C>>>,
}

impl<C> CompositeAnimator<C> {
    /// Build a composite from its parts.
    #[must_use]
    pub fn new(parts: Vec<Box<dyn Animator<C>>>) -> Self {
        Self { parts }
    }

    /// Number of parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the composite has no parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<C> Animator<C> for CompositeAnimator<C> {
    fn animate(&self, cx: &mut C, fraction: f64) {
        for part in &self.parts {
            part.animate(cx, fraction);
        }
    }
}

impl<C> std::fmt::Debug for CompositeAnimator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeAnimator")
            .field("parts", &self.parts.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
