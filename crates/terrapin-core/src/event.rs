#![forbid(unsafe_code)]

//! Canonical input event types.
//!
//! These are the events the scene graph routes: mouse events carry a
//! position in the coordinate space of the pane they are being delivered
//! to (the dispatcher re-maps the position at every tree level), key
//! events are broadcast untransformed.
//!
//! # Design Notes
//!
//! - Mouse positions are `f64` points; panes may be rotated, so integer
//!   cell coordinates would lose the sub-unit precision the inverse
//!   transform produces.
//! - `KeyEventKind::Repeat` is used both for platform auto-repeat that is
//!   passed through and for repeats synthesized by the engine's own
//!   key-repeat machinery.
//! - `Modifiers` and `MouseButtons` use bitflags for cheap set operations.

use bitflags::bitflags;
use kurbo::Point;

/// A keyboard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// The key code.
    pub code: KeyCode,

    /// Modifier keys held during the event.
    pub modifiers: Modifiers,

    /// Press, repeat, or release.
    pub kind: KeyEventKind,
}

impl KeyEvent {
    /// Create a new key press event with no modifiers.
    #[must_use]
    pub const fn new(code: KeyCode) -> Self {
        Self {
            code,
            modifiers: Modifiers::NONE,
            kind: KeyEventKind::Press,
        }
    }

    /// Replace the modifiers.
    #[must_use]
    pub const fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Replace the event kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: KeyEventKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    /// A regular character key.
    Char(char),

    /// Enter/Return key.
    Enter,

    /// Escape key.
    Escape,

    /// Backspace key.
    Backspace,

    /// Tab key.
    Tab,

    /// Delete key.
    Delete,

    /// Home key.
    Home,

    /// End key.
    End,

    /// Page Up key.
    PageUp,

    /// Page Down key.
    PageDown,

    /// Up arrow key.
    Up,

    /// Down arrow key.
    Down,

    /// Left arrow key.
    Left,

    /// Right arrow key.
    Right,

    /// Function key (F1-F24).
    F(u8),
}

/// The type of key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyEventKind {
    /// Key was pressed.
    #[default]
    Press,

    /// Key is being held (repeat event).
    Repeat,

    /// Key was released.
    Release,
}

bitflags! {
    /// Modifier keys that can be held during an event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers: u8 {
        /// No modifiers.
        const NONE  = 0b0000;
        /// Shift key.
        const SHIFT = 0b0001;
        /// Alt/Option key.
        const ALT   = 0b0010;
        /// Control key.
        const CTRL  = 0b0100;
        /// Super/Meta/Command key.
        const SUPER = 0b1000;
    }
}

impl Default for Modifiers {
    fn default() -> Self {
        Self::NONE
    }
}

/// A mouse event, positioned in the receiving pane's local coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouseEvent {
    /// The type of mouse event.
    pub kind: MouseEventKind,

    /// Position in the receiving pane's coordinate space.
    pub position: Point,

    /// Modifier keys held during the event.
    pub modifiers: Modifiers,
}

impl MouseEvent {
    /// Create a new mouse event with no modifiers.
    #[must_use]
    pub const fn new(kind: MouseEventKind, position: Point) -> Self {
        Self {
            kind,
            position,
            modifiers: Modifiers::NONE,
        }
    }

    /// Replace the modifiers.
    #[must_use]
    pub const fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// The same event re-positioned (used when mapping into a child pane).
    #[must_use]
    pub const fn at(mut self, position: Point) -> Self {
        self.position = position;
        self
    }

    /// The button carried by a press, release, or drag event.
    #[must_use]
    pub const fn button(&self) -> Option<MouseButton> {
        match self.kind {
            MouseEventKind::Press(b) | MouseEventKind::Release(b) | MouseEventKind::Drag(b) => {
                Some(b)
            }
            MouseEventKind::Move => None,
        }
    }
}

/// The type of mouse event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseEventKind {
    /// Button pressed down.
    Press(MouseButton),

    /// Button released.
    Release(MouseButton),

    /// Pointer moved while the given button is held.
    Drag(MouseButton),

    /// Pointer moved with no button held.
    Move,
}

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    /// Left mouse button.
    Left,

    /// Right mouse button.
    Right,

    /// Middle mouse button.
    Middle,
}

bitflags! {
    /// A set of mouse buttons, used to track which buttons a pane holds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MouseButtons: u8 {
        /// Left mouse button.
        const LEFT   = 0b001;
        /// Right mouse button.
        const RIGHT  = 0b010;
        /// Middle mouse button.
        const MIDDLE = 0b100;
    }
}

impl From<MouseButton> for MouseButtons {
    fn from(button: MouseButton) -> Self {
        match button {
            MouseButton::Left => MouseButtons::LEFT,
            MouseButton::Right => MouseButtons::RIGHT,
            MouseButton::Middle => MouseButtons::MIDDLE,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
