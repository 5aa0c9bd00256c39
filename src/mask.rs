//! Event mask: a small bitset over `{READ, WRITE, ERROR}`.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Interest / readiness bitset. `ERROR` is implicitly added to every registration by
/// [`crate::handler::HandlerTable::add`] — callers never need to OR it in themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(0b001);
    pub const WRITE: EventMask = EventMask(0b010);
    /// Hangup or error condition. Implicitly registered with every handler.
    pub const ERROR: EventMask = EventMask(0b100);

    #[must_use]
    pub const fn contains(self, other: EventMask) -> bool { self.0 & other.0 == other.0 }

    #[must_use]
    pub const fn is_empty(self) -> bool { self.0 == 0 }

    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> EventMask { EventMask(bits & 0b111) }
}

impl BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask { EventMask(self.0 | rhs.0) }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) { self.0 |= rhs.0; }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if self.contains(EventMask::READ) {
            parts.push("READ");
        }
        if self.contains(EventMask::WRITE) {
            parts.push("WRITE");
        }
        if self.contains(EventMask::ERROR) {
            parts.push("ERROR");
        }
        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}
