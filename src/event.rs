//! Logical readiness events delivered by the event loop.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub, SubAssign};

/// Set of logical events a dispatcher is interested in or has received.
///
/// The loop translates raw OS readiness into this vocabulary before invoking
/// dispatcher callbacks. `ACCEPT` and `CONNECT` are never requested together
/// by the same socket (a socket is either listening or connecting), and a
/// delivered `CLOSE` clears every other enabled bit.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(1 << 0);
    pub const WRITE: EventSet = EventSet(1 << 1);
    pub const CONNECT: EventSet = EventSet(1 << 2);
    pub const ACCEPT: EventSet = EventSet(1 << 3);
    pub const CLOSE: EventSet = EventSet(1 << 4);

    /// Returns `true` if every bit of `other` is present in `self`.
    #[inline]
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if `self` and `other` share at least one bit.
    #[inline]
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    #[inline]
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventSet {
    type Output = EventSet;

    #[inline]
    fn bitand(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & rhs.0)
    }
}

impl Sub for EventSet {
    type Output = EventSet;

    #[inline]
    fn sub(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & !rhs.0)
    }
}

impl SubAssign for EventSet {
    #[inline]
    fn sub_assign(&mut self, rhs: EventSet) {
        self.0 &= !rhs.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut emit = |name: &str, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{name}")
        };
        if self.is_empty() {
            return write!(f, "NONE");
        }
        if self.contains(EventSet::READ) {
            emit("READ", f)?;
        }
        if self.contains(EventSet::WRITE) {
            emit("WRITE", f)?;
        }
        if self.contains(EventSet::CONNECT) {
            emit("CONNECT", f)?;
        }
        if self.contains(EventSet::ACCEPT) {
            emit("ACCEPT", f)?;
        }
        if self.contains(EventSet::CLOSE) {
            emit("CLOSE", f)?;
        }
        Ok(())
    }
}
