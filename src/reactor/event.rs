//! Event masks, readiness flags, and registration flags.

use std::ops::BitOr;

/// What a registration monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask(u8);

impl Mask {
    /// No fd interest; used by self-activated events.
    pub const NONE: Mask = Mask(0);
    /// Fd readability.
    pub const READ: Mask = Mask(0b001);
    /// Fd writability.
    pub const WRITE: Mask = Mask(0b010);
    /// A pure timer with no fd.
    pub const TIMER: Mask = Mask(0b100);

    /// Returns true if read interest is set.
    #[must_use]
    pub const fn is_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Returns true if write interest is set.
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Returns true if this is a timer registration.
    #[must_use]
    pub const fn is_timer(self) -> bool {
        self.0 & Self::TIMER.0 != 0
    }
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

/// Why a callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(u8);

impl Ready {
    /// The fd became readable.
    pub const READ: Ready = Ready(0b0001);
    /// The fd became writable.
    pub const WRITE: Ready = Ready(0b0010);
    /// The registration's deadline elapsed.
    pub const TIMEOUT: Ready = Ready(0b0100);
    /// The event was force-fired via `activate`.
    pub const ACTIVATED: Ready = Ready(0b1000);

    /// Returns true if the fd was readable.
    #[must_use]
    pub const fn is_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Returns true if the fd was writable.
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Returns true if the deadline elapsed.
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        self.0 & Self::TIMEOUT.0 != 0
    }

    /// Returns true if the event was activated explicitly.
    #[must_use]
    pub const fn is_activated(self) -> bool {
        self.0 & Self::ACTIVATED.0 != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// Registration behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// No special behavior: one-shot, keeps the loop alive while pending.
    pub const NONE: Flags = Flags(0);
    /// The event stays armed after firing instead of disarming.
    pub const PERSIST: Flags = Flags(0b01);
    /// A pending registration with this flag does not by itself keep
    /// [`Reactor::run`](super::Reactor::run) alive.
    pub const NO_SELF_REF: Flags = Flags(0b10);

    /// Returns true if the event re-arms itself after firing.
    #[must_use]
    pub const fn is_persist(self) -> bool {
        self.0 & Self::PERSIST.0 != 0
    }

    /// Returns true if the event does not keep the loop alive.
    #[must_use]
    pub const fn is_no_self_ref(self) -> bool {
        self.0 & Self::NO_SELF_REF.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}
