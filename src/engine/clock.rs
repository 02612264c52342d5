//! Virtual time in integer microsecond ticks.
//!
//! `Instant` and `Duration` mirror the arithmetic surface the rest of the
//! code needs (millisecond constructors and accessors, saturating
//! differences) without ever touching the host clock. The simulation's
//! notion of "now" lives in the event scheduler; these types are plain
//! values.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Virtual clock resolution: one tick is one microsecond.
pub const TICK_HZ: u64 = 1_000_000;

/// A point on the virtual timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    ticks: u64,
}

/// A span of virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    ticks: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { ticks: 0 };

    pub const fn from_millis(ms: u64) -> Self {
        Instant {
            ticks: ms * (TICK_HZ / 1_000),
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Instant {
            ticks: secs * TICK_HZ,
        }
    }

    pub const fn as_micros(&self) -> u64 {
        self.ticks
    }

    pub const fn as_millis(&self) -> u64 {
        self.ticks / (TICK_HZ / 1_000)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.ticks as f64 / TICK_HZ as f64
    }

    /// Time elapsed since `earlier`, saturating to zero if `earlier` is in
    /// the future.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration {
            ticks: self.ticks.saturating_sub(earlier.ticks),
        }
    }
}

impl Duration {
    pub const ZERO: Duration = Duration { ticks: 0 };

    pub const fn from_millis(ms: u64) -> Self {
        Duration {
            ticks: ms * (TICK_HZ / 1_000),
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Duration {
            ticks: secs * TICK_HZ,
        }
    }

    pub const fn as_millis(&self) -> u64 {
        self.ticks / (TICK_HZ / 1_000)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.ticks as f64 / TICK_HZ as f64
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.ticks += rhs.ticks;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.duration_since(rhs)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}
