//! Monotonic timestamps relative to a process-wide start reference.
//!
//! All scheduling arithmetic uses offsets from one monotonic instant taken
//! when the process first touches the runtime. Wall-clock time is never
//! consulted, so timestamps are immune to clock adjustments and cheap to
//! compare and order.

use core::ops::{Add, AddAssign, Sub};
use core::time::Duration;
use std::time::Instant;

static START: spin::Once<Instant> = spin::Once::new();

/// Initialize the process-wide start-time reference.
///
/// Called implicitly by [`Timestamp::now`] and by `Worker::new`; calling it
/// earlier (e.g. at the top of `main`) pins the epoch before any fiber work
/// begins. Idempotent.
pub fn init() {
    START.call_once(Instant::now);
}

fn start() -> Instant {
    *START.call_once(Instant::now)
}

/// A point in time on the process-local monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub fn now() -> Timestamp {
        Timestamp(start().elapsed())
    }

    /// Offset from the process start reference.
    pub fn since_start(self) -> Duration {
        self.0
    }

    /// Time remaining until `self`, or zero if it already passed.
    pub fn remaining(self, now: Timestamp) -> Duration {
        self.0.saturating_sub(now.0)
    }

    pub fn has_passed(self) -> bool {
        self <= Timestamp::now()
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    /// Saturating: an earlier minus a later timestamp is zero.
    fn sub(self, rhs: Timestamp) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}
