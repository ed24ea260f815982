//! Build-time tuning constants.

use core::time::Duration;

/// Default stack size for a new fiber, excluding guard pages.
pub const DEFAULT_STACK_SIZE: usize = 0x20000;

/// Minimum time slice before a voluntary [`yield_now`](crate::yield_now)
/// actually yields.
///
/// A fiber that yields more often than this keeps running; the call becomes
/// a no-op. This is the fairness floor: no matter how frequently another
/// fiber offers the CPU, every fiber that yields regularly still gets at
/// least this much uninterrupted execution per dispatch.
pub const MIN_TIMESLICE: Duration = Duration::from_micros(100);

/// Guard both ends of every fiber stack with an inaccessible page, so an
/// overflow faults instead of corrupting an adjacent allocation. Only
/// effective on targets with page protection; ignored elsewhere.
pub const ENABLE_STACK_GUARD: bool = true;

/// Poll interval granted to the readiness poller when other fibers are still
/// runnable and the waiter must not block.
pub const NONBLOCKING_POLL: i32 = 0;
