//! Blocking synchronization primitives for fibers.
//!
//! All four primitives compose one building block: a FIFO [`WaitQueue`] of
//! blocked fibers. No OS-level locking appears anywhere — exactly one fiber
//! runs at a time per worker, so checking state and enqueueing is atomic by
//! construction, and the only rule to keep is that a `RefCell` borrow is
//! never held across a suspension point.
//!
//! Waking never forces a reschedule: an unblocked fiber merely becomes
//! runnable, and the waking fiber keeps the CPU until it next yields.
//!
//! Primitives are shared between fibers with `Rc`; fibers never migrate
//! threads, so no `Send`/`Sync` is involved.

use crate::fiber::{FiberId, State};
use crate::time::Timestamp;
use crate::worker::Worker;
use std::cell::RefCell;
use std::collections::VecDeque;

/// FIFO of fibers blocked on one synchronizer.
///
/// A fiber appears in at most one wait queue at a time; while queued here it
/// is absent from the worker's runnable queue.
#[derive(Default)]
struct WaitQueue {
    queue: VecDeque<FiberId>,
}

impl WaitQueue {
    fn new() -> WaitQueue {
        WaitQueue {
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, id: FiberId) {
        self.queue.push_back(id);
    }

    /// Wake the first live waiter: Waiting -> Ready, back on the runnable
    /// queue. Dead fibers found on the way are handed over for reclamation.
    fn wake_one(&mut self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        Worker::with_current(|worker| {
            while let Some(id) = self.queue.pop_front() {
                let dead = worker.fiber_state(id) == Some(State::Dead);
                worker.fiber_mut(id).wakeup();
                worker.add(id);
                if !dead {
                    return true;
                }
            }
            false
        })
    }

    fn wake_all(&mut self) {
        while self.wake_one() {}
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The id of the fiber about to block; fatal outside a fiber.
fn blocking_fiber() -> FiberId {
    match crate::worker::current_fiber_id() {
        Some(id) => id,
        None => fatal!("Blocking on a synchronizer outside a fiber"),
    }
}

/// Second half of blocking: the caller has already enqueued itself on a
/// wait queue (and dropped that borrow); take it off the runnable queue,
/// mark it sleeping until woken, and hand the CPU over.
fn block_current() {
    Worker::with_current(|worker| {
        let current = match worker.current_fiber() {
            Some(id) => id,
            None => fatal!("Blocking on a synchronizer outside a fiber"),
        };
        worker.release(current);
        worker.fiber_mut(current).nap(None);
        worker.schedule(None, Timestamp::now());
    });
}

/// Fiber-aware mutex.
///
/// Cooperative scheduling means the "race" between an unlock and the woken
/// waiter's next run cannot actually interleave; the locked flag still
/// matters because any number of fibers may attempt the lock before the
/// holder yields.
pub struct Mutex {
    inner: RefCell<MutexInner>,
}

struct MutexInner {
    locked: bool,
    queue: WaitQueue,
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: RefCell::new(MutexInner {
                locked: false,
                queue: WaitQueue::new(),
            }),
        }
    }

    pub fn lock(&self) {
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                if !inner.locked {
                    inner.locked = true;
                    log::trace!(target: "sync", "Mutex locked");
                    return;
                }
                let id = blocking_fiber();
                inner.queue.push(id);
            }
            block_current();
        }
    }

    pub fn try_lock(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.locked {
            return false;
        }
        inner.locked = true;
        true
    }

    /// Release the lock and wake the first waiter. Fatal when the mutex is
    /// not locked.
    pub fn unlock(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.locked {
            fatal!("Unlocking a mutex that is not locked");
        }
        inner.locked = false;
        log::trace!(target: "sync", "Mutex unlocked");
        inner.queue.wake_one();
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().locked
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn lock_guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Fiber-aware counting semaphore.
pub struct Semaphore {
    inner: RefCell<SemaphoreInner>,
}

struct SemaphoreInner {
    count: u32,
    queue: WaitQueue,
}

impl Semaphore {
    pub fn new(initial: u32) -> Semaphore {
        Semaphore {
            inner: RefCell::new(SemaphoreInner {
                count: initial,
                queue: WaitQueue::new(),
            }),
        }
    }

    /// Take `count` units, blocking — possibly repeatedly — until they have
    /// all accumulated. A single `release` may wake a multi-unit waiter
    /// that still cannot proceed; the loop, not a single check, is what
    /// makes this correct.
    pub fn acquire(&self, count: u32) {
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                if inner.count >= count {
                    inner.count -= count;
                    log::trace!(target: "sync", "Semaphore acquired {count}");
                    if inner.count > 0 {
                        // Leftover units may satisfy the next in line.
                        inner.queue.wake_one();
                    }
                    return;
                }
                let id = blocking_fiber();
                inner.queue.push(id);
            }
            block_current();
        }
    }

    /// Add `count` units (saturating) and wake one waiter.
    pub fn release(&self, count: u32) {
        let mut inner = self.inner.borrow_mut();
        inner.count = inner.count.saturating_add(count);
        log::trace!(target: "sync", "Semaphore released {count}");
        if inner.count > 0 {
            inner.queue.wake_one();
        }
    }

    pub fn value(&self) -> u32 {
        self.inner.borrow().count
    }
}

/// Fiber-aware signal, edge-triggered.
///
/// There is no memory: a `signal` with nobody waiting is lost. A caller
/// that must not miss a trigger has to be waiting before the trigger fires
/// — use a [`Future`] or [`Semaphore`] for level-triggered semantics.
pub struct Signal {
    queue: RefCell<WaitQueue>,
}

impl Signal {
    pub fn new() -> Signal {
        Signal {
            queue: RefCell::new(WaitQueue::new()),
        }
    }

    /// Block unconditionally until the next `signal`/`signal_all`.
    pub fn wait(&self) {
        {
            let id = blocking_fiber();
            self.queue.borrow_mut().push(id);
        }
        block_current();
    }

    /// Wake the first waiter, if any.
    pub fn signal(&self) {
        log::trace!(target: "sync", "Signal");
        self.queue.borrow_mut().wake_one();
    }

    /// Wake all current waiters.
    pub fn signal_all(&self) {
        log::trace!(target: "sync", "Signal all");
        self.queue.borrow_mut().wake_all();
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
}

impl Default for Signal {
    fn default() -> Signal {
        Signal::new()
    }
}

/// A set-once value fibers can block on.
///
/// Unlike [`Signal`], a future stays valid forever once set: waiters
/// arriving after `set` return immediately, any number of times.
pub struct Future<T> {
    inner: RefCell<FutureInner<T>>,
}

struct FutureInner<T> {
    value: Option<T>,
    queue: WaitQueue,
}

impl<T> Future<T> {
    pub fn new() -> Future<T> {
        Future {
            inner: RefCell::new(FutureInner {
                value: None,
                queue: WaitQueue::new(),
            }),
        }
    }

    pub fn valid(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// Store the value and wake all waiters. Single-use: setting a valid
    /// future is a contract violation and aborts.
    pub fn set(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        if inner.value.is_some() {
            fatal!("Future set twice");
        }
        inner.value = Some(value);
        log::trace!(target: "sync", "Future set");
        inner.queue.wake_all();
    }

    /// Block until the future is valid.
    pub fn wait(&self) {
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                if inner.value.is_some() {
                    return;
                }
                let id = blocking_fiber();
                inner.queue.push(id);
            }
            block_current();
        }
    }

    /// Block until valid, then run `f` on the stored value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.wait();
        let inner = self.inner.borrow();
        f(inner.value.as_ref().expect("future is valid after wait"))
    }

    /// Block until valid and return a copy of the value.
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }
}

impl<T> Default for Future<T> {
    fn default() -> Future<T> {
        Future::new()
    }
}
