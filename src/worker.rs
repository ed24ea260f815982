//! The scheduler: one `Worker` per OS thread owns a set of fibers and
//! dispatches them.
//!
//! Fibers live in an id-keyed arena of boxed fibers (stable addresses for
//! the context layer); the runnable and suspended queues hold ids only. The
//! runnable queue is FIFO with rotate-to-back on every dispatch, so fibers
//! that neither sleep nor block run round-robin. One stackless pseudo-fiber
//! stands for the worker's own native stack and is the switch target
//! whenever no application fiber can run.
//!
//! Worker-internal state needs no locking: only one fiber executes at a
//! time, and fibers never migrate between workers.

use crate::error::{FiberError, FiberResult};
use crate::fiber::{Fiber, FiberBuilder, FiberId, RunResult, State};
use crate::sync::Future;
use crate::time::{self, Timestamp};
use crate::waiter::{self, Waiter};
use core::time::Duration;
use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

std::thread_local! {
    static CURRENT_WORKER: Cell<*mut Worker> = const { Cell::new(core::ptr::null_mut()) };
}

/// Registers the worker as the thread's current one for the duration of
/// `run()`, so fibers can reach their scheduler through one accessor.
struct CurrentGuard;

impl CurrentGuard {
    fn register(worker: &mut Worker) -> CurrentGuard {
        CURRENT_WORKER.with(|c| {
            if !c.get().is_null() {
                fatal!("Only one worker may run per thread");
            }
            c.set(worker as *mut Worker);
        });
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|c| c.set(core::ptr::null_mut()));
    }
}

pub struct Worker {
    fibers: BTreeMap<FiberId, Box<Fiber>>,
    runnable: VecDeque<FiberId>,
    suspended: Vec<FiberId>,
    current: Option<FiberId>,
    worker_fiber: Box<Fiber>,
    pub(crate) waiter: Waiter,
    /// Deadline of a bounded `run()` call.
    end: Option<Timestamp>,
}

impl Worker {
    pub fn new() -> Worker {
        time::init();

        let mut worker_fiber = Box::new(Fiber::with(
            Box::new(|| fatal!("The worker pseudo-fiber must never execute")),
            Some("worker".to_string()),
            0, // reuses the thread's own stack
        ));
        if let Err(e) = worker_fiber.init(Timestamp::now()) {
            fatal!("Cannot create worker context: {e}");
        }

        let mut worker = Worker {
            fibers: BTreeMap::new(),
            runnable: VecDeque::new(),
            suspended: Vec::new(),
            current: None,
            worker_fiber,
            waiter: Waiter::new(),
            end: None,
        };

        if let Err(e) = waiter::spawn_waiter(&mut worker) {
            fatal!("Cannot create waiter fiber: {e}");
        }

        log::debug!(target: "worker", "Created");
        worker
    }

    /// Run `f` against the thread's active worker. Fatal outside a
    /// `Worker::run` call; this is the single point where fibers reach
    /// their scheduler.
    pub(crate) fn with_current<R>(f: impl FnOnce(&mut Worker) -> R) -> R {
        let ptr = CURRENT_WORKER.with(|c| c.get());
        if ptr.is_null() {
            fatal!("Not within a worker context");
        }
        // SAFETY: the pointer was registered by the running worker and stays
        // valid for the whole run() call; cooperative scheduling guarantees
        // no concurrent access from this thread.
        f(unsafe { &mut *ptr })
    }

    /// Like [`with_current`](Worker::with_current), but `None` outside a
    /// worker.
    pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut Worker) -> R) -> Option<R> {
        let ptr = CURRENT_WORKER.with(|c| c.get());
        if ptr.is_null() {
            return None;
        }
        // SAFETY: see with_current.
        Some(f(unsafe { &mut *ptr }))
    }

    /// Spawn a fiber with default attributes; see [`FiberBuilder`] for the
    /// configurable variant. A stack allocation failure is returned to the
    /// caller, which may drop the unit of work or retry later.
    pub fn spawn<F>(&mut self, entry: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        FiberBuilder::new().spawn(self, entry)
    }

    /// Spawn a fiber and couple its return value to a [`Future`].
    pub fn spawn_future<T, F>(&mut self, entry: F) -> FiberResult<Rc<Future<T>>>
    where
        T: 'static,
        F: FnOnce() -> T + 'static,
    {
        let future = Rc::new(Future::new());
        let result = future.clone();
        self.spawn(move || result.set(entry()))?;
        Ok(future)
    }

    pub(crate) fn spawn_fiber(&mut self, fiber: Fiber) -> FiberResult<FiberId> {
        time::init();
        let id = fiber.id();
        let mut fiber = Box::new(fiber);
        // Eager init: the creator learns about stack exhaustion, not the
        // scheduler.
        if fiber.state() == State::New {
            fiber.init(Timestamp::now())?;
        }
        self.fibers.insert(id, fiber);
        self.add(id);
        Ok(id)
    }

    pub fn current_fiber(&self) -> Option<FiberId> {
        self.current
    }

    /// Replace the readiness-event source the waiter polls. The default is
    /// the `poll(2)`-backed [`FdPoller`](crate::poller::FdPoller); embedders
    /// with their own event multiplexer install it here before `run()`.
    pub fn set_poller(&mut self, poller: Box<dyn crate::poller::Poller>) {
        self.waiter.set_poller(poller);
    }

    pub fn fiber_state(&self, id: FiberId) -> Option<State> {
        if id == self.worker_fiber.id() {
            return Some(self.worker_fiber.state());
        }
        self.fibers.get(&id).map(|f| f.state())
    }

    /// Number of application fibers currently owned (excludes the waiter
    /// and the pseudo-fiber).
    pub fn fiber_count(&self) -> usize {
        let waiter = usize::from(self.waiter.fiber_id().is_some());
        self.fibers.len().saturating_sub(waiter)
    }

    pub(crate) fn fiber_mut(&mut self, id: FiberId) -> &mut Fiber {
        if id == self.worker_fiber.id() {
            return &mut self.worker_fiber;
        }
        match self.fibers.get_mut(&id) {
            Some(f) => f,
            None => fatal!("Fiber {} is not owned by this worker", id.get()),
        }
    }

    fn fiber_ptr(&mut self, id: FiberId) -> *mut Fiber {
        self.fiber_mut(id) as *mut Fiber
    }

    /// File a fiber in the queue its state belongs to. A `Waiting` fiber
    /// (sleep scheduled before start, or resumed into a pending sleep) goes
    /// to the waiter's deadline bookkeeping instead; a dead one is parked
    /// runnable so the dispatch loop reclaims it.
    pub(crate) fn add(&mut self, id: FiberId) {
        match self.fiber_mut(id).state() {
            State::Suspended => {
                self.suspended.push(id);
                log::debug!(target: "worker", "Added suspended fiber {}", id.get());
            }
            State::Waiting => {
                let deadline = self.fiber_mut(id).wake_deadline();
                waiter::adopt(self, id, deadline);
            }
            _ => {
                self.runnable.push_back(id);
                log::debug!(target: "worker", "Added runnable fiber {}", id.get());
            }
        }
    }

    /// Take a fiber out of the queue its state files it under.
    pub(crate) fn release(&mut self, id: FiberId) {
        if self.fiber_mut(id).state() == State::Suspended {
            self.suspended.retain(|&f| f != id);
        } else {
            self.runnable.retain(|&f| f != id);
        }
    }

    /// Dispatch one fiber.
    ///
    /// Selects `prefer` if given (it must be enqueued or be the
    /// pseudo-fiber), else the head of the runnable queue, else the
    /// pseudo-fiber; rotates the queue; switches. Returns `true` when a
    /// fiber other than the caller actually ran — the waiter uses `false`
    /// ("nothing else to do") as its license for a real OS-level sleep.
    pub(crate) fn schedule(&mut self, prefer: Option<FiberId>, now: Timestamp) -> bool {
        let mut prefer = prefer;

        // A bounded run() whose time is up returns to the worker context so
        // the outer loop can re-check its exit condition.
        if let Some(end) = self.end {
            if end <= now {
                log::debug!(target: "worker", "Run time is up");
                prefer = Some(self.worker_fiber.id());
            }
        }

        let mut did_schedule = false;
        loop {
            let next_id = match prefer.take() {
                Some(id) => id,
                None => match self.runnable.front() {
                    Some(&id) => id,
                    None => self.worker_fiber.id(),
                },
            };

            if next_id != self.worker_fiber.id() {
                match self.runnable.iter().position(|&f| f == next_id) {
                    Some(pos) => {
                        // Rotate: the dispatched fiber goes to the back.
                        self.runnable.remove(pos);
                        self.runnable.push_back(next_id);
                    }
                    None => fatal!("Scheduling fiber {} which is not runnable", next_id.get()),
                }
            }

            let next_ptr = self.fiber_ptr(next_id);
            let prev = self.current;
            let from_ptr = match prev {
                Some(pid) => self.fiber_ptr(pid),
                None => &mut *self.worker_fiber as *mut Fiber,
            };

            self.current = Some(next_id);
            // SAFETY: both fibers are owned and boxed by this worker; `from`
            // is the one executing this call.
            let result = unsafe { Fiber::run(next_ptr, from_ptr, now) };
            // The dispatched fiber may have been reclaimed while we were
            // away; `next_ptr` must not be used past this point.
            self.current = prev;

            match result {
                Ok(RunResult::Switched) => return true,
                Ok(RunResult::Same) => return did_schedule,
                Ok(RunResult::Dead) => {
                    self.cleanup(next_id);
                    did_schedule = true;
                    // Retry selection.
                }
                Err(e) => fatal!("Unhandled fiber dispatch error: {e}"),
            }
        }
    }

    /// Reclaim a dead fiber.
    ///
    /// Never called with the dying fiber's own stack still active: if the
    /// current fiber is the dead one, control first switches to the worker
    /// context and reclamation happens on a later dispatch from there.
    pub(crate) fn cleanup(&mut self, id: FiberId) {
        if self.fiber_state(id) != Some(State::Dead) {
            fatal!("Cleanup of fiber {} which is not dead", id.get());
        }

        if self.current == Some(id) {
            log::debug!(
                target: "worker",
                "Current fiber {} died; switching to worker context",
                id.get()
            );
            self.schedule(Some(self.worker_fiber.id()), Timestamp::now());
            fatal!("Dead fiber was dispatched again");
        }

        log::debug!(target: "worker", "Reclaiming dead fiber {}", id.get());
        self.runnable.retain(|&f| f != id);
        self.fibers.remove(&id);
    }

    /// Park a fiber; it becomes invisible to dispatch until resumed.
    /// Suspending the currently running fiber reschedules immediately.
    pub fn suspend(&mut self, id: FiberId) -> FiberResult<()> {
        match self.fiber_state(id).ok_or(FiberError::UnknownFiber)? {
            State::New | State::Ready => {
                self.release(id);
                self.fiber_mut(id).suspend();
                self.add(id);
            }
            State::Running => {
                self.release(id);
                self.fiber_mut(id).suspend();
                self.add(id);
                if self.current == Some(id) {
                    self.schedule(None, Timestamp::now());
                }
            }
            State::Waiting => {
                // Not on our queues; completes via the waiter's wakeup.
                self.fiber_mut(id).suspend();
            }
            State::Suspended | State::Dead => {}
        }
        Ok(())
    }

    /// Undo a suspend. A fiber that was resumed into a pending sleep is
    /// handed to the waiter instead of the runnable queue.
    pub fn resume(&mut self, id: FiberId) -> FiberResult<()> {
        if self.fiber_state(id).ok_or(FiberError::UnknownFiber)? != State::Suspended {
            return Ok(());
        }
        self.release(id);
        self.fiber_mut(id).resume();
        self.add(id);
        Ok(())
    }

    /// Force a fiber to `Dead`. Safe against the currently running fiber
    /// (including self-kill): the context is reclaimed only after control
    /// has switched away.
    pub fn kill(&mut self, id: FiberId) -> FiberResult<()> {
        if id == self.worker_fiber.id() {
            fatal!("Killing the worker pseudo-fiber");
        }
        let fiber = self.fibers.get_mut(&id).ok_or(FiberError::UnknownFiber)?;
        let state = fiber.state();
        fiber.kill();
        match state {
            State::Waiting => {
                // Pull it out of the waiter so it is reclaimed promptly.
                waiter::forget(self, id);
                self.runnable.push_back(id);
            }
            State::Suspended => {
                self.suspended.retain(|&f| f != id);
                self.runnable.push_back(id);
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn run_end(&self) -> Option<Timestamp> {
        self.end
    }

    /// The outer loop: dispatch until the runnable queue drains (and the
    /// optional duration elapses). The only blocking entry point.
    pub fn run(&mut self, duration: Option<Duration>) {
        if self.current.is_some() {
            fatal!("Worker::run called from within a fiber");
        }

        let _guard = CurrentGuard::register(self);

        self.end = duration.map(|d| Timestamp::now() + d);
        match duration {
            Some(d) => log::debug!(target: "worker", "Run for {d:?}"),
            None => log::debug!(target: "worker", "Run"),
        }

        while !self.runnable.is_empty()
            && self.end.map_or(true, |end| Timestamp::now() < end)
        {
            self.schedule(None, Timestamp::now());
            debug_assert!(self.current.is_none());
        }

        self.end = None;
        log::debug!(target: "worker", "Stopped");
    }
}

impl Default for Worker {
    fn default() -> Worker {
        Worker::new()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        log::debug!(target: "worker", "Destruct");

        // No fiber is executing here, so contexts can be reclaimed
        // directly: kill everything and drop the arena.
        for id in core::mem::take(&mut self.suspended) {
            if let Some(f) = self.fibers.get_mut(&id) {
                f.resume();
                f.kill();
            }
        }
        for f in self.fibers.values_mut() {
            f.kill();
        }
        self.fibers.clear();
        self.runnable.clear();
    }
}

/// Allow a context switch.
///
/// Honors the fairness gate: inside the minimum timeslice this is a no-op,
/// so a fiber spamming yields cannot flood the scheduler while others are
/// guaranteed their slice. Fatal when called outside a fiber.
pub fn yield_now() {
    Worker::with_current(|w| {
        let now = Timestamp::now();
        let current = match w.current {
            Some(id) => id,
            None => fatal!("yield_now outside a fiber"),
        };
        if !w.fiber_mut(current).allow_yield(now) {
            return;
        }
        w.schedule(None, now);
    });
}

/// Force a context switch, even within the minimum timeslice.
///
/// The escape hatch for busy-wait loops: a fiber with nothing to do should
/// hand the CPU over unconditionally rather than spin out its slice.
pub fn out_of_work() {
    Worker::with_current(|w| {
        w.schedule(None, Timestamp::now());
    });
}

/// Suspend the currently running fiber; it continues when some other fiber
/// calls [`resume`].
pub fn suspend() {
    Worker::with_current(|w| {
        let current = match w.current {
            Some(id) => id,
            None => fatal!("suspend outside a fiber"),
        };
        let _ = w.suspend(current);
    });
}

/// Resume a suspended fiber of the current worker.
pub fn resume(id: FiberId) {
    Worker::with_current(|w| {
        let _ = w.resume(id);
    });
}

/// Kill a fiber of the current worker. Killing the calling fiber itself is
/// safe: it keeps running until its next suspension point and is reclaimed
/// after control has switched away.
pub fn kill(id: FiberId) {
    Worker::with_current(|w| {
        let _ = w.kill(id);
    });
}

/// The id of the fiber executing right now, if any.
pub fn current_fiber_id() -> Option<FiberId> {
    Worker::try_with_current(|w| w.current).flatten()
}
