//! The fiber: one context plus an entry function, wrapped in a state
//! machine.
//!
//! Legal transitions:
//!
//! ```text
//! New --first run--> Ready <--dispatch/yield--> Running
//! Running --nap/block--> Waiting --wakeup--> Ready
//! any except Dead --suspend--> Suspended --resume--> (pre-suspend state)
//! any --kill--> Dead (terminal)
//! ```
//!
//! `state_next` records the state a pending transition completes into, so a
//! sleep requested while the fiber is suspended (or a suspend requested
//! while it sleeps) is not lost.

use crate::config;
use crate::context::{Context, ContextAttr, RawContext};
use crate::error::{FiberError, FiberResult};
use crate::time::Timestamp;
use core::fmt;
use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};

/// Unique identifier for fibers. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    pub fn get(self) -> u64 {
        self.0
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> FiberId {
    FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Ready,
    Running,
    Waiting,
    Suspended,
    Dead,
}

/// Outcome of [`Fiber::run`], seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunResult {
    /// A real switch happened and control has since returned to `from`.
    Switched,
    /// Target is the caller itself; nothing to do.
    Same,
    /// Target is dead and must be reclaimed by the worker.
    Dead,
}

type Cleanup = Box<dyn FnOnce(&mut Fiber)>;

pub struct Fiber {
    id: FiberId,
    name: String,
    state: State,
    state_next: State,
    entry: Option<Box<dyn FnOnce()>>,
    stack_size: usize,
    context: Option<Context>,
    /// When this fiber last started running.
    start_run: Timestamp,
    /// While Running: end of the guaranteed timeslice. While Waiting: the
    /// requested wake-up time (`None` = sleep until woken).
    state_end: Option<Timestamp>,
    total_time: Duration,
    timeslice: Duration,
    cleanup: Vec<Cleanup>,
}

impl Fiber {
    pub fn new<F>(entry: F) -> Fiber
    where
        F: FnOnce() + 'static,
    {
        Fiber::with(Box::new(entry), None, config::DEFAULT_STACK_SIZE)
    }

    pub(crate) fn with(
        entry: Box<dyn FnOnce()>,
        name: Option<String>,
        stack_size: usize,
    ) -> Fiber {
        let id = next_id();
        let name = name.unwrap_or_else(|| format!("fiber-{}", id.get()));
        log::debug!(target: "fiber", "[{name}] New fiber");
        Fiber {
            id,
            name,
            state: State::New,
            state_next: State::Ready,
            entry: Some(entry),
            stack_size,
            context: None,
            start_run: Timestamp::now(),
            state_end: None,
            total_time: Duration::ZERO,
            timeslice: config::MIN_TIMESLICE,
            cleanup: Vec::new(),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn state_next(&self) -> State {
        self.state_next
    }

    /// Accumulated CPU time this fiber has been dispatched for.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Change the stack size. Only before the context exists.
    pub fn set_stack_size(&mut self, size: usize) -> FiberResult<()> {
        if self.state != State::New {
            return Err(FiberError::InvalidState);
        }
        self.stack_size = size;
        Ok(())
    }

    /// Register a callback to run when the fiber is destroyed.
    pub fn add_cleanup<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Fiber) + 'static,
    {
        self.cleanup.push(Box::new(f));
    }

    pub(crate) fn wake_deadline(&self) -> Option<Timestamp> {
        self.state_end
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        log::trace!(
            target: "fiber",
            "[{}] {:?} -> {:?}",
            self.name,
            self.state,
            state
        );
        self.state = state;
    }

    /// Allocate the context. Legal only from `New`; transitions into
    /// `state_next` (normally `Ready`, or `Waiting` for a sleep scheduled
    /// before start). On allocation failure the fiber is dead and the OS
    /// error is returned.
    ///
    /// Once initialized the fiber must not move in memory: its context keeps
    /// a pointer to it for the entry trampoline. The worker guarantees this
    /// by boxing every fiber before `init`.
    pub fn init(&mut self, now: Timestamp) -> FiberResult<()> {
        if self.state != State::New {
            return Err(FiberError::InvalidState);
        }
        debug_assert!(self.context.is_none());

        log::debug!(target: "fiber", "[{}] Init", self.name);
        let attr = ContextAttr::new(
            self.stack_size,
            fiber_trampoline,
            self as *mut Fiber as *mut (),
        );
        match Context::create(attr) {
            Ok(ctx) => self.context = Some(ctx),
            Err(e) => {
                self.kill();
                return Err(e);
            }
        }

        let next = self.state_next;
        self.set_state(next);
        self.state_next = State::Ready;
        self.start_run = now;
        Ok(())
    }

    /// Context-switch from fiber `from` into `this`.
    ///
    /// Updates `from`'s CPU accounting, grants `this` a fresh timeslice and
    /// performs the switch. Returns once some later switch restores `from`.
    /// By then `this` may already be dead *and freed*, so on the `Switched`
    /// path nothing is read through `this` after the switch.
    ///
    /// # Safety
    ///
    /// `this` and `from` point to live, initialized fibers owned by the
    /// calling worker; `from` is the fiber executing this call.
    pub(crate) unsafe fn run(
        this: *mut Fiber,
        from: *mut Fiber,
        now: Timestamp,
    ) -> FiberResult<RunResult> {
        loop {
            match (*this).state {
                State::New => {
                    // First dispatch: implicit init.
                    (*this).init(now)?;
                }

                State::Ready => {
                    debug_assert!(!core::ptr::eq(this, from));

                    let dt = now - (*from).start_run;
                    (*from).total_time += dt;
                    if (*from).state == State::Running {
                        (*from).set_state(State::Ready);
                    }

                    (*this).start_run = now;
                    (*this).set_state(State::Running);
                    (*this).state_end = Some(now + (*this).timeslice);

                    log::debug!(
                        target: "fiber",
                        "Switch from {} to {} after {:?}",
                        (*from).name,
                        (*this).name,
                        dt
                    );

                    let from_ctx = match (*from).context.as_mut() {
                        Some(c) => c as *mut Context,
                        None => fatal!("Switching away from an uninitialized fiber"),
                    };
                    let to_ctx = match (*this).context.as_mut() {
                        Some(c) => c as *mut Context,
                        None => fatal!("Switching into an uninitialized fiber"),
                    };

                    Context::switch(from_ctx, to_ctx);

                    // Back again. `this` may be gone; do not touch it.
                    return Ok(RunResult::Switched);
                }

                State::Running => {
                    if !core::ptr::eq(this, from) {
                        fatal!("Two running fibers on one worker");
                    }
                    return Ok(RunResult::Same);
                }

                State::Dead => return Ok(RunResult::Dead),

                State::Waiting | State::Suspended => {
                    fatal!(
                        "Fiber {} dispatched in state {:?}",
                        (*this).name,
                        (*this).state
                    );
                }
            }
        }
    }

    /// The fairness gate: `true` iff a voluntary yield should actually
    /// switch. A running fiber inside its minimum timeslice is kept running.
    pub fn allow_yield(&self, now: Timestamp) -> bool {
        self.state != State::Running || self.state_end.map_or(true, |end| end < now)
    }

    /// Immediate, idempotent transition to `Dead`. Runs no cleanup itself;
    /// callbacks run when the worker reclaims the fiber.
    pub fn kill(&mut self) {
        if self.state == State::Dead {
            return;
        }
        log::debug!(target: "fiber", "[{}] Killed", self.name);
        self.set_state(State::Dead);
    }

    /// Go to sleep until `sleep_until` (`None` = until woken).
    ///
    /// From `Running`/`Ready` this takes effect immediately; from `New` or
    /// `Suspended` only `state_next` is updated and the sleep becomes
    /// effective once the fiber is started or resumed.
    pub fn nap(&mut self, sleep_until: Option<Timestamp>) {
        match self.state {
            State::New | State::Suspended => {
                log::debug!(target: "fiber", "[{}] Sleep scheduled", self.name);
                self.state_next = State::Waiting;
            }
            State::Ready | State::Running => {
                log::debug!(target: "fiber", "[{}] Sleep", self.name);
                self.set_state(State::Waiting);
                self.state_next = State::Ready;
            }
            State::Waiting | State::Dead => return,
        }

        self.state_end = sleep_until;
    }

    /// End a `Waiting` state: transition into `state_next` — `Ready`
    /// normally, or `Suspended` if the fiber was suspended while asleep.
    /// On a suspended fiber with a pending sleep, cancels that sleep.
    pub fn wakeup(&mut self) {
        if self.state == State::Waiting {
            let next = self.state_next;
            self.set_state(next);
            if self.state == State::Suspended {
                log::debug!(target: "fiber", "[{}] Suspend after wakeup", self.name);
                self.state_next = State::Ready;
            } else {
                log::debug!(target: "fiber", "[{}] Wakeup", self.name);
            }
        } else if self.state == State::Suspended && self.state_next == State::Waiting {
            log::debug!(target: "fiber", "[{}] Pending sleep canceled", self.name);
            self.state_next = State::Ready;
        }
    }

    /// Park the fiber, remembering the state to resume into.
    ///
    /// A `Waiting` fiber stays in the sleep bookkeeping and transitions to
    /// `Suspended` only once its wait completes.
    pub fn suspend(&mut self) {
        match self.state {
            State::New => self.state_next = State::New,
            State::Running | State::Ready => self.state_next = State::Ready,
            State::Waiting => {
                // Completes via wakeup().
                log::debug!(target: "fiber", "[{}] Suspend after wait", self.name);
                self.state_next = State::Suspended;
                return;
            }
            State::Suspended | State::Dead => return,
        }

        log::debug!(target: "fiber", "[{}] Suspend", self.name);
        self.set_state(State::Suspended);
    }

    /// Undo a suspend: back to the remembered state.
    pub fn resume(&mut self) {
        if self.state != State::Suspended {
            return;
        }
        log::debug!(target: "fiber", "[{}] Resume", self.name);
        let next = self.state_next;
        self.set_state(next);
        if self.state == State::New {
            self.state_next = State::Ready;
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} t={:?}",
            self.name, self.state, self.total_time
        )
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        for f in core::mem::take(&mut self.cleanup) {
            f(self);
        }
        if self.state != State::Dead {
            self.kill();
        }
        log::debug!(
            target: "fiber",
            "[{}] Destructed, total CPU {:?}",
            self.name,
            self.total_time
        );
    }
}

/// Entry point every context boots into.
///
/// Runs the user entry inside a panic-catching wrapper — an uncaught panic
/// is logged and treated as ordinary termination — then kills the fiber and
/// switches away for good.
pub(crate) extern "C" fn fiber_trampoline(fiber: *mut ()) -> ! {
    let fiber = fiber as *mut Fiber;

    // SAFETY: the worker keeps the fiber alive while it executes; the
    // references below are dropped before any context switch.
    unsafe {
        log::debug!(target: "fiber", "[{}] Entry", (*fiber).name);

        if let Some(entry) = (*fiber).entry.take() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
            if let Err(payload) = result {
                let msg = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("<non-string panic payload>");
                log::error!(
                    target: "fiber",
                    "[{}] Uncaught panic: {}",
                    (*fiber).name,
                    msg
                );
            }
        }

        log::debug!(target: "fiber", "[{}] Exit", (*fiber).name);
        (*fiber).kill();
    }

    // Hand the CPU back; a dead fiber is never switched into again.
    crate::worker::out_of_work();
    fatal!("Returned into a dead fiber");
}

/// Configures and spawns fibers on a [`Worker`](crate::worker::Worker).
///
/// ```no_run
/// # use cooperative_fibers::{FiberBuilder, Worker};
/// let mut worker = Worker::new();
/// FiberBuilder::new()
///     .name("io-pump")
///     .stack_size(256 * 1024)
///     .spawn(&mut worker, || { /* ... */ })
///     .unwrap();
/// ```
#[derive(Default)]
pub struct FiberBuilder {
    name: Option<String>,
    stack_size: usize,
}

impl FiberBuilder {
    pub fn new() -> FiberBuilder {
        FiberBuilder {
            name: None,
            stack_size: config::DEFAULT_STACK_SIZE,
        }
    }

    pub fn name(mut self, name: &str) -> FiberBuilder {
        self.name = Some(name.to_string());
        self
    }

    pub fn stack_size(mut self, size: usize) -> FiberBuilder {
        self.stack_size = size;
        self
    }

    pub fn spawn<F>(
        self,
        worker: &mut crate::worker::Worker,
        entry: F,
    ) -> FiberResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        worker.spawn_fiber(Fiber::with(Box::new(entry), self.name, self.stack_size))
    }
}
