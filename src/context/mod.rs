//! Architecture/platform abstraction for stack switching.
//!
//! A [`Context`] is one saved execution point plus the stack memory backing
//! it. Four interchangeable backends implement the same contract; which one
//! is compiled in is decided here, once, so nothing above this module ever
//! branches on the mechanism:
//!
//! - [`asm`] (default on x86_64/aarch64): the first saved point is
//!   manufactured by hand-writing a register-save area onto the new stack
//!   (stack pointer + trampoline program counter, with the entry argument
//!   parked in a callee-saved register); switching is a naked function that
//!   spills and reloads the callee-saved set.
//! - `ucontext` (`context-ucontext`, unix): `getcontext`/`makecontext`
//!   bootstrap, `swapcontext` switching.
//! - `sigaltstack` (`context-sigaltstack`, unix): a signal handler running on
//!   an alternate stack captures the new context, after which ordinary
//!   `sigsetjmp`/`siglongjmp` switching takes over.
//! - `winfiber` (windows): the native fiber API.

use crate::error::FiberResult;
use crate::stack::Stack;

/// Entry point executed when a freshly created context is first switched
/// into. Must never return; the fiber layer ends with a switch away instead.
pub type ContextEntry = extern "C" fn(arg: *mut ()) -> !;

/// Creation attributes for a [`Context`].
#[derive(Clone, Copy)]
pub struct ContextAttr {
    /// Requested usable stack size in bytes. `0` creates a *stackless*
    /// context: no stack is allocated and no entry will ever run; the
    /// context is only valid as a save target for [`RawContext::switch`].
    /// Used for the worker's pseudo-fiber, which reuses the thread's own
    /// stack.
    pub stack_size: usize,
    pub entry: ContextEntry,
    pub arg: *mut (),
}

impl ContextAttr {
    pub fn new(stack_size: usize, entry: ContextEntry, arg: *mut ()) -> ContextAttr {
        ContextAttr {
            stack_size,
            entry,
            arg,
        }
    }

    /// Attributes for a stackless (save-target only) context.
    pub fn stackless() -> ContextAttr {
        extern "C" fn never(_: *mut ()) -> ! {
            fatal!("Stackless context was switched into");
        }
        ContextAttr::new(0, never, core::ptr::null_mut())
    }
}

/// The contract every context-switch backend implements.
///
/// # Safety
///
/// `switch` transfers control between stacks. The caller must guarantee that
/// `from` is the context of the currently executing stack, that `to` was
/// produced by `create` on this thread (or is a stackless save target that
/// has been switched *out of* at least once), and that neither is destroyed
/// while it is the executing one.
pub trait RawContext: Sized {
    /// Allocate the stack and manufacture the initial saved execution point.
    ///
    /// Fails with the OS error if the stack region cannot be reserved. All
    /// other misuse of a context is a fatal abort, not an error.
    fn create(attr: ContextAttr) -> FiberResult<Self>;

    /// Save the running execution point into `from`, restore `to`, and
    /// transfer control. Returns only when some later switch restores
    /// `from`.
    ///
    /// # Safety
    ///
    /// See the trait-level contract.
    unsafe fn switch(from: *mut Self, to: *mut Self);

    /// The stack backing this context, if it owns one.
    fn stack(&self) -> Option<&Stack>;
}

#[cfg(all(unix, feature = "context-ucontext"))]
mod ucontext;
#[cfg(all(unix, feature = "context-ucontext"))]
pub use ucontext::Context;

#[cfg(all(unix, feature = "context-sigaltstack", not(feature = "context-ucontext")))]
mod sigaltstack;
#[cfg(all(unix, feature = "context-sigaltstack", not(feature = "context-ucontext")))]
pub use sigaltstack::Context;

#[cfg(windows)]
mod winfiber;
#[cfg(windows)]
pub use winfiber::Context;

#[cfg(all(
    not(windows),
    not(all(unix, any(feature = "context-ucontext", feature = "context-sigaltstack")))
))]
mod asm;
#[cfg(all(
    not(windows),
    not(all(unix, any(feature = "context-ucontext", feature = "context-sigaltstack")))
))]
pub use asm::Context;
