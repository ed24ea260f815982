//! A cooperative userspace multitasking library.
//!
//! Independent call stacks ("fibers") are multiplexed onto a single OS
//! thread by explicit, non-preemptive context switches. A [`Worker`] owns
//! the fibers of one thread and dispatches them round-robin; fibers hand
//! control back by yielding, sleeping, or blocking on one of the
//! [synchronization primitives](crate::sync). Timed sleeping and fd
//! readiness waiting are driven by a per-worker waiter fiber, so blocking a
//! fiber never blocks the thread unless there is truly nothing else to run.
//!
//! ```no_run
//! use cooperative_fibers::{Worker, nap};
//! use std::time::Duration;
//!
//! let mut worker = Worker::new();
//! worker
//!     .spawn(|| {
//!         for i in 0..3 {
//!             println!("tick {i}");
//!             nap(Duration::from_millis(10));
//!         }
//!     })
//!     .unwrap();
//! worker.run(None);
//! ```
//!
//! The low-level context switch is pluggable: the default backend
//! hand-constructs a register-save area on a fresh stack, and the
//! `context-ucontext` / `context-sigaltstack` features select the POSIX
//! `ucontext` and signal-handler bootstrap mechanisms instead. Windows uses
//! the native fiber API. Schedulers never branch on the backend.

#[macro_use]
mod util;

pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod poller;
pub mod stack;
pub mod sync;
pub mod time;
pub mod waiter;
pub mod worker;

pub use error::{FiberError, FiberResult};
pub use fiber::{Fiber, FiberBuilder, FiberId, State};
pub use poller::{Interest, InterestSet, Poller, Token};
pub use sync::{Future, Mutex, MutexGuard, Semaphore, Signal};
pub use time::Timestamp;
pub use waiter::{nap, nap_until, wait_fd, wait_until, wakeup};
pub use worker::{current_fiber_id, kill, out_of_work, resume, suspend, yield_now, Worker};
