//! Timed and polled waiting.
//!
//! Each worker runs one perpetual "waiter" fiber owning the deadline-ordered
//! set of sleepers and the fd-readiness registrations. Sleeping therefore
//! never blocks the thread: the waiter wakes whatever expired, offers the
//! CPU to runnable fibers, and only when the scheduler reports that nothing
//! else ran does it make a genuine blocking syscall — a nanosleep until the
//! nearest deadline, or a poll with that deadline as timeout when fd waits
//! are pending. This is the single place in the runtime that blocks at the
//! OS level.

use crate::config;
use crate::error::FiberResult;
use crate::fiber::{FiberBuilder, FiberId, State};
use crate::poller::{Interest, InterestSet, Poller, RawFd, Token};
use crate::time::Timestamp;
use crate::worker::Worker;
use core::time::Duration;
use std::collections::BTreeMap;

enum WaitKind {
    /// Wake when the deadline passes.
    Sleep,
    /// Check the predicate at each deadline; re-arm by `interval` while it
    /// stays false. The predicate runs on the waiter's stack and must not
    /// block or switch.
    Poll {
        predicate: Box<dyn FnMut() -> bool>,
        interval: Duration,
    },
}

struct Waitable {
    fiber: FiberId,
    kind: WaitKind,
}

struct FdWait {
    fiber: FiberId,
    token: Token,
    done: Option<FiberResult<()>>,
}

pub(crate) struct Waiter {
    fiber: Option<FiberId>,
    /// Deadline-ordered sleepers; the seq breaks ties while keeping FIFO
    /// order among equal deadlines.
    waiting: BTreeMap<(Timestamp, u64), Waitable>,
    seq: u64,
    fd_waits: Vec<FdWait>,
    poller: Box<dyn Poller>,
}

impl Waiter {
    pub(crate) fn new() -> Waiter {
        #[cfg(unix)]
        let poller: Box<dyn Poller> = Box::new(crate::poller::FdPoller::new());
        #[cfg(not(unix))]
        let poller: Box<dyn Poller> = Box::new(crate::poller::NullPoller::new());

        Waiter {
            fiber: None,
            waiting: BTreeMap::new(),
            seq: 0,
            fd_waits: Vec::new(),
            poller,
        }
    }

    pub(crate) fn fiber_id(&self) -> Option<FiberId> {
        self.fiber
    }

    pub(crate) fn set_poller(&mut self, poller: Box<dyn Poller>) {
        self.poller = poller;
    }

    fn insert(&mut self, deadline: Timestamp, waitable: Waitable) {
        let key = (deadline, self.seq);
        self.seq += 1;
        self.waiting.insert(key, waitable);
    }

    fn nearest_deadline(&self) -> Option<Timestamp> {
        self.waiting.keys().next().map(|&(deadline, _)| deadline)
    }
}

/// Create the waiter fiber for a fresh worker. It starts suspended and is
/// resumed by the first `wait`.
pub(crate) fn spawn_waiter(worker: &mut Worker) -> FiberResult<()> {
    let id = FiberBuilder::new()
        .name("waiter")
        .stack_size(config::DEFAULT_STACK_SIZE)
        .spawn(worker, || loop {
            waiter_step();
        })?;
    worker.suspend(id)?;
    worker.waiter.fiber = Some(id);
    Ok(())
}

/// Put the current fiber to sleep on `kind` until `deadline`, kick the
/// waiter so it notices the new deadline, and reschedule. Returns when the
/// wait completed (or was canceled by an early wakeup).
fn wait(worker: &mut Worker, kind: WaitKind, deadline: Timestamp) {
    let now = Timestamp::now();

    if matches!(kind, WaitKind::Sleep) && deadline <= now {
        // Degenerates to a voluntary yield.
        worker.schedule(None, now);
        return;
    }

    let current = match worker.current_fiber() {
        Some(id) => id,
        None => fatal!("Cannot sleep outside a fiber"),
    };

    worker.release(current);
    worker.fiber_mut(current).nap(Some(deadline));
    worker.waiter.insert(
        deadline,
        Waitable {
            fiber: current,
            kind,
        },
    );

    if let Some(waiter_fiber) = worker.waiter.fiber {
        let _ = worker.resume(waiter_fiber);
    }

    worker.schedule(None, now);
}

/// File an already-`Waiting` fiber (sleep scheduled before start, or resumed
/// into a pending sleep) with the waiter. Without a deadline the fiber
/// sleeps until explicitly woken and is tracked by nobody.
pub(crate) fn adopt(worker: &mut Worker, id: FiberId, deadline: Option<Timestamp>) {
    let Some(deadline) = deadline else {
        log::debug!(target: "waiter", "Fiber {} sleeps until woken", id.get());
        return;
    };

    worker.waiter.insert(
        deadline,
        Waitable {
            fiber: id,
            kind: WaitKind::Sleep,
        },
    );
    if let Some(waiter_fiber) = worker.waiter.fiber {
        let _ = worker.resume(waiter_fiber);
    }
}

/// Drop every trace of a fiber from the waiter's bookkeeping.
pub(crate) fn forget(worker: &mut Worker, id: FiberId) {
    worker.waiter.waiting.retain(|_, w| w.fiber != id);

    let mut dropped = Vec::new();
    worker.waiter.fd_waits.retain(|entry| {
        if entry.fiber == id {
            dropped.push(entry.token);
            false
        } else {
            true
        }
    });
    for token in dropped {
        worker.waiter.poller.unregister(token);
    }
}

/// One pass of the waiter fiber's perpetual loop.
fn waiter_step() {
    Worker::with_current(|worker| {
        let now = Timestamp::now();

        // Wake everything whose deadline passed, in deadline order.
        loop {
            let key = match worker.waiter.waiting.keys().next() {
                Some(&key) if key.0 <= now => key,
                _ => break,
            };
            let mut waitable = worker
                .waiter
                .waiting
                .remove(&key)
                .expect("key was just observed");
            let id = waitable.fiber;

            if worker.fiber_state(id) == Some(State::Dead) {
                // Killed while asleep; hand it to the dispatch loop for
                // reclamation.
                worker.add(id);
                continue;
            }

            let mut rearm_at = None;
            let ready = match &mut waitable.kind {
                WaitKind::Sleep => true,
                WaitKind::Poll {
                    predicate,
                    interval,
                } => {
                    if predicate() {
                        true
                    } else {
                        // Re-arm, skipping deadlines we already missed.
                        let mut next = key.0 + *interval;
                        if next < now {
                            next = now + *interval;
                        }
                        rearm_at = Some(next);
                        false
                    }
                }
            };

            if ready {
                worker.fiber_mut(id).wakeup();
                worker.add(id);
            } else if let Some(next) = rearm_at {
                worker.waiter.insert(next, waitable);
            }
        }

        // Nobody sleeping, nothing registered: park until the next wait().
        if worker.waiter.waiting.is_empty() && worker.waiter.fd_waits.is_empty() {
            log::debug!(target: "waiter", "No sleeping fibers; suspending");
            let self_id = worker
                .waiter
                .fiber
                .expect("waiter fiber runs, so its id is set");
            let _ = worker.suspend(self_id);
            return;
        }

        // Offer the CPU. Only if no other fiber ran is a real OS-level
        // block warranted.
        let scheduled = worker.schedule(None, now);
        let now = Timestamp::now();

        // Nearest reason to wake up again: a sleeper's deadline or the end
        // of a bounded run().
        let mut deadline = worker.waiter.nearest_deadline();
        if let Some(end) = worker.run_end() {
            deadline = Some(match deadline {
                Some(d) if d < end => d,
                _ => end,
            });
        }

        if !worker.waiter.fd_waits.is_empty() {
            let timeout_ms = if scheduled {
                // Others still have work: just a non-blocking check.
                config::NONBLOCKING_POLL
            } else {
                match deadline {
                    None => -1,
                    Some(d) => {
                        let remaining = d.remaining(now);
                        if remaining.is_zero() {
                            return;
                        }
                        remaining.as_millis().saturating_add(1).min(i32::MAX as u128) as i32
                    }
                }
            };

            if timeout_ms != 0 {
                log::debug!(
                    target: "waiter",
                    "Out of work; blocking poll for {timeout_ms} ms"
                );
            }

            let mut ready = Vec::new();
            match worker.waiter.poller.poll(timeout_ms, &mut ready) {
                Ok(()) => {
                    for token in ready {
                        let entry = worker
                            .waiter
                            .fd_waits
                            .iter_mut()
                            .find(|e| e.token == token && e.done.is_none());
                        let id = match entry {
                            Some(e) => {
                                e.done = Some(Ok(()));
                                e.fiber
                            }
                            None => continue,
                        };
                        log::debug!(target: "waiter", "Token {token} ready; waking {}", id.get());
                        worker.fiber_mut(id).wakeup();
                        worker.add(id);
                    }
                }
                Err(e) => {
                    // Deliver the failure to every waiting fiber; each will
                    // surface it from wait_fd().
                    log::debug!(target: "waiter", "Poll failed: {e}");
                    let ids: Vec<FiberId> = worker
                        .waiter
                        .fd_waits
                        .iter_mut()
                        .filter(|entry| entry.done.is_none())
                        .map(|entry| {
                            entry.done = Some(Err(e));
                            entry.fiber
                        })
                        .collect();
                    for id in ids {
                        worker.fiber_mut(id).wakeup();
                        worker.add(id);
                    }
                }
            }
        } else if !scheduled {
            if let Some(d) = deadline {
                let remaining = d.remaining(now);
                if !remaining.is_zero() {
                    log::debug!(
                        target: "waiter",
                        "Out of work; sleeping {remaining:?}"
                    );
                    real_sleep(remaining);
                }
            }
        }
    });
}

/// The genuine OS-level sleep. An interrupted sleep (`EINTR`) simply
/// returns early; the waiter loop re-evaluates.
#[cfg(unix)]
fn real_sleep(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    };
    // SAFETY: plain sleep with a valid timespec.
    unsafe {
        libc::nanosleep(&ts, core::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn real_sleep(duration: Duration) {
    std::thread::sleep(duration);
}

/// Sleep the current fiber for `duration`. A zero or negative duration
/// degenerates to a voluntary yield.
pub fn nap(duration: Duration) {
    nap_until(Timestamp::now() + duration);
}

/// Sleep the current fiber until `deadline`.
pub fn nap_until(deadline: Timestamp) {
    Worker::with_current(|worker| wait(worker, WaitKind::Sleep, deadline));
}

/// Block the current fiber until `predicate` returns true, checking it
/// every `poll_interval` on the waiter fiber.
pub fn wait_until<F>(predicate: F, poll_interval: Duration)
where
    F: FnMut() -> bool + 'static,
{
    Worker::with_current(|worker| {
        wait(
            worker,
            WaitKind::Poll {
                predicate: Box::new(predicate),
                interval: poll_interval,
            },
            Timestamp::now() + poll_interval,
        )
    });
}

/// Block the current fiber until `fd` reports the requested readiness.
///
/// The thread keeps running other fibers meanwhile; only when nothing else
/// is runnable does the worker block in the poller.
pub fn wait_fd(fd: RawFd, interest: Interest) -> FiberResult<()> {
    Worker::with_current(|worker| {
        let current = match worker.current_fiber() {
            Some(id) => id,
            None => fatal!("Cannot wait for an fd outside a fiber"),
        };

        let token = worker
            .waiter
            .poller
            .register(InterestSet { fd, interest });

        worker.release(current);
        worker.fiber_mut(current).nap(None);
        worker.waiter.fd_waits.push(FdWait {
            fiber: current,
            token,
            done: None,
        });

        if let Some(waiter_fiber) = worker.waiter.fiber {
            let _ = worker.resume(waiter_fiber);
        }

        worker.schedule(None, Timestamp::now());

        // Woken up: harvest our entry. A canceled wait (early wakeup) has
        // already been forgotten and reports success without readiness.
        let pos = worker
            .waiter
            .fd_waits
            .iter()
            .position(|entry| entry.fiber == current);
        match pos {
            Some(pos) => {
                let entry = worker.waiter.fd_waits.remove(pos);
                worker.waiter.poller.unregister(entry.token);
                entry.done.unwrap_or(Ok(()))
            }
            None => Ok(()),
        }
    })
}

/// Wake a napping fiber before its deadline. The fiber leaves the sleep
/// bookkeeping and becomes runnable immediately (or finishes its pending
/// suspend). Must not be used on fibers blocked on a synchronizer; those
/// are woken by their synchronizer.
pub fn wakeup(id: FiberId) {
    Worker::with_current(|worker| {
        match worker.fiber_state(id) {
            Some(State::Waiting) => {
                forget(worker, id);
                worker.fiber_mut(id).wakeup();
                worker.add(id);
            }
            Some(State::Suspended) => {
                // Cancels a sleep scheduled during suspension.
                worker.fiber_mut(id).wakeup();
            }
            _ => {}
        }
    });
}
