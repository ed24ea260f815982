//! Pluggable readiness-event source.
//!
//! The waiter only needs three operations from an event multiplexer:
//! register an interest, drop it again, and block for at most a computed
//! timeout while collecting whatever became ready. The default
//! implementation wraps `poll(2)`; embedders with their own event loop
//! (a different multiplexer, a message queue with an fd, ...) can install a
//! custom [`Poller`] on the worker.

use crate::error::FiberResult;

#[cfg(unix)]
use crate::error::{last_errno, FiberError};

#[cfg(unix)]
pub use std::os::unix::io::RawFd;
#[cfg(not(unix))]
pub type RawFd = i32;

/// Handle for one registration.
pub type Token = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// One fd plus the event class to wait for.
#[derive(Debug, Clone, Copy)]
pub struct InterestSet {
    pub fd: RawFd,
    pub interest: Interest,
}

pub trait Poller {
    fn register(&mut self, interest: InterestSet) -> Token;

    fn unregister(&mut self, token: Token);

    /// Wait up to `timeout_ms` for any registration to become ready and
    /// append the ready tokens to `ready`. `-1` blocks indefinitely, `0` is
    /// a single non-blocking check. An interrupted wait (`EINTR`) is not an
    /// error; it simply reports nothing ready.
    fn poll(&mut self, timeout_ms: i32, ready: &mut Vec<Token>) -> FiberResult<()>;
}

/// `poll(2)`-backed poller.
#[cfg(unix)]
pub struct FdPoller {
    entries: Vec<(Token, InterestSet)>,
    next_token: Token,
}

#[cfg(unix)]
impl FdPoller {
    pub fn new() -> FdPoller {
        FdPoller {
            entries: Vec::new(),
            next_token: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(unix)]
impl Default for FdPoller {
    fn default() -> FdPoller {
        FdPoller::new()
    }
}

#[cfg(unix)]
impl Poller for FdPoller {
    fn register(&mut self, interest: InterestSet) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push((token, interest));
        log::trace!(target: "poller", "Registered fd {} as token {token}", interest.fd);
        token
    }

    fn unregister(&mut self, token: Token) {
        self.entries.retain(|&(t, _)| t != token);
    }

    fn poll(&mut self, timeout_ms: i32, ready: &mut Vec<Token>) -> FiberResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }

        let mut pollfds: Vec<libc::pollfd> = self
            .entries
            .iter()
            .map(|&(_, set)| libc::pollfd {
                fd: set.fd,
                events: match set.interest {
                    Interest::Readable => libc::POLLIN,
                    Interest::Writable => libc::POLLOUT,
                },
                revents: 0,
            })
            .collect();

        // SAFETY: the pollfd array is exclusively ours and properly sized.
        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                // Interrupted: nothing ready, caller re-evaluates.
                return Ok(());
            }
            return Err(FiberError::Io(errno));
        }

        // Error conditions (POLLERR/POLLHUP/POLLNVAL) also count as ready:
        // the woken fiber's next I/O attempt will surface them.
        for (pollfd, &(token, _)) in pollfds.iter().zip(self.entries.iter()) {
            if pollfd.revents != 0 {
                ready.push(token);
            }
        }
        Ok(())
    }
}

/// Poller for targets without fd multiplexing; registrations never become
/// ready.
#[cfg(not(unix))]
pub struct NullPoller {
    next_token: Token,
}

#[cfg(not(unix))]
impl NullPoller {
    pub fn new() -> NullPoller {
        NullPoller { next_token: 1 }
    }
}

#[cfg(not(unix))]
impl Poller for NullPoller {
    fn register(&mut self, _interest: InterestSet) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn unregister(&mut self, _token: Token) {}

    fn poll(&mut self, _timeout_ms: i32, _ready: &mut Vec<Token>) -> FiberResult<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        // SAFETY: plain pipe creation.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_register_poll_unregister() {
        let (r, w) = pipe();
        let mut poller = FdPoller::new();
        let token = poller.register(InterestSet {
            fd: r,
            interest: Interest::Readable,
        });

        let mut ready = Vec::new();
        poller.poll(0, &mut ready).unwrap();
        assert!(ready.is_empty());

        // SAFETY: writing one byte into our own pipe.
        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        poller.poll(0, &mut ready).unwrap();
        assert_eq!(ready, vec![token]);

        poller.unregister(token);
        assert!(poller.is_empty());

        // SAFETY: closing our own fds.
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_writable_is_immediately_ready() {
        let (r, w) = pipe();
        let mut poller = FdPoller::new();
        let token = poller.register(InterestSet {
            fd: w,
            interest: Interest::Writable,
        });

        let mut ready = Vec::new();
        poller.poll(0, &mut ready).unwrap();
        assert_eq!(ready, vec![token]);

        // SAFETY: closing our own fds.
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
