use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// Stack memory for a new context could not be reserved (raw `errno`).
    AllocStack(i32),
    /// The operation is not legal in the fiber's current state.
    InvalidState,
    /// The operation requires a running fiber, but was called from plain
    /// thread context.
    NotAFiber,
    /// No fiber with the given id is owned by this worker.
    UnknownFiber,
    /// An OS call failed while waiting for fd readiness (raw `errno`).
    Io(i32),
}

impl FiberError {
    pub fn as_str(self) -> &'static str {
        match self {
            FiberError::AllocStack(_) => "Cannot allocate fiber stack",
            FiberError::InvalidState => "Operation not allowed in current fiber state",
            FiberError::NotAFiber => "Not called from within a fiber",
            FiberError::UnknownFiber => "Fiber is not owned by this worker",
            FiberError::Io(_) => "I/O wait failed",
        }
    }
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FiberError::AllocStack(errno) | FiberError::Io(errno) => {
                write!(f, "{} (errno {})", self.as_str(), errno)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for FiberError {}

pub type FiberResult<T> = Result<T, FiberError>;

/// Fetch the calling thread's current `errno`.
#[cfg(unix)]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
