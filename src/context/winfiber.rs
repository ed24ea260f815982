//! Windows fiber API backend.
//!
//! The OS keeps the saved execution state; this module only tracks the
//! fiber handles. The calling thread is converted to a fiber once so the
//! worker's own stack is switchable like any other.

use super::{ContextAttr, ContextEntry, RawContext};
use crate::error::{FiberError, FiberResult};
use crate::stack::Stack;
use core::ffi::c_void;

type Handle = *mut c_void;

#[link(name = "kernel32")]
extern "system" {
    fn ConvertThreadToFiber(parameter: Handle) -> Handle;
    fn CreateFiberEx(
        stack_commit_size: usize,
        stack_reserve_size: usize,
        flags: u32,
        start_address: extern "system" fn(Handle),
        parameter: Handle,
    ) -> Handle;
    fn SwitchToFiber(fiber: Handle);
    fn DeleteFiber(fiber: Handle);
    fn GetLastError() -> u32;
}

struct Boot {
    entry: ContextEntry,
    arg: *mut (),
}

extern "system" fn boot(parameter: Handle) {
    // SAFETY: parameter is the Boot leaked by create(); the entry never
    // returns, so no cleanup is needed here.
    let b = unsafe { &*(parameter as *const Boot) };
    (b.entry)(b.arg);
}

pub struct Context {
    handle: Handle,
    /// Set for contexts we created; the converted-thread handle is not ours
    /// to delete.
    owned: Option<Box<Boot>>,
}

impl RawContext for Context {
    fn create(attr: ContextAttr) -> FiberResult<Context> {
        if attr.stack_size == 0 {
            // The thread is converted to a fiber exactly once, for the
            // worker's pseudo-fiber.
            // SAFETY: plain API call; failure is checked below.
            let handle = unsafe { ConvertThreadToFiber(core::ptr::null_mut()) };
            if handle.is_null() {
                return Err(FiberError::AllocStack(unsafe { GetLastError() } as i32));
            }
            return Ok(Context {
                handle,
                owned: None,
            });
        }

        let boot_arg = Box::new(Boot {
            entry: attr.entry,
            arg: attr.arg,
        });
        // SAFETY: the Boot outlives the fiber (owned below).
        let handle = unsafe {
            CreateFiberEx(
                0,
                attr.stack_size,
                0,
                boot,
                &*boot_arg as *const Boot as Handle,
            )
        };
        if handle.is_null() {
            return Err(FiberError::AllocStack(unsafe { GetLastError() } as i32));
        }
        Ok(Context {
            handle,
            owned: Some(boot_arg),
        })
    }

    unsafe fn switch(_from: *mut Context, to: *mut Context) {
        // The OS saves the outgoing state itself.
        SwitchToFiber((*to).handle);
    }

    fn stack(&self) -> Option<&Stack> {
        None
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.owned.is_some() {
            // SAFETY: the scheduler never destroys the executing context.
            unsafe { DeleteFiber(self.handle) };
        }
    }
}
