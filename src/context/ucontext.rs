//! POSIX `ucontext` backend.
//!
//! `makecontext` builds the initial frame on the new stack; every switch is
//! a `swapcontext`. `makecontext` only passes `int` arguments, so the entry
//! function and argument pointers are split into 32-bit halves and
//! reassembled in the boot shim.

use super::{ContextAttr, ContextEntry, RawContext};
use crate::error::{last_errno, FiberError, FiberResult};
use crate::stack::Stack;
use core::mem;

pub struct Context {
    // Boxed: ucontext_t is large and its address must stay stable.
    uc: Box<libc::ucontext_t>,
    stack: Option<Stack>,
}

extern "C" fn boot(entry_hi: u32, entry_lo: u32, arg_hi: u32, arg_lo: u32) {
    let entry = ((entry_hi as u64) << 32) | entry_lo as u64;
    let arg = ((arg_hi as u64) << 32) | arg_lo as u64;
    // SAFETY: reassembles exactly the pointers create() split.
    let entry: ContextEntry = unsafe { mem::transmute(entry as usize) };
    entry(arg as usize as *mut ());
}

impl RawContext for Context {
    fn create(attr: ContextAttr) -> FiberResult<Context> {
        // SAFETY: getcontext initializes the zeroed buffer in place.
        let mut uc: Box<libc::ucontext_t> = Box::new(unsafe { mem::zeroed() });
        if unsafe { libc::getcontext(&mut *uc) } != 0 {
            return Err(FiberError::AllocStack(last_errno()));
        }

        if attr.stack_size == 0 {
            return Ok(Context { uc, stack: None });
        }

        let stack = Stack::allocate(attr.stack_size)?;
        uc.uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        uc.uc_stack.ss_size = stack.usable_size();
        uc.uc_link = core::ptr::null_mut();

        let entry = attr.entry as usize as u64;
        let arg = attr.arg as usize as u64;
        // SAFETY: the boot shim takes four ints, passed through the
        // variadic makecontext interface as POSIX specifies.
        unsafe {
            let f: extern "C" fn() = mem::transmute(
                boot as extern "C" fn(u32, u32, u32, u32),
            );
            libc::makecontext(
                &mut *uc,
                f,
                4,
                (entry >> 32) as libc::c_int,
                entry as u32 as libc::c_int,
                (arg >> 32) as libc::c_int,
                arg as u32 as libc::c_int,
            );
        }

        Ok(Context {
            uc,
            stack: Some(stack),
        })
    }

    unsafe fn switch(from: *mut Context, to: *mut Context) {
        if libc::swapcontext(&mut *(*from).uc, &mut *(*to).uc) != 0 {
            fatal!("swapcontext failed (errno {})", last_errno());
        }
    }

    fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }
}
