//! Hand-constructed jump-buffer backend.
//!
//! The saved execution point is nothing but a stack pointer: `switch_stack`
//! pushes the callee-saved register set onto the running stack, stores the
//! resulting stack pointer into `from`, loads the one saved in `to`, pops
//! and returns — landing wherever that stack last saved itself. A brand-new
//! context is bootstrapped by writing an artificial register-save frame at
//! the top of the fresh stack whose return address is a tiny trampoline and
//! whose callee-saved slots carry the entry function and its argument.
//!
//! No OS support is required beyond stack memory, which is what makes this
//! the backend of choice for targets without signals or `ucontext`.

use super::{ContextAttr, RawContext};
use crate::error::FiberResult;
use crate::stack::Stack;

pub struct Context {
    /// Saved stack pointer; null until the first switch away for stackless
    /// contexts.
    sp: *mut u8,
    stack: Option<Stack>,
}

impl RawContext for Context {
    fn create(attr: ContextAttr) -> FiberResult<Context> {
        if attr.stack_size == 0 {
            return Ok(Context {
                sp: core::ptr::null_mut(),
                stack: None,
            });
        }

        let stack = Stack::allocate(attr.stack_size)?;
        // SAFETY: the stack region is freshly allocated and exclusively ours.
        let sp = unsafe { bootstrap(stack.top(), attr) };
        Ok(Context {
            sp,
            stack: Some(stack),
        })
    }

    unsafe fn switch(from: *mut Context, to: *mut Context) {
        switch_stack(&mut (*from).sp, &mut (*to).sp);
    }

    fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }
}

#[cfg(target_arch = "x86_64")]
mod imp {
    use crate::context::ContextAttr;

    // Frame layout, low address first, matching the restore order of
    // switch_stack: rflags, r15, r14, r13, r12, rbx, rbp, return address.
    const FRAME_WORDS: usize = 8;

    /// # Safety
    /// `top` is the 16-aligned top of an exclusively owned, writable stack
    /// with room for the initial frame.
    pub(super) unsafe fn bootstrap(top: *mut u8, attr: ContextAttr) -> *mut u8 {
        let frame = (top as *mut u64).sub(FRAME_WORDS);
        frame.add(0).write(0x202); // rflags: interrupts enabled
        frame.add(1).write(0); // r15
        frame.add(2).write(0); // r14
        frame.add(3).write(attr.entry as usize as u64); // r13
        frame.add(4).write(attr.arg as u64); // r12
        frame.add(5).write(0); // rbx
        frame.add(6).write(0); // rbp
        frame.add(7).write(boot as usize as u64); // return address
        frame as *mut u8
    }

    /// # Safety
    /// See [`crate::context::RawContext::switch`].
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_stack(from: *mut *mut u8, to: *mut *mut u8) {
        core::arch::naked_asm!(
            "
            push rbp
            push rbx
            push r12
            push r13
            push r14
            push r15
            pushfq

            mov [rdi], rsp
            mov rsp, [rsi]

            popfq
            pop r15
            pop r14
            pop r13
            pop r12
            pop rbx
            pop rbp

            ret
            "
        );
    }

    /// First code executed on a fresh stack: move the argument and entry
    /// pointer out of the callee-saved registers the bootstrap frame parked
    /// them in, realign, and tail into the entry (which never returns).
    #[unsafe(naked)]
    unsafe extern "C" fn boot() -> ! {
        core::arch::naked_asm!(
            "
            mov rdi, r12
            and rsp, -16
            call r13
            ud2
            "
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    use crate::context::ContextAttr;

    // Frame layout, low address first, matching the restore order of
    // switch_stack: d8..d15, x19..x28, x29, x30.
    const FRAME_WORDS: usize = 20;

    /// # Safety
    /// `top` is the 16-aligned top of an exclusively owned, writable stack
    /// with room for the initial frame.
    pub(super) unsafe fn bootstrap(top: *mut u8, attr: ContextAttr) -> *mut u8 {
        let frame = (top as *mut u64).sub(FRAME_WORDS);
        for i in 0..FRAME_WORDS {
            frame.add(i).write(0);
        }
        frame.add(8).write(attr.arg as u64); // x19
        frame.add(9).write(attr.entry as usize as u64); // x20
        frame.add(19).write(boot as usize as u64); // x30 (link register)
        frame as *mut u8
    }

    /// # Safety
    /// See [`crate::context::RawContext::switch`].
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_stack(from: *mut *mut u8, to: *mut *mut u8) {
        core::arch::naked_asm!(
            "
            stp x29, x30, [sp, #-16]!
            stp x27, x28, [sp, #-16]!
            stp x25, x26, [sp, #-16]!
            stp x23, x24, [sp, #-16]!
            stp x21, x22, [sp, #-16]!
            stp x19, x20, [sp, #-16]!
            stp d14, d15, [sp, #-16]!
            stp d12, d13, [sp, #-16]!
            stp d10, d11, [sp, #-16]!
            stp d8, d9, [sp, #-16]!

            mov x9, sp
            str x9, [x0]
            ldr x9, [x1]
            mov sp, x9

            ldp d8, d9, [sp], #16
            ldp d10, d11, [sp], #16
            ldp d12, d13, [sp], #16
            ldp d14, d15, [sp], #16
            ldp x19, x20, [sp], #16
            ldp x21, x22, [sp], #16
            ldp x23, x24, [sp], #16
            ldp x25, x26, [sp], #16
            ldp x27, x28, [sp], #16
            ldp x29, x30, [sp], #16

            ret
            "
        );
    }

    /// First code executed on a fresh stack; tail into the entry with the
    /// argument from x19.
    #[unsafe(naked)]
    unsafe extern "C" fn boot() -> ! {
        core::arch::naked_asm!(
            "
            mov x0, x19
            br x20
            "
        );
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!(
    "no hand-rolled context switch for this architecture; \
     enable the `context-ucontext` or `context-sigaltstack` feature"
);

use imp::{bootstrap, switch_stack};
