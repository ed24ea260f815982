//! Signal-handler bootstrap backend.
//!
//! The only portable way to run code on a caller-chosen stack without
//! `ucontext` is a signal handler with `SA_ONSTACK`: `create` points
//! `sigaltstack` at the new fiber stack, raises SIGUSR2 at itself, and the
//! handler captures its position with `sigsetjmp`. After a second handshake
//! jump that leaves signal-handler context for good, the captured buffer is
//! an ordinary jump target and every switch is a `sigsetjmp`/`siglongjmp`
//! pair. Inherently non-portable trickery; kept behind this one module and
//! off by default.

use super::{ContextAttr, ContextEntry, RawContext};
use crate::error::{last_errno, FiberError, FiberResult};
use crate::stack::Stack;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;

/// Opaque storage for a `sigjmp_buf`. Oversized relative to every libc we
/// target; only ever passed by pointer to the setjmp family.
#[repr(C, align(16))]
struct SigJmpBuf([u8; 512]);

impl SigJmpBuf {
    const fn zeroed() -> SigJmpBuf {
        SigJmpBuf([0; 512])
    }
}

extern "C" {
    // sigsetjmp is a macro on glibc and musl; this is the symbol behind it.
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp(env: *mut SigJmpBuf, savemask: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: libc::c_int) -> !;
}

struct Inner {
    env: SigJmpBuf,
    trampoline_env: SigJmpBuf,
    entry: ContextEntry,
    arg: *mut (),
    mask: libc::sigset_t,
    parent: *mut SigJmpBuf,
}

pub struct Context {
    inner: Box<Inner>,
    stack: Option<Stack>,
}

static TRAMPOLINE_CONTEXT: AtomicPtr<Inner> = AtomicPtr::new(core::ptr::null_mut());
static DID_TRAMPOLINE: AtomicBool = AtomicBool::new(false);

extern "C" fn trampoline(sig: libc::c_int) {
    if sig != libc::SIGUSR2 {
        return;
    }

    let inner = TRAMPOLINE_CONTEXT.load(Ordering::SeqCst);
    if inner.is_null() || DID_TRAMPOLINE.load(Ordering::SeqCst) {
        return;
    }

    // SAFETY: create() keeps the Inner alive for the whole handshake.
    unsafe {
        if sigsetjmp(&mut (*inner).trampoline_env, 0) == 0 {
            // Return through the kernel to finish the signal handler; the
            // captured buffer still points into this (alternate) stack.
            DID_TRAMPOLINE.store(true, Ordering::SeqCst);
            return;
        }

        // Jumped back in from create(): we now run on the fiber stack but
        // outside signal-handler context. Restore the mask the fiber should
        // inherit, then park a clean, switchable save point.
        libc::pthread_sigmask(libc::SIG_SETMASK, &(*inner).mask, core::ptr::null_mut());

        if sigsetjmp(&mut (*inner).env, 1) == 0 {
            siglongjmp((*inner).parent, 1);
        }

        // First genuine switch into this context: run the fiber.
        ((*inner).entry)((*inner).arg);
    }
}

fn install_handler() -> FiberResult<()> {
    // SAFETY: standard signal setup; SIGUSR2 is claimed for this runtime.
    unsafe {
        let mut block: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, libc::SIGUSR2);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &block, core::ptr::null_mut()) != 0 {
            return Err(FiberError::AllocStack(last_errno()));
        }

        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = trampoline as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_ONSTACK;
        if libc::sigaction(libc::SIGUSR2, &sa, core::ptr::null_mut()) != 0 {
            return Err(FiberError::AllocStack(last_errno()));
        }
    }
    Ok(())
}

impl RawContext for Context {
    fn create(attr: ContextAttr) -> FiberResult<Context> {
        let mut inner = Box::new(Inner {
            env: SigJmpBuf::zeroed(),
            trampoline_env: SigJmpBuf::zeroed(),
            entry: attr.entry,
            arg: attr.arg,
            // SAFETY: filled in below before use.
            mask: unsafe { mem::zeroed() },
            parent: core::ptr::null_mut(),
        });

        if attr.stack_size == 0 {
            // Pure save target; switch() fills env on first switch away.
            return Ok(Context { inner, stack: None });
        }

        static HANDLER: spin::Once<FiberResult<()>> = spin::Once::new();
        (*HANDLER.call_once(install_handler))?;

        // The new context inherits the caller's current mask.
        // SAFETY: querying only.
        unsafe {
            libc::pthread_sigmask(0, core::ptr::null(), &mut inner.mask);
        }

        let stack = Stack::allocate(attr.stack_size)?;

        // SAFETY: the handshake below is serialized by SIGLOCK; the alternate
        // stack points into our freshly allocated region.
        unsafe {
            let ss = libc::stack_t {
                ss_sp: stack.bottom() as *mut libc::c_void,
                ss_flags: 0,
                ss_size: stack.usable_size(),
            };
            if libc::sigaltstack(&ss, core::ptr::null_mut()) != 0 {
                return Err(FiberError::AllocStack(last_errno()));
            }

            // Two workers bootstrapping at once must not confuse whose
            // signal ran on whose stack.
            static SIGLOCK: Mutex<()> = Mutex::new(());
            let guard = SIGLOCK.lock().unwrap_or_else(|e| e.into_inner());

            DID_TRAMPOLINE.store(false, Ordering::SeqCst);
            TRAMPOLINE_CONTEXT.store(&mut *inner, Ordering::SeqCst);

            if libc::pthread_kill(libc::pthread_self(), libc::SIGUSR2) != 0 {
                TRAMPOLINE_CONTEXT.store(core::ptr::null_mut(), Ordering::SeqCst);
                return Err(FiberError::AllocStack(last_errno()));
            }

            let mut wait: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&mut wait);
            libc::sigdelset(&mut wait, libc::SIGUSR2);
            while !DID_TRAMPOLINE.load(Ordering::SeqCst) {
                libc::sigsuspend(&wait);
            }

            TRAMPOLINE_CONTEXT.store(core::ptr::null_mut(), Ordering::SeqCst);
            drop(guard);

            // Leave signal-handler context: jump onto the fiber stack once so
            // it can park a clean save point, then come straight back here.
            let mut me = SigJmpBuf::zeroed();
            inner.parent = &mut me;
            if sigsetjmp(&mut me, 1) == 0 {
                siglongjmp(&mut inner.trampoline_env, 1);
            }
            inner.parent = core::ptr::null_mut();
        }

        Ok(Context {
            inner,
            stack: Some(stack),
        })
    }

    unsafe fn switch(from: *mut Context, to: *mut Context) {
        if sigsetjmp(&mut (*from).inner.env, 1) == 0 {
            siglongjmp(&mut (*to).inner.env, 1);
        }
        // Landed back: someone restored `from`.
    }

    fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }
}
