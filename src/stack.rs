//! Fiber stack allocation with optional guard pages.
//!
//! A [`Stack`] owns one contiguous region sized up to whole pages. When
//! guards are enabled and the target has page protection, the lowest and
//! highest page are remapped `PROT_NONE` so an overflow faults immediately
//! instead of silently corrupting a neighboring allocation. On targets
//! without `mmap` the region comes from the global allocator and overflow
//! detection is left to the platform.

use crate::config;
use crate::error::FiberResult;

#[cfg(unix)]
use crate::error::{last_errno, FiberError};

/// Alignment required for a stack pointer by all supported ABIs.
pub const STACK_ALIGN: usize = 16;

pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is always safe to call.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
}

/// An owned stack region.
pub struct Stack {
    base: *mut u8,
    size: usize,
    usable: *mut u8,
    usable_size: usize,
    guarded: bool,
}

impl Stack {
    /// Reserve a stack with at least `size` usable bytes.
    ///
    /// The allocation is rounded up to whole pages; a guard page is added at
    /// both ends when [`config::ENABLE_STACK_GUARD`] is set and the target
    /// supports it. Returns the raw `errno` on failure.
    pub fn allocate(size: usize) -> FiberResult<Stack> {
        let page = page_size();
        let usable_size = (size.max(page) + page - 1) & !(page - 1);

        #[cfg(unix)]
        {
            let guarded = config::ENABLE_STACK_GUARD;
            let total = usable_size + if guarded { 2 * page } else { 0 };

            // SAFETY: plain anonymous mapping, checked below.
            let base = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    total,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(FiberError::AllocStack(last_errno()));
            }
            let base = base as *mut u8;

            let usable = if guarded {
                // SAFETY: both protected pages lie within the mapping.
                unsafe {
                    if libc::mprotect(base as *mut _, page, libc::PROT_NONE) != 0
                        || libc::mprotect(
                            base.add(total - page) as *mut _,
                            page,
                            libc::PROT_NONE,
                        ) != 0
                    {
                        let errno = last_errno();
                        libc::munmap(base as *mut _, total);
                        return Err(FiberError::AllocStack(errno));
                    }
                    base.add(page)
                }
            } else {
                base
            };

            Ok(Stack {
                base,
                size: total,
                usable,
                usable_size,
                guarded,
            })
        }

        #[cfg(not(unix))]
        {
            let layout = core::alloc::Layout::from_size_align(usable_size, STACK_ALIGN)
                .map_err(|_| crate::error::FiberError::AllocStack(0))?;
            // SAFETY: layout has non-zero size.
            let base = unsafe { std::alloc::alloc(layout) };
            if base.is_null() {
                return Err(crate::error::FiberError::AllocStack(0));
            }
            Ok(Stack {
                base,
                size: usable_size,
                usable: base,
                usable_size,
                guarded: false,
            })
        }
    }

    /// Lowest usable address.
    pub fn bottom(&self) -> *mut u8 {
        self.usable
    }

    /// One past the highest usable address, aligned for a stack pointer.
    pub fn top(&self) -> *mut u8 {
        let top = self.usable as usize + self.usable_size;
        (top & !(STACK_ALIGN - 1)) as *mut u8
    }

    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn is_guarded(&self) -> bool {
        self.guarded
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: base/size come from our own mmap; the guard pages are
        // released together with the mapping.
        unsafe {
            libc::munmap(self.base as *mut _, self.size);
        }

        #[cfg(not(unix))]
        // SAFETY: base/layout come from our own alloc.
        unsafe {
            let layout =
                core::alloc::Layout::from_size_align_unchecked(self.size, STACK_ALIGN);
            std::alloc::dealloc(self.base, layout);
        }
    }
}

// A Stack is plain owned memory; it is only ever used from its worker's
// thread, but moving the owning structures between threads before the first
// run is fine.
unsafe impl Send for Stack {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_touch() {
        let stack = Stack::allocate(32 * 1024).unwrap();
        assert!(stack.usable_size() >= 32 * 1024);
        assert_eq!(stack.top() as usize % STACK_ALIGN, 0);
        assert!((stack.bottom() as usize) < (stack.top() as usize));
        // The usable region must be writable at both extremes.
        unsafe {
            stack.bottom().write(0xA5);
            stack.top().sub(1).write(0x5A);
            assert_eq!(stack.bottom().read(), 0xA5);
        }
    }

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        let stack = Stack::allocate(1).unwrap();
        assert_eq!(stack.usable_size() % page, 0);
        assert!(stack.usable_size() >= page);
    }

    #[cfg(unix)]
    #[test]
    fn test_guard_accounting() {
        let page = page_size();
        let stack = Stack::allocate(16 * 1024).unwrap();
        if stack.is_guarded() {
            assert_eq!(stack.total_size(), stack.usable_size() + 2 * page);
        }
    }
}
