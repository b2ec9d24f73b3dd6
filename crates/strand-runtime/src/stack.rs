//! Fiber stack allocation
//!
//! Each fiber owns one anonymous mapping: a guard page at the low end
//! (stacks grow down) followed by the usable stack. The guard page stays
//! PROT_NONE so overflow faults instead of corrupting the neighbour.

use strand_core::{Result, RuntimeError};

const PAGE_SIZE: usize = 4096;
const GUARD_SIZE: usize = PAGE_SIZE;

/// Owned, guard-paged stack mapping for one fiber
pub struct FiberStack {
    base: *mut u8,
    total: usize,
}

// The mapping is only touched by whichever thread currently runs the fiber.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack with at least `size` usable bytes
    pub fn alloc(size: usize) -> Result<FiberStack> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAlloc {
                size: total,
                source: std::io::Error::last_os_error(),
            });
        }
        let base = base as *mut u8;

        // Lowest page becomes the guard
        let ret = unsafe { libc::mprotect(base as *mut libc::c_void, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(RuntimeError::StackAlloc {
                size: total,
                source: err,
            });
        }

        Ok(FiberStack { base, total })
    }

    /// One-past-the-end address; initial stack pointer seed
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excluding the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        debug_assert_eq!(ret, 0, "munmap of fiber stack failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_write() {
        let stack = FiberStack::alloc(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        // Top of stack is writable
        unsafe {
            let p = stack.top().sub(8);
            p.write_bytes(0xAB, 8);
            assert_eq!(*p, 0xAB);
        }
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = FiberStack::alloc(100).unwrap();
        assert_eq!(stack.size() % 4096, 0);
        assert!(stack.size() >= 4096);
    }

    #[test]
    fn test_top_aligned() {
        let stack = FiberStack::alloc(16 * 1024).unwrap();
        assert_eq!(stack.top() as usize % 4096, 0);
    }
}
