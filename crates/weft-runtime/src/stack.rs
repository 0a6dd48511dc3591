//! Fiber stack allocation.
//!
//! Each fiber stack is its own anonymous mapping: the whole region is
//! reserved PROT_NONE, then everything above the lowest page is made
//! read/write. The low page stays PROT_NONE as a guard, so overflow faults
//! instead of corrupting a neighbour.

use weft_core::werror;

const PAGE_SIZE: usize = 4096;

pub struct FiberStack {
    base: *mut u8,
    total: usize,
}

// The mapping is exclusively owned; moving it between threads is fine.
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Allocate a stack of at least `size` usable bytes plus a guard page.
    ///
    /// Allocation failure is fatal: a fiber without a stack cannot exist
    /// and callers hold no resources to unwind.
    pub fn alloc(size: usize) -> FiberStack {
        let usable = round_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            werror!(target: "stack", "mmap of {} byte fiber stack failed", total);
            std::process::abort();
        }

        // Guard page at the low end stays PROT_NONE.
        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(PAGE_SIZE) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            werror!(target: "stack", "mprotect of fiber stack failed");
            std::process::abort();
        }

        FiberStack {
            base: base as *mut u8,
            total,
        }
    }

    /// High end of the mapping; stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (mapping minus the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.total - PAGE_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if ret != 0 {
            werror!(target: "stack", "munmap of fiber stack failed");
        }
    }
}

fn round_up(v: usize, to: usize) -> usize {
    (v + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_touch() {
        let stack = FiberStack::alloc(64 * 1024);
        assert!(stack.size() >= 64 * 1024);
        assert_eq!(stack.size() % PAGE_SIZE, 0);
        // Touch the writable region near the top.
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }

    #[test]
    fn rounds_tiny_requests_up() {
        let stack = FiberStack::alloc(1);
        assert_eq!(stack.size(), PAGE_SIZE);
    }

    #[test]
    fn round_up_math() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
