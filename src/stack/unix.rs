use std::io::{Error, Result};
use std::ptr;

use super::{Stack, StackPointer, MIN_STACK_SIZE};
use crate::util::align_up;

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Default stack implementation which uses `mmap`.
pub struct DefaultStack {
    base: StackPointer,
    mmap_len: usize,
    guard_len: usize,
}

impl DefaultStack {
    /// Creates a new stack which has at least the given capacity.
    ///
    /// With the `guard-pages` feature an extra inaccessible page is mapped
    /// at each end of the allocation.
    pub fn new(size: usize) -> Result<Self> {
        // Apply minimum stack size and round up to a page boundary.
        let page_size = page_size();
        let len = align_up(size.max(MIN_STACK_SIZE), page_size);
        let guard_len = if cfg!(feature = "guard-pages") {
            page_size
        } else {
            0
        };
        let mmap_len = len
            .checked_add(2 * guard_len)
            .expect("integer overflow while calculating stack size");

        // Linux takes MAP_STACK as a hint that the mapping backs a stack;
        // OpenBSD requires it on anything used as one. Darwin has no such
        // flag.
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "openbsd", target_os = "freebsd"))] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            // Reserve the whole region inaccessible first, then open up the
            // interior. Whatever is left protected at the ends becomes the
            // guard pages.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this
            // will be dropped and the memory will be unmapped.
            let out = Self {
                base: StackPointer::new(mmap as usize + mmap_len - guard_len).unwrap(),
                mmap_len,
                guard_len,
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(guard_len).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }
}

impl Default for DefaultStack {
    fn default() -> Self {
        Self::new(super::DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl Drop for DefaultStack {
    fn drop(&mut self) {
        unsafe {
            let mmap = self.base.get() + self.guard_len - self.mmap_len;
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

unsafe impl Stack for DefaultStack {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        StackPointer::new(self.base.get() + self.guard_len - self.mmap_len).unwrap()
    }

    #[inline]
    fn usable_limit(&self) -> StackPointer {
        StackPointer::new(self.limit().get() + self.guard_len).unwrap()
    }
}
