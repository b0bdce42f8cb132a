//! The Windows stack layout is simpler than the one the OS builds for
//! threads: the whole interior is committed up front and, with the
//! `guard-pages` feature, the page at each end is re-protected with
//! `PAGE_GUARD`. There is no lazy growth; the coroutine gets exactly what
//! was asked for.
//!
//! ```text
//! +------------------+  <- allocation top
//! | Guard page       |  [PAGE_READWRITE + PAGE_GUARD]
//! +------------------+  <- base(), TEB.StackBase
//! |                  |
//! ~ Usable stack     ~  [PAGE_READWRITE]
//! |                  |
//! +------------------+  <- usable_limit(), TEB.StackLimit
//! | Guard page       |  [PAGE_READWRITE + PAGE_GUARD]
//! +------------------+  <- limit(), TEB.DeallocationStack
//! ```

use std::io::{Error, Result};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_GUARD,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::{Stack, StackPointer, StackTebFields, MIN_STACK_SIZE};
use crate::util::align_up;

fn page_size() -> usize {
    unsafe {
        let mut sysinfo: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut sysinfo);
        assert!(sysinfo.dwPageSize.is_power_of_two());
        sysinfo.dwPageSize as usize
    }
}

/// Default stack implementation which uses `VirtualAlloc`.
pub struct DefaultStack {
    base: StackPointer,
    alloc_len: usize,
    guard_len: usize,
}

impl DefaultStack {
    /// Creates a new stack which has at least the given capacity.
    ///
    /// With the `guard-pages` feature an extra guard-flagged page is placed
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
        let alloc_len = len
            .checked_add(2 * guard_len)
            .expect("integer overflow while calculating stack size");

        unsafe {
            // Reserve and commit the whole region in one go; there is no
            // lazy growth to stage.
            let alloc_base = VirtualAlloc(
                ptr::null(),
                alloc_len,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            );
            if alloc_base.is_null() {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the VirtualProtect calls fail then
            // this will be dropped and the memory will be released.
            let alloc_base = alloc_base as usize;
            let out = Self {
                base: StackPointer::new(alloc_base + alloc_len - guard_len).unwrap(),
                alloc_len,
                guard_len,
            };

            if guard_len != 0 {
                let mut old = 0;
                if VirtualProtect(
                    alloc_base as *mut _,
                    guard_len,
                    PAGE_READWRITE | PAGE_GUARD,
                    &mut old,
                ) == 0
                {
                    return Err(Error::last_os_error());
                }
                if VirtualProtect(
                    out.base.get() as *mut _,
                    guard_len,
                    PAGE_READWRITE | PAGE_GUARD,
                    &mut old,
                ) == 0
                {
                    return Err(Error::last_os_error());
                }
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
            let alloc_base = self.limit().get() as *mut _;
            let ret = VirtualFree(alloc_base, 0, MEM_RELEASE);
            debug_assert!(ret != 0);
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
        StackPointer::new(self.base.get() + self.guard_len - self.alloc_len).unwrap()
    }

    #[inline]
    fn usable_limit(&self) -> StackPointer {
        StackPointer::new(self.limit().get() + self.guard_len).unwrap()
    }

    #[inline]
    fn teb_fields(&self) -> StackTebFields {
        StackTebFields {
            StackBase: self.base.get(),
            StackLimit: self.usable_limit().get(),
            DeallocationStack: self.limit().get(),
            FiberStorage: 0,
        }
    }
}
