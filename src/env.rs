//! The per-coroutine execution environment.
//!
//! While a coroutine body runs, an [`Environment`] lives in the entry
//! function's frame on the coroutine's own stack. It carries a fixed-size
//! scratch arena for short-lived allocations that are released in bulk when
//! the body returns, the identity of the coroutine currently running, and
//! the thread that is driving it. The environment of the innermost running
//! coroutine is reachable through [`Environment::with_current`]; nested
//! coroutines form a chain, with each resume pushing its environment and
//! each suspension popping back to the outer one.
//!
//! The environment is also how completion is defined: the coroutine handle
//! holds a pointer to it which the entry function publishes before the
//! first resume and clears when the body returns. A handle whose
//! environment pointer is nil after having been non-nil is done.

use core::cell::Cell;
use core::mem;
use core::ptr;
use std::thread::ThreadId;

use crate::util::align_up;

/// Bytes reserved on each coroutine stack for the scratch arena.
pub const TEMPORARY_STORAGE_SIZE: usize = 4096;

std::thread_local! {
    static ACTIVE: Cell<*const Environment> = const { Cell::new(ptr::null()) };
}

/// Makes `env` the ambient environment, returning the previous one so the
/// caller can restore it after the matching switch.
pub(crate) fn swap_active(env: *const Environment) -> *const Environment {
    ACTIVE.with(|active| active.replace(env))
}

/// State observed by a coroutine body while it runs.
pub struct Environment {
    scratch: ScratchArena,
    // Stack header of the coroutine this environment belongs to,
    // type-erased. Used only for identity.
    current: Cell<*mut ()>,
    // Thread driving the current resume. None between resumes.
    thread: Cell<Option<ThreadId>>,
}

impl Environment {
    pub(crate) fn new(scratch: ScratchArena, current: *mut ()) -> Self {
        Environment {
            scratch,
            current: Cell::new(current),
            thread: Cell::new(None),
        }
    }

    /// Runs `f` with the environment of the innermost running coroutine, or
    /// returns `None` when called outside any coroutine.
    pub fn with_current<R>(f: impl FnOnce(&Environment) -> R) -> Option<R> {
        ACTIVE.with(|active| {
            let env = active.get();
            if env.is_null() {
                None
            } else {
                // The pointer was published by a resume on this thread and
                // stays valid until that resume regains control.
                Some(f(unsafe { &*env }))
            }
        })
    }

    /// The scratch arena of this coroutine.
    pub fn scratch(&self) -> &ScratchArena {
        &self.scratch
    }

    /// The thread currently driving this coroutine.
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread.get()
    }

    /// Identity of the running coroutine, for comparisons only.
    pub fn coroutine_id(&self) -> *mut () {
        self.current.get()
    }

    pub(crate) fn set_thread(&self, thread: ThreadId) {
        self.thread.set(Some(thread));
    }

    pub(crate) fn set_current(&self, current: *mut ()) {
        self.current.set(current);
    }
}

/// Bump allocator over a byte buffer on the coroutine's stack.
///
/// Allocations are handed out front to back and released all at once when
/// the body returns. `Drop` implementations of allocated values never run,
/// so the arena is meant for plain data that the body wants to outlive its
/// inner scopes without touching the heap.
pub struct ScratchArena {
    base: *mut u8,
    capacity: usize,
    used: Cell<usize>,
}

impl ScratchArena {
    /// # Safety
    ///
    /// `base` must point to `capacity` writable bytes that outlive the
    /// arena.
    pub(crate) unsafe fn from_raw(base: *mut u8, capacity: usize) -> Self {
        ScratchArena {
            base,
            capacity,
            used: Cell::new(0),
        }
    }

    /// Allocates `value` in the arena, returning `None` when the arena is
    /// exhausted. The value is never dropped; its memory is released in bulk
    /// when the coroutine body returns.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> Option<&mut T> {
        let start = align_up(self.used.get(), mem::align_of::<T>());
        let end = start.checked_add(mem::size_of::<T>())?;
        if end > self.capacity {
            return None;
        }
        self.used.set(end);
        unsafe {
            let ptr = self.base.add(start) as *mut T;
            ptr.write(value);
            Some(&mut *ptr)
        }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Releases everything at once. Existing allocations must no longer be
    /// referenced, which is why this is restricted to the entry function.
    pub(crate) fn reset(&self) {
        self.used.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(buf: &mut [u8]) -> ScratchArena {
        unsafe { ScratchArena::from_raw(buf.as_mut_ptr(), buf.len()) }
    }

    #[test]
    fn bump_allocation() {
        let mut buf = [0u8; 64];
        let scratch = arena(&mut buf);
        let a = scratch.alloc(1u8).unwrap();
        let b = scratch.alloc(2u64).unwrap();
        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
        assert_eq!(&*b as *const u64 as usize % mem::align_of::<u64>(), 0);
        assert_eq!(scratch.used(), 16);
    }

    #[test]
    fn exhaustion() {
        let mut buf = [0u8; 16];
        let scratch = arena(&mut buf);
        assert!(scratch.alloc([0u8; 16]).is_some());
        assert!(scratch.alloc(0u8).is_none());
        scratch.reset();
        assert!(scratch.alloc(0u8).is_some());
    }

    #[test]
    fn no_ambient_environment_outside_coroutines() {
        assert_eq!(Environment::with_current(|_| ()), None);
    }
}
