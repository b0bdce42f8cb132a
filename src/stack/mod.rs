//! Stacks that coroutines execute on.
//!
//! In most cases the owned [`DefaultStack`] is sufficient: it is allocated
//! from the OS, page-aligned, and (with the `guard-pages` feature, on by
//! default) flanked by an inaccessible page at each end so an overflow trips
//! a fault instead of silently corrupting neighbouring memory.
//!
//! A caller-supplied buffer can be used instead through [`BorrowedStack`].
//! Borrowed buffers are clipped to 16-byte alignment, never freed and never
//! guarded: the caller may lack the permissions to change page protection
//! and the buffer need not be page-aligned.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

use crate::util::{align_down, align_up};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use self::unix::DefaultStack;
    } else if #[cfg(windows)] {
        mod windows;
        pub use self::windows::DefaultStack;
    }
}

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Minimum size of a stack, excluding guard pages.
///
/// This leaves room for the coroutine's control block at the stack base, the
/// scratch arena and the entry function's frame.
pub const MIN_STACK_SIZE: usize = 8192;

/// Stack size used when no explicit size is requested.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// A trait for objects that hold ownership of a stack.
///
/// # Safety
///
/// `base` and `limit` must be aligned to [`STACK_ALIGNMENT`] and delimit a
/// region that stays valid and unmoved for as long as `self` is alive. The
/// interior between `usable_limit` and `base` must be readable and
/// writable.
pub unsafe trait Stack {
    /// Returns the base address of the stack. This is the highest address
    /// since stacks grow downwards.
    fn base(&self) -> StackPointer;

    /// Returns the limit address of the stack, including any guard pages.
    /// This is the lowest address of the allocation.
    fn limit(&self) -> StackPointer;

    /// Returns the lowest address that may be read or written: the limit
    /// with any low guard page skipped.
    fn usable_limit(&self) -> StackPointer;

    /// On Windows, certain fields must be written to the Thread Information
    /// Block when switching to another stack. This function returns the
    /// values that describe this stack.
    #[cfg(windows)]
    fn teb_fields(&self) -> StackTebFields;
}

/// Fields in the Thread Information Block which travel with a stack. These
/// are the same fields that the `SwitchToFiber` API swaps.
#[cfg(windows)]
#[derive(Clone, Copy, Debug)]
#[allow(non_snake_case)]
#[allow(missing_docs)]
pub struct StackTebFields {
    pub StackBase: usize,
    pub StackLimit: usize,
    pub DeallocationStack: usize,
    pub FiberStorage: usize,
}

/// A mutable reference to a stack can be used as a stack. The coroutine
/// running on it is then bound to the lifetime of the reference.
unsafe impl<'a, S: Stack> Stack for &'a mut S {
    #[inline]
    fn base(&self) -> StackPointer {
        (**self).base()
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        (**self).limit()
    }

    #[inline]
    fn usable_limit(&self) -> StackPointer {
        (**self).usable_limit()
    }

    #[inline]
    #[cfg(windows)]
    fn teb_fields(&self) -> StackTebFields {
        (**self).teb_fields()
    }
}

/// A stack living in a caller-supplied byte buffer.
///
/// The buffer is used as-is: both ends are clipped to 16-byte alignment, no
/// guard pages are installed and nothing is freed when the stack is
/// dropped. Sizing the buffer is the caller's contract; it must hold at
/// least [`MIN_STACK_SIZE`] usable bytes.
pub struct BorrowedStack<'a> {
    base: StackPointer,
    limit: StackPointer,
    marker: PhantomData<&'a mut [u8]>,
}

impl<'a> BorrowedStack<'a> {
    /// Wraps `buffer` for use as a coroutine stack.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        let start = buffer.as_mut_ptr() as usize;
        let limit = align_up(start, STACK_ALIGNMENT);
        let base = align_down(start + buffer.len(), STACK_ALIGNMENT);
        debug_assert!(
            base.checked_sub(limit).is_some() && base - limit >= MIN_STACK_SIZE,
            "supplied stack buffer is smaller than MIN_STACK_SIZE"
        );
        BorrowedStack {
            base: StackPointer::new(base).unwrap(),
            limit: StackPointer::new(limit).unwrap(),
            marker: PhantomData,
        }
    }
}

unsafe impl<'a> Stack for BorrowedStack<'a> {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        self.limit
    }

    #[inline]
    fn usable_limit(&self) -> StackPointer {
        self.limit
    }

    #[inline]
    #[cfg(windows)]
    fn teb_fields(&self) -> StackTebFields {
        StackTebFields {
            StackBase: self.base.get(),
            StackLimit: self.limit.get(),
            DeallocationStack: self.limit.get(),
            FiberStorage: 0,
        }
    }
}

#[test]
fn assert_send_sync() {
    fn send<T: Send>() {}
    fn sync<T: Sync>() {}
    send::<DefaultStack>();
    sync::<DefaultStack>();
}
