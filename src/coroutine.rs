use core::cell::Cell;
use core::hint::unreachable_unchecked;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop, MaybeUninit};
use core::ptr::{self, NonNull};
use std::thread::{self, ThreadId};

use crate::arch::{self, MachineContext};
use crate::env::{self, Environment, ScratchArena, TEMPORARY_STORAGE_SIZE};
use crate::stack::{DefaultStack, Stack, STACK_ALIGNMENT};
#[cfg(feature = "stack-usage")]
use crate::usage::{self, StackUsage};
use crate::util::align_down;

/// Value returned from resuming a coroutine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoroutineResult<Yield, Return> {
    /// Value returned by a coroutine suspending itself with a `Yielder`.
    Yield(Yield),

    /// Value returned by a coroutine returning from its main function.
    Return(Return),
}

impl<Yield, Return> CoroutineResult<Yield, Return> {
    /// Returns the `Yield` value as an `Option<Yield>`.
    pub fn as_yield(self) -> Option<Yield> {
        match self {
            CoroutineResult::Yield(val) => Some(val),
            CoroutineResult::Return(_) => None,
        }
    }

    /// Returns the `Return` value as an `Option<Return>`.
    pub fn as_return(self) -> Option<Return> {
        match self {
            CoroutineResult::Yield(_) => None,
            CoroutineResult::Return(val) => Some(val),
        }
    }
}

// The two sides of the switch boundary plus the slots that values travel
// through. Written at the base of the coroutine's own stack so that every
// pointer the suspended side holds stays valid even when the handle moves.
#[repr(C)]
struct Link<Input, Yield> {
    // Machine state of the resumer while the coroutine runs.
    caller: MachineContext,

    // Machine state of the coroutine while it is suspended.
    callee: MachineContext,

    // Execution environment of the running body. Published by the entry
    // function during the handshake and cleared when the body returns,
    // which is what defines completion.
    env: Cell<*const Environment>,

    // Value passed into the coroutine by the pending resume.
    input: Cell<Option<Input>>,

    // Value the coroutine suspended with.
    yielded: Cell<Option<Yield>>,
}

#[repr(C)]
struct StackHeader<Input, Yield, Return> {
    link: Link<Input, Yield>,

    // Value the body returned with, consumed by the final resume.
    returned: Cell<Option<Return>>,
}

impl<Input, Yield, Return> StackHeader<Input, Yield, Return> {
    fn new() -> Self {
        StackHeader {
            link: Link {
                caller: MachineContext::new(),
                callee: MachineContext::new(),
                env: Cell::new(ptr::null()),
                input: Cell::new(None),
                yielded: Cell::new(None),
            },
            returned: Cell::new(None),
        }
    }
}

// Everything the entry function needs from the initializer: the user's
// closure. It lives in the initializer's frame only until the post-init
// handshake moves it onto the coroutine stack.
struct StartPack<F> {
    func: F,
}

/// Alias for a [`ScopedCoroutine`] with a `'static` lifetime.
///
/// This means that the function executing in the coroutine does not borrow
/// anything from its caller.
pub type Coroutine<Input, Yield, Return, Stack = DefaultStack> =
    ScopedCoroutine<'static, Input, Yield, Return, Stack>;

/// A coroutine wraps a closure and allows suspending its execution more than
/// once, returning a value each time.
///
/// The closure runs on its own private stack. Each [`resume`] switches onto
/// that stack and runs until the closure suspends through its [`Yielder`] or
/// returns; each suspension switches back to whoever resumed last, with all
/// local state parked in place until the next resume.
///
/// # Construction
///
/// Building a coroutine drives a hidden first switch: the entry code on the
/// new stack sets up the per-coroutine [`Environment`] and copies the
/// closure over before control comes back, so the returned handle is fully
/// constructed and [`is_done`] is meaningful immediately.
///
/// # Thread affinity
///
/// A coroutine is pinned to the thread that created it; `resume` checks
/// this. The handle is deliberately `!Send` to make the check
/// unreachable from safe code.
///
/// ```compile_fail
/// fn send<T: Send>() {}
/// send::<coswitch::Coroutine<(), (), ()>>();
/// ```
///
/// # Lifetime
///
/// The `'a` lifetime here refers to the lifetime of the closure and ensures
/// that the coroutine doesn't outlive anything the closure borrows.
///
/// # Dropping and cancellation
///
/// Dropping (or [`deinit`]-ing) a suspended coroutine releases its stack
/// without running the rest of the body: nothing ever unwinds across the
/// switch boundary, so destructors of values parked on the coroutine stack
/// do not run. A body that owns resources beyond the scratch arena must
/// release them before its last suspension point.
///
/// [`resume`]: ScopedCoroutine::resume
/// [`is_done`]: ScopedCoroutine::is_done
/// [`deinit`]: ScopedCoroutine::deinit
pub struct ScopedCoroutine<'a, Input, Yield, Return, S: Stack> {
    // Stack that the coroutine is executing on. None once deinitialized.
    stack: Option<S>,

    // Control block at the base of that stack. Cleared together with the
    // stack, and before it, so it can never dangle while Some.
    header: Option<NonNull<StackHeader<Input, Yield, Return>>>,

    // Thread that created the coroutine and may resume it.
    home_thread: ThreadId,

    // Whether resume has been called at least once.
    started: bool,

    // We want to be covariant over 'a, Yield and Return, and contravariant
    // over Input.
    marker: PhantomData<&'a fn(Input) -> CoroutineResult<Yield, Return>>,

    // Coroutine must be !Send.
    marker2: PhantomData<*mut ()>,
}

// Coroutines can be Sync if the stack is Sync: shared references only allow
// the read-only queries.
unsafe impl<Input, Yield, Return, S: Stack + Sync> Sync
    for ScopedCoroutine<'_, Input, Yield, Return, S>
{
}

impl<'a, Input, Yield, Return> ScopedCoroutine<'a, Input, Yield, Return, DefaultStack> {
    /// Creates a new coroutine which will execute `func` on a freshly
    /// allocated [`DefaultStack`].
    ///
    /// # Panics
    ///
    /// Panics if the stack allocation fails.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&Yielder<Input, Yield>, Input) -> Return,
        F: 'a,
    {
        Self::with_stack(Default::default(), f)
    }
}

impl<'a, Input, Yield, Return, S: Stack> ScopedCoroutine<'a, Input, Yield, Return, S> {
    /// Creates a new coroutine which will execute `func` on the given stack.
    ///
    /// This drives the construction handshake described on
    /// [`ScopedCoroutine`]: by the time this returns, the entry code on the
    /// new stack has run once and the closure has been moved over.
    pub fn with_stack<F>(stack: S, f: F) -> Self
    where
        F: FnOnce(&Yielder<Input, Yield>, Input) -> Return,
        F: 'a,
    {
        unsafe {
            // The control block sits at the base of the stack; everything
            // below it is execution space.
            let base = stack.base().get();
            let header_size = mem::size_of::<StackHeader<Input, Yield, Return>>();
            let header = align_down(base - header_size, STACK_ALIGNMENT)
                as *mut StackHeader<Input, Yield, Return>;
            let stack_top = header as usize;

            #[cfg(feature = "stack-usage")]
            usage::fill(stack.usable_limit().get(), stack_top);

            header.write(StackHeader::new());

            let mut pack = ManuallyDrop::new(StartPack { func: f });
            arch::init_context(
                &mut (*header).link.callee,
                &stack,
                stack_top,
                coroutine_entry::<Input, Yield, Return, F>,
                header as *mut (),
                &mut pack as *mut ManuallyDrop<StartPack<F>> as *mut (),
            );

            // Handshake: run the entry code up to its first suspension so
            // the coroutine is fully constructed before anyone resumes it.
            // The entry code takes ownership of the pack, which is why it is
            // wrapped in ManuallyDrop here.
            arch::switch_context(
                ptr::addr_of_mut!((*header).link.caller),
                ptr::addr_of!((*header).link.callee),
            );
            debug_assert!(!(*header).link.env.get().is_null());

            ScopedCoroutine {
                stack: Some(stack),
                header: Some(NonNull::new_unchecked(header)),
                home_thread: thread::current().id(),
                started: false,
                marker: PhantomData,
                marker2: PhantomData,
            }
        }
    }

    /// Resumes execution of this coroutine.
    ///
    /// This function will transfer execution to the coroutine and resume
    /// from where it last left off. The `input` value is handed to the
    /// closure: as its second argument on the first resume, or as the return
    /// value of [`Yielder::suspend`] afterwards.
    ///
    /// If the coroutine suspends then this function returns
    /// [`CoroutineResult::Yield`] with the value passed to `suspend`; if the
    /// closure returns then it returns [`CoroutineResult::Return`] with the
    /// closure's return value.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine has already finished executing, has been
    /// deinitialized, or is resumed from a thread other than the one that
    /// created it.
    pub fn resume(&mut self, input: Input) -> CoroutineResult<Yield, Return> {
        assert_eq!(
            thread::current().id(),
            self.home_thread,
            "coroutine resumed from a thread other than its owner"
        );
        let header = self
            .header
            .expect("attempt to resume a deinitialized coroutine");
        unsafe {
            let header = header.as_ptr();
            let link = ptr::addr_of_mut!((*header).link);
            let env = (*link).env.get();
            assert!(!env.is_null(), "attempt to resume a completed coroutine");

            // Refresh the fields of the environment that describe this
            // particular resume.
            (*env).set_thread(self.home_thread);
            (*env).set_current(header as *mut ());
            (*link).input.set(Some(input));
            self.started = true;

            // Make the coroutine's environment the ambient one for the
            // duration of the switch; restoring the outer value afterwards
            // keeps nested coroutines consistent.
            let outer = env::swap_active(env);
            arch::switch_context(
                ptr::addr_of_mut!((*link).caller),
                ptr::addr_of!((*link).callee),
            );
            env::swap_active(outer);

            if (*link).env.get().is_null() {
                CoroutineResult::Return(
                    (*header)
                        .returned
                        .take()
                        .expect("completed coroutine produced no return value"),
                )
            } else {
                CoroutineResult::Yield(
                    (*link)
                        .yielded
                        .take()
                        .expect("suspended coroutine produced no yield value"),
                )
            }
        }
    }

    /// Returns whether this coroutine has been resumed at least once.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Returns whether this coroutine has finished executing.
    ///
    /// A coroutine that has returned from its closure can no longer be
    /// resumed. A deinitialized coroutine reports done as well.
    pub fn is_done(&self) -> bool {
        match self.header {
            Some(header) => unsafe { (*header.as_ptr()).link.env.get().is_null() },
            None => true,
        }
    }

    /// Returns whether this coroutine still holds a stack and can be
    /// queried or resumed. False only after [`deinit`].
    ///
    /// [`deinit`]: ScopedCoroutine::deinit
    pub fn is_initialized(&self) -> bool {
        self.header.is_some()
    }

    /// Releases the coroutine's stack early, before the handle is dropped.
    ///
    /// Idempotent. If the coroutine is still suspended its body is simply
    /// abandoned: nothing unwinds through it, so values parked on the stack
    /// are leaked rather than dropped (see the type-level documentation).
    pub fn deinit(&mut self) {
        #[cfg(feature = "stack-usage")]
        if let (Some(header), Some(stack)) = (self.header, self.stack.as_ref()) {
            let usage =
                unsafe { usage::scan(stack.usable_limit().get(), header.as_ptr() as usize) };
            debug_assert!(!usage.overflow, "coroutine stack overflow detected");
        }
        self.header = None;
        self.stack = None;
    }

    /// Extracts the stack from a coroutine that has finished executing.
    ///
    /// This allows the stack to be re-used for another coroutine.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine has not completed or was already
    /// deinitialized.
    pub fn into_stack(mut self) -> S {
        assert!(
            self.is_done(),
            "cannot extract stack from an incomplete coroutine"
        );
        self.header = None;
        self.stack.take().expect("stack already released")
    }

    /// Reports how much of the stack has ever been used, based on the
    /// sentinel fill done at construction.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine was deinitialized.
    #[cfg(feature = "stack-usage")]
    pub fn stack_usage(&self) -> StackUsage {
        let header = self
            .header
            .expect("stack usage requires a live coroutine");
        let stack = self.stack.as_ref().expect("stack already released");
        unsafe { usage::scan(stack.usable_limit().get(), header.as_ptr() as usize) }
    }
}

impl<'a, Input, Yield, Return, S: Stack> Drop for ScopedCoroutine<'a, Input, Yield, Return, S> {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// `Yielder` is an interface provided to a coroutine which allows it to
/// suspend itself and pass values in and out of the coroutine.
///
/// A `Yielder` only ever exists inside a running coroutine body, which is
/// what makes suspension from outside a coroutine unrepresentable.
pub struct Yielder<Input, Yield> {
    link: NonNull<Link<Input, Yield>>,
    marker: PhantomData<fn(Yield) -> Input>,
}

impl<Input, Yield> Yielder<Input, Yield> {
    /// Suspends the execution of the currently running coroutine.
    ///
    /// This function will switch control back to the original caller of
    /// [`ScopedCoroutine::resume`]. It returns once `resume` is called
    /// again, yielding the input value passed to that call.
    pub fn suspend(&self, value: Yield) -> Input {
        unsafe {
            let link = self.link.as_ptr();
            (*link).yielded.set(Some(value));
            arch::switch_context(
                ptr::addr_of_mut!((*link).callee),
                ptr::addr_of!((*link).caller),
            );
            (*link)
                .input
                .take()
                .expect("coroutine resumed without an input value")
        }
    }
}

// Entry point of every coroutine, reached through the first-resume
// trampoline with the pointers that init_context parked in registers. Runs
// entirely on the coroutine's private stack.
unsafe extern "sysv64" fn coroutine_entry<Input, Yield, Return, F>(
    header: *mut (),
    pack: *mut (),
) -> !
where
    F: FnOnce(&Yielder<Input, Yield>, Input) -> Return,
{
    let header = header as *mut StackHeader<Input, Yield, Return>;
    let link = ptr::addr_of_mut!((*header).link);

    // The scratch arena occupies this frame for the whole life of the body.
    let mut scratch = MaybeUninit::<[u8; TEMPORARY_STORAGE_SIZE]>::uninit();
    let env = Environment::new(
        ScratchArena::from_raw(scratch.as_mut_ptr() as *mut u8, TEMPORARY_STORAGE_SIZE),
        header as *mut (),
    );

    // Move the start pack out of the initializer's frame; the original may
    // go out of scope once the handshake below returns to it.
    let pack = ptr::read(pack as *mut StartPack<F>);

    // Publish the environment, which completes construction, and hand
    // control straight back to the initializer.
    (*link).env.set(&env);
    arch::switch_context(
        ptr::addr_of_mut!((*link).callee),
        ptr::addr_of!((*link).caller),
    );

    // First real resume.
    let input = (*link)
        .input
        .take()
        .expect("coroutine resumed without an input value");
    let yielder = Yielder {
        link: NonNull::new_unchecked(link),
        marker: PhantomData,
    };

    // A panic in the body may not unwind into the trampoline frame below;
    // nothing crosses the switch boundary.
    let bomb = scopeguard::guard((), |()| {
        std::process::abort();
    });
    let returned = (pack.func)(&yielder, input);
    mem::forget(bomb);

    env.scratch().reset();
    (*header).returned.set(Some(returned));
    // Clearing the environment pointer is what marks the coroutine done.
    (*link).env.set(ptr::null());
    arch::switch_context(
        ptr::addr_of_mut!((*link).callee),
        ptr::addr_of!((*link).caller),
    );

    // The final switch never comes back: resuming a completed coroutine is
    // rejected before any switch.
    unreachable_unchecked()
}
