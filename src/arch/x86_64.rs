//! Low level context switching for x86-64 SysV targets (Linux, macOS, BSD).
//!
//! The machine state of a suspended context is held in a [`MachineContext`]
//! record rather than being spilled onto its stack. A switch saves the
//! callee-saved state of the running side into one record, loads the other
//! record and jumps to the instruction pointer found there. Keeping the
//! state in a record means a suspended context can be inspected and a fresh
//! one can be synthesized without touching the target stack.
//!
//! The core operations are:
//! - `init_context` to synthesize the state that the first switch into a
//!   coroutine restores.
//! - `switch_context` to save the current state and resume another one.
//!
//! ## First resume
//!
//! A synthesized context does not point at the user's function directly. Its
//! instruction pointer targets a small trampoline which re-aligns the stack
//! (the context is entered by `jmp`, so the usual 8-byte bias from a pushed
//! return address is absent), moves the coroutine header and start-pack
//! pointers out of r13/r14 into the argument registers, pushes a terminal
//! pad as a fake return address and tail-jumps to the monomorphized entry
//! shim held in r15. The entry function never returns; the pad is an `int3`
//! that exists only so the shim has a plausible return address above it.
//!
//! ## What is preserved
//!
//! Exactly the SysV callee-saved set: rsp, rbp, rbx, r12-r15, MXCSR and the
//! x87 control word. Volatile registers do not survive a switch, which is
//! fine because `switch_context` is an out-of-line function with the C
//! calling convention and the compiler plans for their death at every call
//! site.

use core::arch::{asm, global_asm};

use crate::stack::Stack;

pub const STACK_ALIGNMENT: usize = 16;

/// Saved machine state of a suspended context.
///
/// Field offsets are baked into the assembly below; they are pinned by the
/// `offsets` test at the bottom of this file.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(16))]
pub struct MachineContext {
    rip: u64,   // 0x00
    rsp: u64,   // 0x08
    rbp: u64,   // 0x10
    rbx: u64,   // 0x18
    r12: u64,   // 0x20
    r13: u64,   // 0x28
    r14: u64,   // 0x30
    r15: u64,   // 0x38
    mxcsr: u32, // 0x40
    fcw: u16,   // 0x44
    _reserved: [u16; 5],
}

impl MachineContext {
    pub const fn new() -> Self {
        MachineContext {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: 0,
            fcw: 0,
            _reserved: [0; 5],
        }
    }
}

// The switch routine. The fences on both sides of the register transfer make
// every switch a serialization point, so no load or store can be hoisted
// across a suspension.
//
// The return address that `call` pushed for us *is* the resume point:
// restoring rsp+8 and jumping back to [rsp] replays the return that never
// happened.
global_asm!(
    ".balign 16",
    asm_function_begin!("coswitch_switch_context"),
    // rdi = from, rsi = to
    "mfence",
    "lfence",
    // Capture the resume point and the post-return stack pointer.
    "mov rax, [rsp]",
    "lea rcx, [rsp + 8]",
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rcx",
    "mov [rdi + 0x10], rbp",
    "mov [rdi + 0x18], rbx",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], r13",
    "mov [rdi + 0x30], r14",
    "mov [rdi + 0x38], r15",
    "stmxcsr dword ptr [rdi + 0x40]",
    "fnstcw word ptr [rdi + 0x44]",
    // Load the target context in the reverse order: x87 control word first,
    // then MXCSR, then the general registers, finally the stack pointer.
    "fldcw word ptr [rsi + 0x44]",
    "ldmxcsr dword ptr [rsi + 0x40]",
    "mov r15, [rsi + 0x38]",
    "mov r14, [rsi + 0x30]",
    "mov r13, [rsi + 0x28]",
    "mov r12, [rsi + 0x20]",
    "mov rbx, [rsi + 0x18]",
    "mov rbp, [rsi + 0x10]",
    "mov rsp, [rsi + 0x08]",
    "mfence",
    "lfence",
    "jmp qword ptr [rsi + 0x00]",
    asm_function_end!("coswitch_switch_context"),
);

// First-resume trampoline. Entered by `jmp` from switch_context with the
// register state synthesized by init_context:
// - RSP points at the prepared top of the coroutine stack (16-aligned).
// - R13 holds the coroutine stack-header pointer.
// - R14 holds the start-pack pointer.
// - R15 holds the monomorphized entry function.
global_asm!(
    ".balign 16",
    asm_function_begin!("coswitch_init_trampoline"),
    // Entered by jmp, so there is no return-address bias to undo; force the
    // alignment anyway in case the header computation ever changes.
    "and rsp, -16",
    // Argument registers for the entry function, which uses the sysv64 ABI
    // on every platform.
    "mov rdi, r13",
    "mov rsi, r14",
    // A fake return address keeps the entry function's frame layout honest:
    // it enters with rsp ≡ 8 (mod 16) exactly as if it had been called.
    concat!(
        "lea rax, [rip + ",
        asm_mangle!("coswitch_init_trampoline_return"),
        "]"
    ),
    "push rax",
    "jmp r15",
    asm_function_alt_entry!("coswitch_init_trampoline_return"),
    // Never executed: the entry function does not return.
    "int3",
    asm_function_end!("coswitch_init_trampoline"),
);

extern "C" {
    fn coswitch_switch_context(from: *mut MachineContext, to: *const MachineContext);
    fn coswitch_init_trampoline();
}

/// Saves the running side into `from`, restores `to` and resumes it.
///
/// Must stay out of line so the compiler treats it as an opaque C call; the
/// extern symbol guarantees that.
///
/// # Safety
///
/// `to` must hold a context previously saved by this function or built by
/// `init_context`, and its stack must still be alive.
#[inline]
pub unsafe fn switch_context(from: *mut MachineContext, to: *const MachineContext) {
    coswitch_switch_context(from, to);
}

/// Entry function reached on the first switch into a fresh context, with the
/// header and start-pack pointers as arguments. The sysv64 ABI is used on
/// all platforms so the trampoline can stay identical.
pub type EntryFunc = unsafe extern "sysv64" fn(header: *mut (), pack: *mut ()) -> !;

/// Builds the synthetic state restored by the first switch into a coroutine.
///
/// The floating-point control registers are captured from the calling
/// thread, so the coroutine inherits the initializer's rounding and
/// exception-mask configuration.
///
/// # Safety
///
/// `stack_top` must be a 16-aligned address inside the stack, with enough
/// room below it for the entry function's frame. `header` and `pack` must
/// stay valid until the first switch completes.
pub unsafe fn init_context<S: Stack>(
    ctx: &mut MachineContext,
    _stack: &S,
    stack_top: usize,
    entry: EntryFunc,
    header: *mut (),
    pack: *mut (),
) {
    debug_assert_eq!(stack_top % STACK_ALIGNMENT, 0);

    let (mxcsr, fcw) = fp_control();
    *ctx = MachineContext {
        rip: coswitch_init_trampoline as usize as u64,
        rsp: stack_top as u64,
        r13: header as u64,
        r14: pack as u64,
        r15: entry as usize as u64,
        mxcsr,
        fcw,
        ..MachineContext::new()
    };
}

/// Reads the current MXCSR register and x87 control word.
pub fn fp_control() -> (u32, u16) {
    let mut mxcsr: u32 = 0;
    let mut fcw: u16 = 0;
    unsafe {
        asm!(
            "stmxcsr dword ptr [{mxcsr}]",
            "fnstcw word ptr [{fcw}]",
            mxcsr = in(reg) &mut mxcsr,
            fcw = in(reg) &mut fcw,
            options(nostack),
        );
    }
    (mxcsr, fcw)
}

#[cfg(test)]
mod tests {
    use core::mem::{align_of, offset_of, size_of};

    use super::MachineContext;

    // The assembly above addresses the context by hard-coded offsets; this
    // pins the struct layout to them.
    #[test]
    fn offsets() {
        assert_eq!(offset_of!(MachineContext, rip), 0x00);
        assert_eq!(offset_of!(MachineContext, rsp), 0x08);
        assert_eq!(offset_of!(MachineContext, rbp), 0x10);
        assert_eq!(offset_of!(MachineContext, rbx), 0x18);
        assert_eq!(offset_of!(MachineContext, r12), 0x20);
        assert_eq!(offset_of!(MachineContext, r13), 0x28);
        assert_eq!(offset_of!(MachineContext, r14), 0x30);
        assert_eq!(offset_of!(MachineContext, r15), 0x38);
        assert_eq!(offset_of!(MachineContext, mxcsr), 0x40);
        assert_eq!(offset_of!(MachineContext, fcw), 0x44);
        assert_eq!(size_of::<MachineContext>(), 0x50);
        assert_eq!(align_of::<MachineContext>(), 16);
    }
}
