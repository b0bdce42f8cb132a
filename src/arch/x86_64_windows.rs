//! Low level context switching for x86-64 Windows.
//!
//! Windows is sufficiently different that it gets its own file. Read the
//! generic x86_64 version first; only the differences are documented here:
//!
//! - The Win64 ABI additionally treats rdi, rsi and xmm6-xmm15 as
//!   callee-saved, so they join the [`MachineContext`] record.
//! - The Thread Information Block (reached through `gs:[0x30]`) carries the
//!   bounds of the current stack. The OS consults them for stack probes,
//!   guard-page handling and debugging, so they are swapped on every switch
//!   exactly like SwitchToFiber does: StackBase, StackLimit,
//!   DeallocationStack and FiberStorage.
//! - The switch routine itself follows the Win64 C calling convention
//!   (rcx/rdx), but the entry function keeps the sysv64 ABI so the
//!   trampoline is register-for-register the same as on other platforms.

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
    rip: u64,                // 0x00
    rsp: u64,                // 0x08
    rbp: u64,                // 0x10
    rbx: u64,                // 0x18
    rdi: u64,                // 0x20
    rsi: u64,                // 0x28
    r12: u64,                // 0x30
    r13: u64,                // 0x38
    r14: u64,                // 0x40
    r15: u64,                // 0x48
    stack_base: u64,         // 0x50  TIB StackBase
    stack_limit: u64,        // 0x58  TIB StackLimit
    deallocation_stack: u64, // 0x60  TIB DeallocationStack
    fiber_storage: u64,      // 0x68  TIB FiberStorage
    mxcsr: u32,              // 0x70
    fcw: u16,                // 0x74
    _reserved: [u16; 5],
    xmm: [[u8; 16]; 10],     // 0x80  xmm6..xmm15
}

impl MachineContext {
    pub const fn new() -> Self {
        MachineContext {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rbx: 0,
            rdi: 0,
            rsi: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            stack_base: 0,
            stack_limit: 0,
            deallocation_stack: 0,
            fiber_storage: 0,
            mxcsr: 0,
            fcw: 0,
            _reserved: [0; 5],
            xmm: [[0; 16]; 10],
        }
    }
}

// The switch routine, Win64 C calling convention. The TIB stack fields live
// at gs:[0x30] + {0x08, 0x10, 0x1478, 0x20}; they travel with the context so
// the OS always sees the bounds of the stack that is actually running.
global_asm!(
    ".balign 16",
    asm_function_begin!("coswitch_switch_context"),
    // rcx = from, rdx = to
    "mfence",
    "lfence",
    "mov r8, gs:[0x30]",
    // Capture the resume point and the post-return stack pointer.
    "mov rax, [rsp]",
    "lea r9, [rsp + 8]",
    "mov [rcx + 0x00], rax",
    "mov [rcx + 0x08], r9",
    "mov [rcx + 0x10], rbp",
    "mov [rcx + 0x18], rbx",
    "mov [rcx + 0x20], rdi",
    "mov [rcx + 0x28], rsi",
    "mov [rcx + 0x30], r12",
    "mov [rcx + 0x38], r13",
    "mov [rcx + 0x40], r14",
    "mov [rcx + 0x48], r15",
    "mov rax, [r8 + 0x8]",
    "mov [rcx + 0x50], rax", // StackBase
    "mov rax, [r8 + 0x10]",
    "mov [rcx + 0x58], rax", // StackLimit
    "mov rax, [r8 + 0x1478]",
    "mov [rcx + 0x60], rax", // DeallocationStack
    "mov rax, [r8 + 0x20]",
    "mov [rcx + 0x68], rax", // FiberStorage
    "stmxcsr dword ptr [rcx + 0x70]",
    "fnstcw word ptr [rcx + 0x74]",
    "movaps [rcx + 0x80], xmm6",
    "movaps [rcx + 0x90], xmm7",
    "movaps [rcx + 0xa0], xmm8",
    "movaps [rcx + 0xb0], xmm9",
    "movaps [rcx + 0xc0], xmm10",
    "movaps [rcx + 0xd0], xmm11",
    "movaps [rcx + 0xe0], xmm12",
    "movaps [rcx + 0xf0], xmm13",
    "movaps [rcx + 0x100], xmm14",
    "movaps [rcx + 0x110], xmm15",
    // Load the target context in the reverse order: x87 control word first,
    // then MXCSR, then the TIB fields, the xmm registers, the general
    // registers, finally the stack pointer.
    "fldcw word ptr [rdx + 0x74]",
    "ldmxcsr dword ptr [rdx + 0x70]",
    "mov rax, [rdx + 0x50]",
    "mov [r8 + 0x8], rax", // StackBase
    "mov rax, [rdx + 0x58]",
    "mov [r8 + 0x10], rax", // StackLimit
    "mov rax, [rdx + 0x60]",
    "mov [r8 + 0x1478], rax", // DeallocationStack
    "mov rax, [rdx + 0x68]",
    "mov [r8 + 0x20], rax", // FiberStorage
    "movaps xmm15, [rdx + 0x110]",
    "movaps xmm14, [rdx + 0x100]",
    "movaps xmm13, [rdx + 0xf0]",
    "movaps xmm12, [rdx + 0xe0]",
    "movaps xmm11, [rdx + 0xd0]",
    "movaps xmm10, [rdx + 0xc0]",
    "movaps xmm9, [rdx + 0xb0]",
    "movaps xmm8, [rdx + 0xa0]",
    "movaps xmm7, [rdx + 0x90]",
    "movaps xmm6, [rdx + 0x80]",
    "mov r15, [rdx + 0x48]",
    "mov r14, [rdx + 0x40]",
    "mov r13, [rdx + 0x38]",
    "mov r12, [rdx + 0x30]",
    "mov rsi, [rdx + 0x28]",
    "mov rdi, [rdx + 0x20]",
    "mov rbx, [rdx + 0x18]",
    "mov rbp, [rdx + 0x10]",
    "mov rsp, [rdx + 0x08]",
    "mfence",
    "lfence",
    "jmp qword ptr [rdx + 0x00]",
    asm_function_end!("coswitch_switch_context"),
);

// First-resume trampoline. Identical to the SysV one because the entry
// function uses the sysv64 ABI here too; see the generic x86_64 file.
global_asm!(
    ".balign 16",
    asm_function_begin!("coswitch_init_trampoline"),
    "and rsp, -16",
    "mov rdi, r13",
    "mov rsi, r14",
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
/// thread, and the TIB stack fields are taken from the target stack so the
/// OS sees correct bounds the moment the first switch lands.
///
/// # Safety
///
/// `stack_top` must be a 16-aligned address inside the stack, with enough
/// room below it for the entry function's frame. `header` and `pack` must
/// stay valid until the first switch completes.
pub unsafe fn init_context<S: Stack>(
    ctx: &mut MachineContext,
    stack: &S,
    stack_top: usize,
    entry: EntryFunc,
    header: *mut (),
    pack: *mut (),
) {
    debug_assert_eq!(stack_top % STACK_ALIGNMENT, 0);

    let teb = stack.teb_fields();
    let (mxcsr, fcw) = fp_control();
    *ctx = MachineContext {
        rip: coswitch_init_trampoline as usize as u64,
        rsp: stack_top as u64,
        r13: header as u64,
        r14: pack as u64,
        r15: entry as usize as u64,
        stack_base: teb.StackBase as u64,
        stack_limit: teb.StackLimit as u64,
        deallocation_stack: teb.DeallocationStack as u64,
        fiber_storage: teb.FiberStorage as u64,
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
        assert_eq!(offset_of!(MachineContext, rdi), 0x20);
        assert_eq!(offset_of!(MachineContext, rsi), 0x28);
        assert_eq!(offset_of!(MachineContext, r12), 0x30);
        assert_eq!(offset_of!(MachineContext, r13), 0x38);
        assert_eq!(offset_of!(MachineContext, r14), 0x40);
        assert_eq!(offset_of!(MachineContext, r15), 0x48);
        assert_eq!(offset_of!(MachineContext, stack_base), 0x50);
        assert_eq!(offset_of!(MachineContext, stack_limit), 0x58);
        assert_eq!(offset_of!(MachineContext, deallocation_stack), 0x60);
        assert_eq!(offset_of!(MachineContext, fiber_storage), 0x68);
        assert_eq!(offset_of!(MachineContext, mxcsr), 0x70);
        assert_eq!(offset_of!(MachineContext, fcw), 0x74);
        assert_eq!(offset_of!(MachineContext, xmm), 0x80);
        assert_eq!(size_of::<MachineContext>(), 0x120);
        assert_eq!(align_of::<MachineContext>(), 16);
    }
}
