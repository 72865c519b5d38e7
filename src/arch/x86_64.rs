//! Context switching for x86_64 on System V platforms.
//!
//! ## Stack layout
//!
//! A coroutine parked at a suspension point:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Root func    |  <- Read once, by the trampoline on the bootstrap switch.
//! +--------------+
//! | Parent link  |  <- Rewritten on every switch_and_link. Points at the top
//! +--------------+     of the driver stack, which holds a saved RIP, RBP and
//! |              |     RBX in the same format as below.
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RIP    |  <- Saved coroutine stack pointer.
//! +--------------+
//! ```
//!
//! The driver stack while the coroutine runs:
//!
//! ```text
//! +-------------+
//! | Saved RBX   |
//! +-------------+
//! | Saved RIP   |  <- Together with the saved RBP this is a valid frame
//! +-------------+     record, so frame-pointer unwinders can walk from the
//! | Saved RBP   |     coroutine back into the driver.
//! +-------------+  <- Parent link points here.
//! ```
//!
//! A freshly initialized stack:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Root func    |
//! +--------------+
//! | Parent link  |  <- Not filled in yet.
//! +--------------+
//! ~ Bootstrap    ~  <- Rounded up to STACK_ALIGNMENT.
//! +--------------+
//! | Trampoline   |  <- Address of the bootstrap trampoline.
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, RootFunc};
use crate::stack::{Stack, StackPointer};

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

// The bootstrap trampoline. The first switch_and_link into a fresh stack
// "returns" here and this calls the root function on the new stack. The frame
// stays at the bottom of the coroutine stack for its whole life and carries the
// CFI that lets unwinders step from the coroutine into its driver.
global_asm!(
    ".balign 16",
    asm_function_begin!("stackful_coro_trampoline"),
    ".cfi_startproc",
    // Marked as a signal frame so that GDB accepts a stack switch to a lower
    // address than the parent frame.
    cfi_signal_frame!(),
    // On entry:
    // - RSP points to the top of the driver stack.
    // - RBP holds the driver's value.
    // - RDX points to the top of the coroutine stack.
    // - RSI holds the coroutine stack base.
    // - RDI holds the word passed to switch_and_link.
    //
    // Complete the frame record on the driver stack.
    "push rbp",
    // Publish the driver stack pointer in the parent link.
    "mov [rsi - 16], rsp",
    // RSI now points at the parent link: the second root argument.
    "sub rsi, 16",
    // Move onto the coroutine stack, dropping our own address.
    "lea rsp, [rdx + 8]",
    "mov rbp, rsi",
    // CFA = [rbp] + 24, skipping the 3 words saved on the driver stack.
    // 0x0f: DW_CFA_def_cfa_expression, 5: length,
    // 0x76 0x00: DW_OP_breg6 (rbp + 0), 0x06: DW_OP_deref,
    // 0x23 0x18: DW_OP_plus_uconst 24
    ".cfi_escape 0x0f, 5, 0x76, 0x00, 0x06, 0x23, 0x18",
    ".cfi_offset rbx, -8",
    ".cfi_offset rip, -16",
    ".cfi_offset rbp, -24",
    // Third root argument: the bootstrap object.
    "mov rdx, rsp",
    // Jump rather than call so the return stack predictor stays balanced with
    // the RETs in switch_yield.
    "lea rcx, [rip + 2f]",
    "push rcx",
    "jmp [rsi + 8]",
    "2:",
    // The root function never returns; this keeps the return address inside
    // the function bounds for unwinders.
    "int3",
    ".cfi_endproc",
    asm_function_end!("stackful_coro_trampoline"),
);

// Custom calling convention, only reachable from inline assembly.
extern "C" {
    fn stackful_coro_trampoline();
}

/// Lays out a fresh stack so that the first `switch_and_link` into it calls
/// `func(arg, parent_link, &mut obj)` on that stack.
#[inline]
pub unsafe fn init_stack<T>(stack: &impl Stack, func: RootFunc<T>, obj: T) -> StackPointer {
    let mut sp = stack.base().get();

    push(&mut sp, Some(func as StackWord));

    // Parent link, filled in by every switch_and_link.
    push(&mut sp, None);

    allocate_obj_on_stack(&mut sp, 16, obj);

    push(&mut sp, Some(stackful_coro_trampoline as StackWord));

    StackPointer::new_unchecked(sp)
}

/// Transfers control into a coroutine, passing `arg` along.
///
/// Returns the word handed back by the coroutine together with its new
/// stack pointer.
#[inline]
pub unsafe fn switch_and_link(
    arg: usize,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (usize, Option<StackPointer>) {
    let (ret_val, ret_sp): (usize, usize);

    asm!(
        // RBX is reserved by LLVM and cannot be listed as a clobber. RBP is
        // saved after the call to form a frame record.
        "push rbx",

        // Continue at the trampoline or at label 2 of switch_yield.
        "call [rdx]",

        // Back on our stack:
        // - RSI: the coroutine stack pointer.
        // - RDI: the word passed from the coroutine.
        "pop rbx",

        inlateout("rdi") arg => ret_val,
        lateout("rsi") ret_sp,
        in("rsi") stack_base.get() as u64,
        in("rdx") sp.get() as u64,

        // The remaining callee-saved registers. Listing them lets the compiler
        // spill only what is live around the switch.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the running coroutine and returns control to its driver.
///
/// The word returned is the one passed to the `switch_and_link` that resumes
/// this coroutine next.
// Must stay inlined: the RET below pairs with the CALL in switch_and_link.
#[inline(always)]
pub unsafe fn switch_yield(arg: usize, parent_link: *mut StackPointer) -> usize {
    let ret_val;

    asm!(
        "push rbp",
        "push rbx",

        // Resume address for the next switch_and_link.
        "lea rax, [rip + 2f]",
        "push rax",

        "mov rsi, rsp",

        // Load the driver stack pointer and restore its frame pointer.
        "mov rsp, [rdx]",
        "pop rbp",

        // Lands just after the CALL in switch_and_link.
        "ret",

        // Resumed by switch_and_link:
        // - RSP points to the top of the driver stack.
        // - RBP holds the driver's value.
        // - RDX points to the top of our stack, including the resume address.
        // - RSI holds our stack base.
        // - RDI holds the word passed to switch_and_link.
        "2:",

        "push rbp",
        "mov [rsi - 16], rsp",

        // Back onto our stack, dropping the resume address.
        "lea rsp, [rdx + 8]",

        "pop rbx",
        "pop rbp",

        inlateout("rdi") arg => ret_val,
        in("rdx") parent_link as u64,
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    ret_val
}
