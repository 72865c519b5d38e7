//! Context switching for AArch64.
//!
//! Same protocol as the x86_64 version; see that file for the detailed
//! walkthrough. Differences are commented here.
//!
//! ## Stack layout
//!
//! A coroutine parked at a suspension point:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Root func    |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! ~     ...      ~
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Saved PC     |
//! +--------------+
//! | Saved X29    |
//! +--------------+
//! | Saved X19    |
//! +--------------+  <- Saved coroutine stack pointer.
//! ```
//!
//! The driver stack while the coroutine runs:
//!
//! ```text
//! +-----------+
//! | Padding   |
//! +-----------+
//! | Saved X19 |
//! +-----------+
//! | Saved PC  |
//! +-----------+
//! | Saved X29 |
//! +-----------+  <- Parent link points here.
//! ```
//!
//! A freshly initialized stack:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Root func    |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! ~ Bootstrap    ~
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Trampoline   |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Padding      |
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, RootFunc};
use crate::stack::{Stack, StackPointer};

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

global_asm!(
    ".balign 4",
    asm_function_begin!("stackful_coro_trampoline"),
    ".cfi_startproc",
    cfi_signal_frame!(),
    // On entry:
    // - SP points to the top of the driver stack.
    // - LR holds the return address into the driver.
    // - X19 and X29 hold the driver's values.
    // - X2 points to the top of the coroutine stack.
    // - X1 holds the coroutine stack base.
    // - X0 holds the word passed to switch_and_link.
    //
    // Save X29, LR and X19 on the driver stack (32 bytes to keep SP aligned).
    "stp x29, lr, [sp, #-32]!",
    "str x19, [sp, #16]",
    // Publish the driver stack pointer and point X1 at the parent link.
    "mov x3, sp",
    "str x3, [x1, #-16]!",
    // Move onto the coroutine stack, dropping the padding and our address.
    "add sp, x2, #32",
    "mov x29, x1",
    // CFA = [x29] + 32.
    // 0x0f: DW_CFA_def_cfa_expression, 5: length,
    // 0x8d 0x00: DW_OP_breg29 (x29 + 0), 0x06: DW_OP_deref,
    // 0x23 0x20: DW_OP_plus_uconst 32
    ".cfi_escape 0x0f, 5, 0x8d, 0x00, 0x06, 0x23, 0x20",
    ".cfi_offset x19, -16",
    ".cfi_offset lr, -24",
    ".cfi_offset x29, -32",
    "mov x2, sp",
    // Hand-written call, see the x86_64 trampoline.
    "adr lr, 2f",
    "ldr x3, [x1, #8]",
    "br x3",
    "2:",
    "brk #0",
    ".cfi_endproc",
    asm_function_end!("stackful_coro_trampoline"),
);

extern "C" {
    fn stackful_coro_trampoline();
}

/// Lays out a fresh stack so that the first `switch_and_link` into it calls
/// `func(arg, parent_link, &mut obj)` on that stack.
#[inline]
pub unsafe fn init_stack<T>(stack: &impl Stack, func: RootFunc<T>, obj: T) -> StackPointer {
    let mut sp = stack.base().get();

    push(&mut sp, Some(func as StackWord));
    push(&mut sp, None);

    allocate_obj_on_stack(&mut sp, 16, obj);
    debug_assert_eq!(sp % STACK_ALIGNMENT, 0);

    push(&mut sp, None);
    push(&mut sp, Some(stackful_coro_trampoline as StackWord));

    // switch_and_link reads the target PC 16 bytes above the stack pointer.
    push(&mut sp, None);
    push(&mut sp, None);

    StackPointer::new_unchecked(sp)
}

/// Transfers control into a coroutine, passing `arg` along.
#[inline]
pub unsafe fn switch_and_link(
    arg: usize,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (usize, Option<StackPointer>) {
    let (ret_val, ret_sp): (usize, usize);

    asm!(
        "ldr x3, [x2, #16]",
        "blr x3",

        // Back on our stack:
        // - X2: the driver stack pointer.
        // - X1: the coroutine stack pointer.
        // - X0: the word passed from the coroutine.
        "add sp, x2, #32",

        inlateout("x0") arg => ret_val,
        lateout("x1") ret_sp,
        in("x1") stack_base.get() as u64,
        in("x2") sp.get() as u64,

        // X19 and X29 are reserved and saved by hand; the rest of the
        // callee-saved registers are listed here.
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the running coroutine and returns control to its driver.
#[inline(always)]
pub unsafe fn switch_yield(arg: usize, parent_link: *mut StackPointer) -> usize {
    let ret_val;

    asm!(
        // Save X19 and X29 and reserve the slot for our resume address.
        "stp x19, x29, [sp, #-32]!",
        "adr lr, 2f",
        "str lr, [sp, #16]",

        "ldr x2, [x2]",
        "mov x1, sp",

        // Restore the driver's X19, X29 and LR.
        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",

        "ret",

        // Resumed by switch_and_link:
        // - SP points to the top of the driver stack.
        // - LR holds the return address into the driver.
        // - X2 points to the top of our stack.
        // - X1 holds our stack base.
        // - X0 holds the word passed to switch_and_link.
        "2:",

        "stp x29, lr, [sp, #-32]!",
        "str x19, [sp, #16]",
        "mov x3, sp",
        "str x3, [x1, #-16]",

        "ldp x19, x29, [x2]",
        "add sp, x2, #32",

        inlateout("x0") arg => ret_val,
        in("x2") parent_link as u64,
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    ret_val
}
