//! The only place in the crate that touches machine registers.
//!
//! Each architecture module exports the same three operations:
//! - `init_stack` lays out a fresh stack so that the first switch into it
//!   lands in `stackful_coro_trampoline`, which then calls the coroutine root on
//!   the new stack.
//! - `switch_and_link` saves the driver's state, records it in the parent link
//!   at the base of the coroutine stack and resumes the coroutine.
//! - `switch_yield` saves the coroutine's state and returns to the driver
//!   through the parent link.
//!
//! Everything above this module deals in `StackPointer` values only, which act
//! as the saved continuations of a suspended context.

use core::mem;

use crate::stack::StackPointer;

// Helper macros to deal with the differences between ELF and Mach-O assembly.
cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        macro_rules! asm_mangle {
            ($name:literal) => { concat!("_", $name) };
        }
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".private_extern ", asm_mangle!($name), "\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                ""
            };
        }
        // Darwin refuses to unwind through signal frames.
        macro_rules! cfi_signal_frame {
            () => { "" }
        }
    } else {
        macro_rules! asm_mangle {
            ($name:literal) => { $name };
        }
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".hidden ", asm_mangle!($name), "\n",
                    ".type ", asm_mangle!($name), ", @function\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                concat!(".size ", asm_mangle!($name), ", . - ", asm_mangle!($name), "\n")
            };
        }
        macro_rules! cfi_signal_frame {
            () => { ".cfi_signal_frame" }
        }
    }
}

/// Signature of the function placed at the root of every coroutine stack.
///
/// `arg` is the word passed to the first `switch_and_link`, `parent_link`
/// points at the parent link slot near the stack base and `obj` at the object
/// that `init_stack` copied onto the stack. The function must never return.
pub type RootFunc<T> =
    unsafe extern "C" fn(arg: usize, parent_link: *mut StackPointer, obj: *mut T) -> !;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", unix))] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(all(target_arch = "aarch64", unix))] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("stackful-coro supports x86_64 and aarch64 unix targets only");
    }
}

/// Copies `obj` onto the stack below `sp`, keeping the stack aligned.
///
/// The padding computation constant-folds away when `T` needs no more than
/// `STACK_ALIGNMENT`.
#[inline]
unsafe fn allocate_obj_on_stack<T>(sp: &mut usize, sp_offset: usize, obj: T) {
    assert!(mem::size_of::<T>() <= 1024, "bootstrap object is too big");

    if mem::align_of::<T>() > STACK_ALIGNMENT {
        *sp -= mem::size_of::<T>();
        *sp &= !(mem::align_of::<T>() - 1);
    } else {
        // sp + sp_offset is aligned; pad so that sp_offset + padding + size
        // stays aligned as well.
        let total_size = sp_offset + mem::size_of::<T>();
        let align_offset = total_size % STACK_ALIGNMENT;
        if align_offset != 0 {
            *sp -= STACK_ALIGNMENT - align_offset;
        }
        *sp -= mem::size_of::<T>();
    }
    (*sp as *mut T).write(obj);

    debug_assert_eq!(*sp % STACK_ALIGNMENT, 0);
}

/// Pushes one word onto a stack. `None` only reserves the slot.
#[inline]
unsafe fn push(sp: &mut usize, val: Option<StackWord>) {
    *sp -= mem::size_of::<StackWord>();
    if let Some(val) = val {
        *(*sp as *mut StackWord) = val;
    }
}
