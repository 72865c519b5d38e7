//! Stacks that coroutines run on.
//!
//! [`DefaultStack`] maps memory from the OS and protects its lowest page so
//! that an overflow faults immediately. [`HeapStack`] is the fallback for
//! environments without page protection: it is carved out of the global
//! allocator and detects overflows after the fact with a canary.

use core::num::NonZeroUsize;
use std::io;

mod heap;
pub use self::heap::HeapStack;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "default-stack", unix))] {
        mod unix;
        pub use self::unix::DefaultStack;
    } else {
        /// Without the `default-stack` feature the heap stack is the default.
        pub type DefaultStack = HeapStack;
    }
}

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Minimum usable size of a stack, excluding guard pages.
///
/// Signal handlers may run on a coroutine stack, so it must hold at least two
/// of the platform's signal stacks.
pub const MIN_STACK_SIZE: usize = 2 * libc::SIGSTKSZ;

/// Size of a stack created through `Default`.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// A trait for objects that hold ownership of a stack.
///
/// # Safety
///
/// The memory between `limit` and `base` must stay valid and unused by anyone
/// else for as long as the object lives, and must contain at least
/// [`MIN_STACK_SIZE`] usable bytes. Overflows must either fault (guard page)
/// or be reported by [`Stack::check`].
pub unsafe trait Stack {
    /// Returns the base address of the stack. This is the highest address
    /// since stacks grow downwards on all supported targets.
    ///
    /// Must be aligned to [`STACK_ALIGNMENT`].
    fn base(&self) -> StackPointer;

    /// Returns the lowest address of the stack, guard page included.
    fn limit(&self) -> StackPointer;

    /// Returns the usable size of the stack in bytes.
    fn size(&self) -> usize;

    /// Verifies that the stack has not been overrun. Called after every switch
    /// back from a coroutine.
    fn check(&self) -> bool {
        true
    }

    /// Gives the memory back, reporting failures that `Drop` would have to
    /// ignore.
    fn release(self) -> io::Result<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }
}

/// Returns the OS page size.
pub(crate) fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

#[test]
fn assert_send_sync() {
    fn send<T: Send>() {}
    fn sync<T: Sync>() {}
    send::<DefaultStack>();
    sync::<DefaultStack>();
    send::<HeapStack>();
    sync::<HeapStack>();
}
