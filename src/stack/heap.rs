use std::alloc::{self, Layout};
use std::ptr::NonNull;

use super::{Stack, StackPointer, DEFAULT_STACK_SIZE, MIN_STACK_SIZE, STACK_ALIGNMENT};
use crate::error::{Error, Result};

/// Size of the canary zone at the low end of a heap stack.
const CANARY_SIZE: usize = 256;
const CANARY_WORD: u64 = 0xdead_c0de_5a5a_a5a5;

/// A stack allocated from the global allocator.
///
/// There is no guard page, so an overflow silently tramples the canary zone
/// at the bottom of the allocation. [`Stack::check`] looks at that zone after
/// every switch and the owning context aborts the process if it was touched.
/// Only use this where a mapped stack is not available.
#[derive(Debug)]
pub struct HeapStack {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The allocation is exclusively owned.
unsafe impl Send for HeapStack {}
unsafe impl Sync for HeapStack {}

impl HeapStack {
    /// Allocates a new stack with at least `size` usable bytes.
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(Error::StackTooSmall {
                size,
                min: MIN_STACK_SIZE,
            });
        }

        let total = size
            .checked_add(CANARY_SIZE + STACK_ALIGNMENT - 1)
            .map(|n| n & !(STACK_ALIGNMENT - 1))
            .ok_or(Error::Alloc { size })?;
        let layout =
            Layout::from_size_align(total, STACK_ALIGNMENT).map_err(|_| Error::Alloc { size })?;

        let ptr = NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(Error::Alloc { size })?;
        unsafe {
            let words = ptr.as_ptr() as *mut u64;
            for i in 0..CANARY_SIZE / 8 {
                words.add(i).write(CANARY_WORD);
            }
        }

        log::debug!(
            "allocated {} byte heap stack at {:#x}",
            total,
            ptr.as_ptr() as usize
        );
        Ok(Self { ptr, layout })
    }
}

impl Default for HeapStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl Drop for HeapStack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

unsafe impl Stack for HeapStack {
    #[inline]
    fn base(&self) -> StackPointer {
        StackPointer::new(self.ptr.as_ptr() as usize + self.layout.size()).unwrap()
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        StackPointer::new(self.ptr.as_ptr() as usize).unwrap()
    }

    #[inline]
    fn size(&self) -> usize {
        self.layout.size() - CANARY_SIZE
    }

    fn check(&self) -> bool {
        let words = self.ptr.as_ptr() as *const u64;
        (0..CANARY_SIZE / 8).all(|i| unsafe { words.add(i).read() } == CANARY_WORD)
    }
}
