use std::io;
use std::mem;
use std::ptr;

use super::{page_size, Stack, StackPointer, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::error::{Error, Result};

/// Default stack implementation which uses `mmap`.
///
/// The lowest page of the mapping is a guard page: it is never readable or
/// writable, so running off the end of the stack faults on the spot instead
/// of corrupting whatever is mapped below.
#[derive(Debug)]
pub struct DefaultStack {
    base: StackPointer,
    mmap_len: usize,
}

impl DefaultStack {
    /// Creates a new stack with at least `size` usable bytes.
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(Error::StackTooSmall {
                size,
                min: MIN_STACK_SIZE,
            });
        }

        // Round up to a page boundary and add the guard page.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .ok_or_else(|| Error::Map(io::ErrorKind::InvalidInput.into()))?
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                log::error!("mmap of {} byte stack failed: {}", mmap_len, err);
                return Err(Error::Map(err));
            }

            // Built before mprotect so that a failure below unmaps the region
            // when `out` is dropped.
            let out = Self {
                base: StackPointer::new_unchecked(mmap as usize + mmap_len),
                mmap_len,
            };

            if libc::mprotect(mmap, page_size, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                log::error!("mprotect of stack guard page failed: {}", err);
                return Err(Error::Protect(err));
            }

            log::debug!(
                "mapped stack {:#x}..{:#x} with guard page at {:#x}",
                mmap as usize,
                out.base.get(),
                mmap as usize
            );
            Ok(out)
        }
    }

    /// Address range of the guard page.
    pub fn guard_page(&self) -> core::ops::Range<usize> {
        let limit = self.limit().get();
        limit..limit + page_size()
    }
}

impl Default for DefaultStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl DefaultStack {
    fn unmap(&self) -> io::Result<()> {
        let mmap = self.base.get() - self.mmap_len;
        if unsafe { libc::munmap(mmap as _, self.mmap_len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        log::debug!("unmapped stack {:#x}..{:#x}", mmap, self.base.get());
        Ok(())
    }
}

impl Drop for DefaultStack {
    fn drop(&mut self) {
        let ret = self.unmap();
        debug_assert!(ret.is_ok(), "munmap failed: {:?}", ret);
    }
}

unsafe impl Stack for DefaultStack {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        StackPointer::new(self.base.get() - self.mmap_len).unwrap()
    }

    #[inline]
    fn size(&self) -> usize {
        self.mmap_len - page_size()
    }

    fn release(self) -> io::Result<()> {
        let ret = self.unmap();
        mem::forget(self);
        ret
    }
}
