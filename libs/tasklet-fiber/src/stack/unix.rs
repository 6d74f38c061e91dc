// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::valgrind::ValgrindStackRegistration;
use crate::stack::{FiberStack, MIN_STACK_SIZE, StackPointer};
use std::io::Error;
use std::mem::ManuallyDrop;
use std::ptr;

/// A mmap'd, guard-paged stack used to run a hard-switched tasklet.
pub struct DefaultFiberStack {
    top: StackPointer,
    mmap_len: usize,
    valgrind: ManuallyDrop<ValgrindStackRegistration>,
}

impl DefaultFiberStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: mmap/mprotect/munmap are used according to their contracts below.
        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
                valgrind: ManuallyDrop::new(ValgrindStackRegistration::new(
                    mmap.cast::<u8>(),
                    mmap_len,
                )),
            };

            // Leave the first page as an unreadable/unwritable guard page.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }
}

impl Default for DefaultFiberStack {
    fn default() -> Self {
        Self::new(1024 * 1024).expect("failed to allocate tasklet stack")
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        // Safety: `top`/`mmap_len` describe the mapping created in `new`.
        unsafe {
            ManuallyDrop::drop(&mut self.valgrind);

            let mmap = self.top.get() - self.mmap_len;
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

// Safety: `top`/`bottom` describe the live mmap region for the lifetime of `self`.
unsafe impl FiberStack for DefaultFiberStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len).unwrap()
    }
}

fn page_size() -> usize {
    // Safety: sysconf with _SC_PAGESIZE has no preconditions.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}
