// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! OS-page-level executable memory for the JIT stub layer: anonymous
//! mappings obtained R/X, temporarily flipped to R/W for writes, then
//! flipped back.

use crate::page_allocator::PAGE_SIZE;

/// A single anonymous, page-aligned region of memory that can hold
/// compiled native code.
pub struct ExecutableMemory {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ExecutableMemory {
    /// Maps `len` bytes (rounded up to a whole number of pages) with
    /// `PROT_READ | PROT_EXEC` initially.
    pub fn map(len: usize) -> Self {
        let len = ((len + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE;
        // SAFETY: a fixed-size anonymous, non-file-backed mapping; the
        // returned pointer is owned exclusively by this `ExecutableMemory`
        // until `drop`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(ptr != libc::MAP_FAILED, "mmap failed for executable memory");
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flips the mapping to `PROT_READ | PROT_WRITE`, runs `f` with a
    /// mutable view of the bytes, then flips it back to
    /// `PROT_READ | PROT_EXEC` before returning.
    pub fn with_writable<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        // SAFETY: `self.ptr`/`self.len` describe the mapping created in
        // `map`, still valid and exclusively owned.
        unsafe {
            let rc = libc::mprotect(self.ptr, self.len, libc::PROT_READ | libc::PROT_WRITE);
            assert_eq!(rc, 0, "mprotect(R/W) failed");
        }

        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) };
        let result = f(slice);

        // SAFETY: same mapping as above.
        unsafe {
            let rc = libc::mprotect(self.ptr, self.len, libc::PROT_READ | libc::PROT_EXEC);
            assert_eq!(rc, 0, "mprotect(R/X) failed");
        }

        result
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.len` are the exact mapping returned by
        // `mmap` in `map`, unmapped exactly once here.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_rounds_up_to_a_whole_page() {
        let mem = ExecutableMemory::map(10);
        assert_eq!(mem.len(), PAGE_SIZE);
    }

    #[test]
    fn writable_scope_allows_mutation() {
        let mut mem = ExecutableMemory::map(16);
        mem.with_writable(|bytes| {
            bytes[0] = 0xC3; // `ret` on x86_64
        });
        // SAFETY: `with_writable` flipped protection back to R/X; reading
        // through the raw pointer for the assertion only, not executing.
        let byte = unsafe { *mem.as_ptr() };
        assert_eq!(byte, 0xC3);
    }
}
