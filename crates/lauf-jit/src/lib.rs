// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Component H: the JIT stub layer — a per-function compiled-code cache
//! and the trampoline ABI a compiled function is called through. This
//! crate implements the *mechanism* only: a place to install native code
//! and a way to call it. It does not contain a compiler; nothing here
//! turns bytecode into machine code. `src/lib/int_aarch64.cpp` shows
//! that even a hand-written native backend only ever JIT-compiles a
//! handful of leaf arithmetic builtins — everything else stays
//! interpreted. A from-scratch Cranelift backend is out of scope here;
//! see DESIGN.md for the dependency this crate deliberately does not
//! carry.
//!
//! Executable pages come from `lauf_arena::ExecutableMemory`, an
//! mmap/mprotect primitive wrapping a page allocation's protection flips.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use lauf_arena::ExecutableMemory;

/// What a compiled function hands back to its caller: whether to keep
/// interpreting at the next instruction, whether the function returned,
/// or whether it panicked. Mirrors the three outcomes `dispatch::step`
/// already distinguishes (`Ok(true)`/`Ok(false)`/`Err`), in a
/// `#[repr(C)]` shape an `extern "C"` caller can read directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue = 0,
    Returned = 1,
    Panicked = 2,
}

/// The calling convention a JIT-compiled function is invoked through:
/// the same four arguments a built-in effectively closes over by hand
/// (the instruction pointer, the value stack top, the current frame, and
/// the process itself), but crossing a real `extern "C"` boundary since
/// this is what compiled native code would actually call. `frame_ptr`
/// and `process_ptr` are untyped on this side of the boundary — this
/// crate never dereferences them, only a future code generator targeting
/// a specific `lauf-process` layout would.
pub type NativeFn = extern "C" fn(ip: usize, vstack_ptr: *mut u64, frame_ptr: *mut c_void, process_ptr: *mut c_void) -> StepResult;

/// One installed compiled function: the entry point the cache hands out,
/// and the executable mapping that owns it (kept alive for as long as the
/// cache is, so the pointer in `entry` never dangles).
struct CompiledFunction {
    entry: NativeFn,
    #[allow(dead_code)]
    code: ExecutableMemory,
}

/// A per-process (really: per-module, since compiled code has no
/// process-specific state baked in) cache of compiled functions, indexed
/// by function index. Lookups are lock-free; installation takes a lock
/// since it only happens off the hot path.
pub struct JitCache {
    entries: Vec<AtomicPtr<()>>,
    installed: Mutex<Vec<Option<CompiledFunction>>>,
}

impl JitCache {
    /// Creates an empty cache sized for a module with `function_count`
    /// functions; every slot starts uncompiled.
    pub fn new(function_count: usize) -> Self {
        let mut entries = Vec::with_capacity(function_count);
        let mut installed = Vec::with_capacity(function_count);
        for _ in 0..function_count {
            entries.push(AtomicPtr::new(std::ptr::null_mut()));
            installed.push(None);
        }
        Self {
            entries,
            installed: Mutex::new(installed),
        }
    }

    /// Registers `entry` as the compiled code for `function_index`,
    /// keeping `code` alive for as long as the cache lives. Overwrites any
    /// previously installed code for the same index.
    pub fn install(&self, function_index: u16, code: ExecutableMemory, entry: NativeFn) {
        let slot = CompiledFunction { entry, code };
        self.entries[function_index as usize].store(entry as *const () as *mut (), Ordering::Release);
        self.installed.lock().unwrap()[function_index as usize] = Some(slot);
    }

    /// Removes any installed code for `function_index`, falling back to
    /// the interpreter on the next call.
    pub fn evict(&self, function_index: u16) {
        self.entries[function_index as usize].store(std::ptr::null_mut(), Ordering::Release);
        self.installed.lock().unwrap()[function_index as usize] = None;
    }

    /// The trampoline: returns compiled code for `function_index` if any
    /// has been installed, `None` if the dispatch loop should keep
    /// interpreting it. A single atomic load on the hot path — the
    /// `Mutex` is never touched here.
    pub fn lookup(&self, function_index: u16) -> Option<NativeFn> {
        let ptr = self.entries.get(function_index as usize)?.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the only pointer ever stored here came from a `NativeFn`
        // in `install`, cast back to its original type.
        Some(unsafe { std::mem::transmute::<*mut (), NativeFn>(ptr) })
    }

    pub fn function_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninstalled_function_misses_the_cache() {
        let cache = JitCache::new(4);
        assert!(cache.lookup(0).is_none());
    }

    #[test]
    fn evicting_an_installed_function_falls_back_to_interpretation() {
        let cache = JitCache::new(4);
        let mut code = ExecutableMemory::map(16);
        code.with_writable(|bytes| bytes[0] = 0xC3);
        extern "C" fn stub(_ip: usize, _v: *mut u64, _f: *mut c_void, _p: *mut c_void) -> StepResult {
            StepResult::Returned
        }
        cache.install(0, code, stub);
        assert!(cache.lookup(0).is_some());
        cache.evict(0);
        assert!(cache.lookup(0).is_none());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn installed_machine_code_runs_through_the_trampoline() {
        let cache = JitCache::new(1);
        let mut code = ExecutableMemory::map(16);
        // `mov eax, 1; ret` — returns `StepResult::Returned as i32` in
        // `eax`, the standard System V return register for a `repr(C)`
        // enum this small.
        code.with_writable(|bytes| {
            bytes[0..5].copy_from_slice(&[0xB8, 0x01, 0x00, 0x00, 0x00]);
            bytes[5] = 0xC3;
        });
        let ptr = code.as_ptr();
        // SAFETY: `ptr` was just mapped executable and written above; the
        // signature matches the bytes' calling convention exactly.
        let entry: NativeFn = unsafe { std::mem::transmute::<*const u8, NativeFn>(ptr) };
        cache.install(0, code, entry);

        let compiled = cache.lookup(0).expect("just installed");
        let result = compiled(0, std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut());
        assert_eq!(result, StepResult::Returned);
    }
}
