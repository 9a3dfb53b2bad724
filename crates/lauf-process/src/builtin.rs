// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The built-in call ABI. A built-in is an ordinary safe Rust
//! function taking a `BuiltinContext` — unlike `lauf-jit`'s `NativeFn`,
//! which models what *compiled* native code would be called as and needs a
//! raw `extern "C"` calling convention, an interpreter-invoked built-in has
//! no FFI boundary to cross, so it stays safe Rust all the way down. See
//! DESIGN.md for why the two ABIs are kept separate.

use lauf_types::{FunctionAddress, Value};

use crate::dispatch;
use crate::panic::Panic;
use crate::process::Process;

/// What a built-in sees: the running process (for memory/fiber/step-limit
/// operations) plus direct push/pop access to the current fiber's value
/// stack, without exposing the dispatch loop's instruction pointer. Also
/// carries the built-in table itself, so a built-in like `assert_panic` can
/// drive a nested call through the ordinary dispatch loop (resolving any
/// `call_builtin`s the called function contains the same way the top-level
/// loop does).
pub struct BuiltinContext<'a, 'm> {
    pub process: &'a mut Process<'m>,
    builtins: &'a BuiltinTable,
}

impl<'a, 'm> BuiltinContext<'a, 'm> {
    pub fn new(process: &'a mut Process<'m>, builtins: &'a BuiltinTable) -> Self {
        Self { process, builtins }
    }

    pub fn pop(&mut self) -> Result<Value, Panic> {
        self.process
            .current_fiber_mut()
            .expect("a fiber must be running to call a builtin")
            .value_stack
            .pop()
            .map_err(|_| Panic::new("stack underflow in builtin"))
    }

    pub fn push(&mut self, value: Value) -> Result<(), Panic> {
        self.process
            .current_fiber_mut()
            .expect("a fiber must be running to call a builtin")
            .value_stack
            .push(value)
            .map_err(|_| Panic::new("stack overflow in builtin"))
    }

    /// Synchronously calls `target` on the currently running fiber:
    /// `target.input_count` values must already be on top of the value
    /// stack. Drives the dispatch loop until that call returns (or the
    /// process otherwise runs out of fibers), leaving `target.output_count`
    /// values on the stack. Used by `lauf-lib`'s `assert_panic`.
    pub fn call(&mut self, target: FunctionAddress) -> Result<(), Panic> {
        let fiber_index = self.process.running.expect("a fiber must be running to call a builtin");
        let depth_before = self.process.fibers[fiber_index as usize].as_ref().unwrap().call_stack.depth();
        // `leave_function` will overwrite `fiber.ip` with the synthetic
        // return ip once the callee's `return_` pops back to `depth_before`
        // frames — harmless since the enclosing `call_builtin` handler
        // always advances `ip` itself once this built-in returns, so the
        // stale value just needs restoring here rather than preserving.
        let ip_before = self.process.fibers[fiber_index as usize].as_ref().unwrap().ip;
        let input_count = target.input_count as usize;
        dispatch::enter_function(self.process, target, input_count, usize::MAX)?;
        let result = dispatch::run_until_depth(self.process, self.builtins, fiber_index, depth_before);
        if let Some(fiber) = self.process.fibers[fiber_index as usize].as_mut() {
            fiber.ip = ip_before;
        }
        result
    }

    /// Runs `target` and reports whether it panicked instead of propagating
    /// the panic, truncating the value stack back to its pre-call depth on
    /// failure so the caller sees a consistent stack either way. A caught
    /// panic that was itself "step limit exceeded" leaves the
    /// process with an unlimited step budget for the remainder of
    /// execution — `remaining_steps` only ever reaches zero by way of that
    /// exact panic, so its value at catch time identifies the case.
    pub fn try_call(&mut self, target: FunctionAddress) -> bool {
        let fiber = self.process.current_fiber().expect("a fiber must be running to call a builtin");
        let vstack_depth_before = fiber.value_stack.depth() - target.input_count as usize;
        match self.call(target) {
            Ok(()) => false,
            Err(_) => {
                if self.process.step_limit_ceiling != 0 && self.process.remaining_steps == 0 {
                    self.process.clear_step_limit();
                }
                let fiber = self.process.current_fiber_mut().unwrap();
                let depth = fiber.value_stack.depth();
                if depth > vstack_depth_before {
                    let _ = fiber.value_stack.pop_n(depth - vstack_depth_before);
                }
                true
            }
        }
    }
}

pub type BuiltinFn = fn(&mut BuiltinContext) -> Result<(), Panic>;

/// Declared alongside a built-in's name and arity: `no_panic` promises the
/// built-in never returns a panic (a caller may skip unwind bookkeeping
/// around it), `no_process` promises it never touches
/// `BuiltinContext::process` (only the value stack), and `vm_only` marks a
/// built-in too stateful to be called from a JIT-compiled context that
/// lacks a live process pointer. `BuiltinTable::resolve_for_native_call`
/// is where that last refusal is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuiltinFlags {
    pub no_panic: bool,
    pub no_process: bool,
    pub vm_only: bool,
}

/// One entry in a `BuiltinLibrary`: the name the assembler binds
/// `call_builtin`'s payload to, and its declared arity (checked at
/// verification time, just like an ordinary function's signature).
#[derive(Clone, Copy)]
pub struct BuiltinEntry {
    pub name: &'static str,
    pub input_count: u8,
    pub output_count: u8,
    pub flags: BuiltinFlags,
    pub func: BuiltinFn,
}

/// A named group of built-ins, e.g. "arithmetic" or "memory" — mirrors
/// the signature-and-symbol-name shape `lauf-image::Function` uses for
/// ordinary functions, so a module can resolve `call_builtin` the same
/// way it resolves `call`.
#[derive(Default)]
pub struct BuiltinLibrary {
    pub name: &'static str,
    entries: Vec<BuiltinEntry>,
}

impl BuiltinLibrary {
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: Vec::new() }
    }

    pub fn register(&mut self, name: &'static str, input_count: u8, output_count: u8, func: BuiltinFn) -> u32 {
        self.register_with_flags(name, input_count, output_count, BuiltinFlags::default(), func)
    }

    pub fn register_with_flags(
        &mut self,
        name: &'static str,
        input_count: u8,
        output_count: u8,
        flags: BuiltinFlags,
        func: BuiltinFn,
    ) -> u32 {
        let index = self.entries.len() as u32;
        self.entries.push(BuiltinEntry {
            name,
            input_count,
            output_count,
            flags,
            func,
        });
        index
    }

    pub fn get(&self, index: u32) -> Option<&BuiltinEntry> {
        self.entries.get(index as usize)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.entries.iter().position(|e| e.name == name).map(|i| i as u32)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The flattened, per-process set of libraries a module was linked
/// against: `call_builtin`'s 24-bit payload indexes into this table
/// directly, concatenating every registered library in registration order.
#[derive(Default)]
pub struct BuiltinTable {
    libraries: Vec<BuiltinLibrary>,
    offsets: Vec<u32>,
}

impl BuiltinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_library(&mut self, library: BuiltinLibrary) {
        let offset = self.offsets.last().copied().unwrap_or(0) + self.libraries.last().map(|l| l.len() as u32).unwrap_or(0);
        self.offsets.push(offset);
        self.libraries.push(library);
    }

    pub fn resolve(&self, global_index: u32) -> Option<&BuiltinEntry> {
        for (lib, &offset) in self.libraries.iter().zip(self.offsets.iter()) {
            if global_index >= offset && (global_index - offset) < lib.len() as u32 {
                return lib.get(global_index - offset);
            }
        }
        None
    }

    pub fn index_of(&self, library: &str, name: &str) -> Option<u32> {
        let (lib_index, lib) = self.libraries.iter().enumerate().find(|(_, l)| l.name == library)?;
        let local = lib.index_of(name)?;
        Some(self.offsets[lib_index] + local)
    }

    /// The gate a JIT trampoline must call through instead of `resolve`
    /// directly: refuses a `vm_only` built-in when `process_available` is
    /// false. The interpreted dispatch loop always has a process, so it
    /// calls `resolve` directly; this method exists for `lauf-jit`'s
    /// native-code callers, which may invoke a built-in with the process
    /// pointer elided.
    pub fn resolve_for_native_call(&self, global_index: u32, process_available: bool) -> Result<&BuiltinEntry, &'static str> {
        let entry = self.resolve(global_index).ok_or("call to unknown builtin index")?;
        if entry.flags.vm_only && !process_available {
            return Err("vm_only built-in called without a process pointer");
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauf_image::ModuleBuilder;
    use lauf_types::{FunctionAddress, Signature};
    use pretty_assertions::assert_eq;

    use crate::process::ProcessConfig;

    fn noop_builtin(_ctx: &mut BuiltinContext) -> Result<(), Panic> {
        Ok(())
    }

    #[test]
    fn table_resolves_across_libraries_by_global_index() {
        let mut a = BuiltinLibrary::new("a");
        a.register("one", 0, 0, noop_builtin);
        a.register("two", 0, 0, noop_builtin);
        let mut b = BuiltinLibrary::new("b");
        b.register("three", 0, 0, noop_builtin);

        let mut table = BuiltinTable::new();
        table.add_library(a);
        table.add_library(b);

        assert_eq!(table.resolve(0).unwrap().name, "one");
        assert_eq!(table.resolve(1).unwrap().name, "two");
        assert_eq!(table.resolve(2).unwrap().name, "three");
        assert!(table.resolve(3).is_none());
        assert_eq!(table.index_of("b", "three"), Some(2));
    }

    #[test]
    fn context_push_and_pop_round_trip_through_the_running_fiber() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("entry", Signature::new(0, 0));
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = Process::new(&module, entry, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();

        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);
        ctx.push(Value::from_uint(9)).unwrap();
        assert_eq!(ctx.pop().unwrap().as_uint(), 9);
    }

    #[test]
    fn vm_only_builtin_is_refused_without_a_process() {
        let mut lib = BuiltinLibrary::new("a");
        lib.register_with_flags("needs_process", 0, 0, BuiltinFlags { vm_only: true, ..Default::default() }, noop_builtin);
        lib.register("pure", 0, 0, noop_builtin);

        let mut table = BuiltinTable::new();
        table.add_library(lib);

        assert!(table.resolve_for_native_call(0, false).is_err());
        assert!(table.resolve_for_native_call(0, true).is_ok());
        assert!(table.resolve_for_native_call(1, false).is_ok());
    }
}
