// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The dispatch loop: one `step()` executes exactly one instruction of
//! whichever fiber is currently running, so switching fibers is just
//! changing which one `Process::running` points at — no native stack
//! switching, because every fiber's program counter and locals already live
//! in its own `Fiber`/`CallStack`, not on the host call stack. Grounded on
//! `crates/runtime/src/interpreter.rs`'s dispatch shape, expressed here as
//! a `match` over `Opcode` (permitted alongside a function table or
//! computed goto) rather than that module's `static mut` handler table.

use std::alloc::Layout;
use std::ffi::c_void;

use lauf_types::{Address, FunctionAddress, Opcode, Value};

use crate::allocator::VmAllocator;
use crate::builtin::{BuiltinContext, BuiltinTable};
use crate::panic::Panic;
use crate::process::Process;
use lauf_jit::StepResult;
use lauf_memory::AllocationSource;
use lauf_stack::Frame;

fn allocate_locals(process: &mut Process, size: u32) -> Result<Address, Panic> {
    if size == 0 {
        return Ok(Address::NULL);
    }
    let layout = Layout::from_size_align(size as usize, 8).map_err(|_| Panic::new("invalid local frame layout"))?;
    // SAFETY: `layout` has non-zero size, checked above.
    let ptr = unsafe { process.allocate_heap_bytes(layout) };
    if ptr.is_null() {
        return Err(Panic::new("out of memory allocating local frame"));
    }
    Ok(process.memory.allocate(AllocationSource::LocalFrame, ptr, size as usize, 8))
}

fn free_locals(process: &mut Process, address: Address, size: u32) {
    if size == 0 {
        return;
    }
    if let Ok(freed) = process.memory.free(address, AllocationSource::LocalFrame) {
        if let Ok(layout) = Layout::from_size_align(freed.size, freed.align) {
            // SAFETY: `freed.ptr`/layout came from the matching `allocate`.
            unsafe { process.deallocate_heap_bytes(freed.ptr, layout) };
        }
    }
}

/// Consults the JIT cache for `target` before the interpreter pushes a
/// frame — "the dispatch loop, before entering a function, consults this
/// pointer; if present, control transfers into native code". Only applies
/// to ordinary calls (`return_ip != usize::MAX`): a fiber's entry function
/// has no interpreter frame to return into on `StepResult::Returned`, so
/// it always interprets. Returns `None` when nothing is installed or the
/// compiled code bailed, meaning the caller should fall through to the
/// ordinary interpreter path.
fn try_run_compiled(process: &mut Process, target: FunctionAddress, return_ip: usize) -> Option<Result<(), Panic>> {
    if return_ip == usize::MAX {
        return None;
    }
    let cache = process.jit.clone()?;
    let native = cache.lookup(target.index)?;

    let idx = process.running.expect("a fiber must be running to call");
    let vstack_ptr = {
        let fiber = process.fibers[idx as usize].as_mut().unwrap();
        fiber.value_stack.top_ptr() as *mut u64
    };
    let process_ptr = process as *mut Process<'_> as *mut c_void;
    // SAFETY: `vstack_ptr` points at the running fiber's live value stack
    // for the duration of this call, and `process_ptr` aliases `process`
    // itself, matching the built-in ABI's `process_pointer` argument; no
    // other reference to either is held while `native` runs.
    let result = native(0, vstack_ptr, std::ptr::null_mut(), process_ptr);
    match result {
        StepResult::Returned => {
            let fiber = process.fibers[idx as usize].as_mut().unwrap();
            fiber.ip = return_ip;
            Some(Ok(()))
        }
        StepResult::Panicked => Some(Err(Panic::new("panic in compiled code"))),
        StepResult::Continue => None,
    }
}

/// Pushes a new frame for `target` on the currently running fiber and
/// repoints it at the callee's first instruction. `input_count` values are
/// already sitting on top of the value stack, placed there by the caller.
pub(crate) fn enter_function(process: &mut Process, target: FunctionAddress, input_count: usize, return_ip: usize) -> Result<(), Panic> {
    if let Some(result) = try_run_compiled(process, target, return_ip) {
        return result;
    }

    let function = process
        .module
        .function(target.index)
        .ok_or_else(|| Panic::new("call to unknown function index"))?;
    let local_stack_size = function.local_stack_size;
    let locals = allocate_locals(process, local_stack_size)?;

    let idx = process.running.expect("a fiber must be running to call");
    let fiber = process.fibers[idx as usize].as_mut().unwrap();
    let caller_vstack_depth = fiber.value_stack.depth() - input_count;
    let frame = Frame::new(target, return_ip, caller_vstack_depth, locals);
    fiber
        .call_stack
        .push(frame)
        .map_err(|_| Panic::new("call stack overflow"))?;
    fiber.current_function = target;
    fiber.ip = 0;
    Ok(())
}

/// Pops the current frame. If it was the fiber's only frame, the fiber's
/// entry function just returned: hands its declared outputs to
/// `Process::fiber_complete` instead of resuming a caller frame.
fn leave_function(process: &mut Process, builtins: &BuiltinTable) -> Result<(), Panic> {
    let idx = process.running.expect("a fiber must be running to return");
    let (popped, became_empty, next_function) = {
        let fiber = process.fibers[idx as usize].as_mut().unwrap();
        let popped = fiber.call_stack.pop().map_err(|_| Panic::new("call stack underflow"))?;
        let became_empty = fiber.call_stack.is_empty();
        let next_function = fiber.call_stack.top().map(|f| f.function);
        (popped, became_empty, next_function)
    };

    let local_size = process
        .module
        .function(popped.function.index)
        .map(|f| f.local_stack_size)
        .unwrap_or(0);
    free_locals(process, popped.locals, local_size);

    if became_empty {
        let output_count = popped.function.output_count as usize;
        process.fiber_complete(output_count)?;
        return Ok(());
    }

    let fiber = process.fibers[idx as usize].as_mut().unwrap();
    fiber.ip = popped.return_ip;
    fiber.current_function = next_function.expect("non-empty call stack has a top frame");
    let _ = builtins;
    Ok(())
}

/// Reads the `n`th declared argument of the currently executing call —
/// fixed relative to the call site's stack depth, regardless of how much
/// the callee has since pushed on top of it.
fn argument_value(process: &mut Process, n: usize) -> Result<Value, Panic> {
    let idx = process.running.expect("a fiber must be running");
    let fiber = process.fibers[idx as usize].as_mut().unwrap();
    let caller_vstack_depth = fiber
        .call_stack
        .top()
        .map(|f| f.caller_vstack_depth)
        .ok_or_else(|| Panic::new("argument outside of a call"))?;
    let depth = fiber.value_stack.depth();
    let k = depth
        .checked_sub(caller_vstack_depth + n + 1)
        .ok_or_else(|| Panic::new("argument index out of range"))?;
    fiber.value_stack.peek(k).map_err(|_| Panic::new("argument index out of range"))
}

/// Executes exactly one instruction of the currently running fiber.
/// Returns `Ok(true)` to keep going, `Ok(false)` once every fiber is
/// `done`, or `Err` on a panic the caller must attempt to recover from.
pub fn step(process: &mut Process, builtins: &BuiltinTable) -> Result<bool, Panic> {
    let idx = match process.running {
        Some(idx) => idx,
        None => return Ok(false),
    };

    process.consume_step()?;

    let (instruction, function_index) = {
        let fiber = process.fibers[idx as usize].as_ref().unwrap();
        let function = process
            .module
            .function(fiber.current_function.index)
            .expect("a running fiber always names a real function");
        (function.instructions[fiber.ip], fiber.current_function.index)
    };
    let opcode = instruction.opcode().expect("verified modules only contain valid opcodes");

    match opcode {
        Opcode::nop => advance_ip(process, idx, 1),

        Opcode::return_ => {
            leave_function(process, builtins)?;
        }

        Opcode::jump => {
            jump_by(process, idx, instruction.payload_i24());
        }

        Opcode::jump_if => {
            let cond = pop_value(process, idx)?;
            if cond.is_truthy() {
                jump_by(process, idx, instruction.payload_i24());
            } else {
                advance_ip(process, idx, 1);
            }
        }

        Opcode::call => {
            let target_index = instruction.payload_u24() as u16;
            let callee = process
                .module
                .function(target_index)
                .ok_or_else(|| Panic::new("call to unknown function index"))?;
            let target = FunctionAddress {
                index: target_index,
                input_count: callee.signature.input_count,
                output_count: callee.signature.output_count,
            };
            let input_count = target.input_count as usize;
            let return_ip = process.fibers[idx as usize].as_ref().unwrap().ip + 1;
            enter_function(process, target, input_count, return_ip)?;
        }

        Opcode::call_indirect => {
            let value = pop_value(process, idx)?;
            let target = value.as_function_address();
            if target.is_null() {
                return Err(Panic::new("call_indirect through a null function address"));
            }
            let return_ip = process.fibers[idx as usize].as_ref().unwrap().ip + 1;
            enter_function(process, target, target.input_count as usize, return_ip)?;
        }

        Opcode::call_builtin => {
            let builtin_index = instruction.payload_u24();
            let entry = builtins
                .resolve(builtin_index)
                .ok_or_else(|| Panic::new("call to unknown builtin index"))?;
            let func = entry.func;
            let mut ctx = BuiltinContext::new(process, builtins);
            func(&mut ctx)?;
            advance_ip(process, idx, 1);
        }

        Opcode::panic => {
            return Err(Panic::new("explicit panic instruction"));
        }

        Opcode::push_literal => {
            let value = process
                .module
                .literal(instruction.payload_u24())
                .ok_or_else(|| Panic::new("literal index out of range"))?;
            push_value(process, idx, value)?;
            advance_ip(process, idx, 1);
        }

        Opcode::push_zero => {
            push_value(process, idx, Value::ZERO)?;
            advance_ip(process, idx, 1);
        }

        Opcode::push_small_zext => {
            push_value(process, idx, Value::from_uint(instruction.payload_u24() as u64))?;
            advance_ip(process, idx, 1);
        }

        Opcode::push_small_neg => {
            push_value(process, idx, Value::from_sint(instruction.payload_i24() as i64))?;
            advance_ip(process, idx, 1);
        }

        Opcode::pop => {
            let fiber = process.fibers[idx as usize].as_mut().unwrap();
            fiber
                .value_stack
                .pop_n(instruction.payload_u24() as usize)
                .map_err(|_| Panic::new("stack underflow in pop"))?;
            advance_ip(process, idx, 1);
        }

        Opcode::pop_one => {
            pop_value(process, idx)?;
            advance_ip(process, idx, 1);
        }

        Opcode::pick => {
            let fiber = process.fibers[idx as usize].as_mut().unwrap();
            fiber
                .value_stack
                .pick(instruction.payload_u24() as usize)
                .map_err(|_| Panic::new("stack underflow in pick"))?;
            advance_ip(process, idx, 1);
        }

        Opcode::roll => {
            let fiber = process.fibers[idx as usize].as_mut().unwrap();
            fiber
                .value_stack
                .roll(instruction.payload_u24() as usize)
                .map_err(|_| Panic::new("stack underflow in roll"))?;
            advance_ip(process, idx, 1);
        }

        Opcode::local_addr => {
            let fiber = process.fibers[idx as usize].as_ref().unwrap();
            let locals = fiber
                .call_stack
                .top()
                .map(|f| f.locals)
                .ok_or_else(|| Panic::new("local_addr outside of a call"))?;
            let addr = Address::new(locals.allocation, locals.generation, locals.offset + instruction.payload_u24());
            push_value(process, idx, Value::from_address(addr))?;
            advance_ip(process, idx, 1);
        }

        Opcode::argument => {
            let value = argument_value(process, instruction.payload_u24() as usize)?;
            push_value(process, idx, value)?;
            advance_ip(process, idx, 1);
        }
    }

    let _ = function_index;
    Ok(true)
}

fn advance_ip(process: &mut Process, fiber_index: u32, delta: usize) {
    let fiber = process.fibers[fiber_index as usize].as_mut().unwrap();
    fiber.ip += delta;
}

fn jump_by(process: &mut Process, fiber_index: u32, offset: i32) {
    let fiber = process.fibers[fiber_index as usize].as_mut().unwrap();
    fiber.ip = (fiber.ip as i64 + 1 + offset as i64) as usize;
}

fn pop_value(process: &mut Process, fiber_index: u32) -> Result<Value, Panic> {
    process.fibers[fiber_index as usize]
        .as_mut()
        .unwrap()
        .value_stack
        .pop()
        .map_err(|_| Panic::new("stack underflow"))
}

fn push_value(process: &mut Process, fiber_index: u32, value: Value) -> Result<(), Panic> {
    process.fibers[fiber_index as usize]
        .as_mut()
        .unwrap()
        .value_stack
        .push(value)
        .map_err(|_| Panic::new("stack overflow"))
}

/// Frees the local allocations of every frame still on `fiber_index`'s call
/// stack without executing any bytecode — used when a fiber is destroyed
/// while frames are still active ("destroying a non-done fiber whose
/// stack contains live frames with local allocations must free those
/// allocations first").
pub(crate) fn free_all_locals(process: &mut Process, fiber_index: u32) {
    loop {
        let popped = {
            let fiber = process.fibers[fiber_index as usize].as_mut().unwrap();
            match fiber.call_stack.pop() {
                Ok(frame) => frame,
                Err(_) => break,
            }
        };
        let local_size = process
            .module
            .function(popped.function.index)
            .map(|f| f.local_stack_size)
            .unwrap_or(0);
        free_locals(process, popped.locals, local_size);
    }
}

/// Attempts to unwind the currently running fiber to its innermost catch
/// point (used by `assert_panic`), truncating both stacks back to the
/// recorded depths and freeing any local allocations the unwound frames
/// owned. Returns `true` if a catch point absorbed the panic.
pub fn try_recover(process: &mut Process) -> bool {
    let idx = match process.running {
        Some(idx) => idx,
        None => return false,
    };

    let catch_point = {
        let fiber = process.fibers[idx as usize].as_mut().unwrap();
        match fiber.catch_points.pop() {
            Some(cp) => cp,
            None => return false,
        }
    };

    loop {
        let depth = process.fibers[idx as usize].as_ref().unwrap().call_stack.depth();
        if depth <= catch_point.cstack_depth {
            break;
        }
        let popped = process.fibers[idx as usize].as_mut().unwrap().call_stack.pop().unwrap();
        let local_size = process
            .module
            .function(popped.function.index)
            .map(|f| f.local_stack_size)
            .unwrap_or(0);
        free_locals(process, popped.locals, local_size);
    }

    let fiber = process.fibers[idx as usize].as_mut().unwrap();
    let current_depth = fiber.value_stack.depth();
    if current_depth > catch_point.vstack_depth {
        let _ = fiber.value_stack.pop_n(current_depth - catch_point.vstack_depth);
    }
    if let Some(top) = fiber.call_stack.top() {
        fiber.current_function = top.function;
    }
    if catch_point.had_step_limit {
        process.clear_step_limit();
    }
    true
}

/// Drives the currently running fiber (and whichever fibers it transfers
/// control to) until every fiber reaches `done`, or an unrecovered panic
/// escapes the root fiber.
pub fn run(process: &mut Process, builtins: &BuiltinTable) -> Result<(), Panic> {
    loop {
        match step(process, builtins) {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(panic) => {
                if !try_recover(process) {
                    return Err(panic);
                }
            }
        }
    }
}

/// Drives `fiber_index`'s call stack down to `target_depth`, stepping
/// whichever fiber happens to be running in the meantime (the callee may
/// itself create or resume other fibers before returning). Used by
/// built-ins that need to invoke a `lauf` function synchronously, e.g. the
/// test library's `assert_panic`, the "surrounding `assert_panic`
/// test-library built-in" case.
///
/// On an unrecovered panic, unwinds `fiber_index`'s stack back to
/// `target_depth` itself (freeing local allocations of the frames above
/// it) and returns the panic to the caller instead of propagating further.
pub(crate) fn run_until_depth(process: &mut Process, builtins: &BuiltinTable, fiber_index: u32, target_depth: usize) -> Result<(), Panic> {
    loop {
        let depth = process.fibers[fiber_index as usize].as_ref().unwrap().call_stack.depth();
        if depth <= target_depth {
            return Ok(());
        }
        match step(process, builtins) {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(panic) => {
                if try_recover(process) {
                    continue;
                }
                unwind_to_depth(process, fiber_index, target_depth);
                return Err(panic);
            }
        }
    }
}

fn unwind_to_depth(process: &mut Process, fiber_index: u32, target_depth: usize) {
    loop {
        let depth = process.fibers[fiber_index as usize].as_ref().unwrap().call_stack.depth();
        if depth <= target_depth {
            return;
        }
        let popped = process.fibers[fiber_index as usize].as_mut().unwrap().call_stack.pop().unwrap();
        let local_size = process
            .module
            .function(popped.function.index)
            .map(|f| f.local_stack_size)
            .unwrap_or(0);
        free_locals(process, popped.locals, local_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauf_image::ModuleBuilder;
    use lauf_types::Signature;
    use pretty_assertions::assert_eq;

    use crate::builtin::BuiltinLibrary;
    use crate::process::ProcessConfig;

    fn start(module: &lauf_image::Module, entry: FunctionAddress) -> Process {
        let mut process = Process::new(module, entry, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        process
    }

    #[test]
    fn a_function_that_forwards_its_argument_runs_to_completion() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("id", Signature::new(1, 1));
        f.argument(0).unwrap();
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let entry = FunctionAddress {
            index: 0,
            input_count: 1,
            output_count: 1,
        };

        let mut process = start(&module, entry);
        process
            .current_fiber_mut()
            .unwrap()
            .value_stack
            .push(Value::from_uint(42))
            .unwrap();

        let builtins = BuiltinTable::new();
        run(&mut process, &builtins).unwrap();

        assert!(process.is_root_done());
    }

    #[test]
    fn a_call_to_a_helper_function_returns_control_to_the_caller() {
        let mut builder = ModuleBuilder::new("m");
        let mut helper = builder.start_function("helper", Signature::new(0, 1));
        helper.push_small_zext(7).unwrap();
        helper.return_().unwrap();
        let helper_idx = builder.finish_function(helper).unwrap();

        let mut main = builder.start_function("main", Signature::new(0, 1));
        main.call(helper_idx as u32, 0, 1).unwrap();
        main.return_().unwrap();
        builder.finish_function(main).unwrap();

        let module = builder.finish().unwrap();
        let entry = FunctionAddress {
            index: 1,
            input_count: 0,
            output_count: 1,
        };
        let mut process = start(&module, entry);
        let builtins = BuiltinTable::new();
        run(&mut process, &builtins).unwrap();
        assert!(process.is_root_done());
    }

    #[test]
    fn explicit_panic_escapes_when_nothing_catches_it() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("boom", Signature::new(0, 0));
        f.panic().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = start(&module, entry);
        let builtins = BuiltinTable::new();
        let err = run(&mut process, &builtins).unwrap_err();
        assert_eq!(err.message, "explicit panic instruction");
    }

    #[test]
    fn step_limit_exhaustion_panics_and_is_uncaught_without_a_catch_point() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("loop_forever", Signature::new(0, 0));
        f.nop().unwrap();
        f.jump(-2).unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut config = ProcessConfig::default();
        config.step_limit = 5;
        let mut process = Process::new(&module, entry, config);
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        let builtins = BuiltinTable::new();
        let err = run(&mut process, &builtins).unwrap_err();
        assert_eq!(err.message, "step limit exceeded");
    }

    #[test]
    fn a_call_to_a_compiled_function_never_pushes_an_interpreter_frame() {
        use std::sync::Arc;

        use lauf_arena::ExecutableMemory;
        use lauf_jit::{JitCache, StepResult};

        extern "C" fn compiled_helper(
            _ip: usize,
            _vstack: *mut u64,
            _frame: *mut std::ffi::c_void,
            _process: *mut std::ffi::c_void,
        ) -> StepResult {
            StepResult::Returned
        }

        let mut builder = ModuleBuilder::new("m");
        let mut helper = builder.start_function("helper", Signature::new(0, 0));
        helper.return_().unwrap();
        let helper_idx = builder.finish_function(helper).unwrap();

        let mut main = builder.start_function("main", Signature::new(0, 0));
        main.call(helper_idx as u32, 0, 0).unwrap();
        main.return_().unwrap();
        builder.finish_function(main).unwrap();

        let module = builder.finish().unwrap();
        let entry = FunctionAddress {
            index: 1,
            input_count: 0,
            output_count: 0,
        };
        let mut process = start(&module, entry);

        let cache = Arc::new(JitCache::new(module.functions().len()));
        cache.install(helper_idx, ExecutableMemory::map(16), compiled_helper);
        process.set_jit_cache(cache);

        let builtins = BuiltinTable::new();
        loop {
            let depth = process.current_fiber().map(|f| f.call_stack.depth()).unwrap_or(0);
            assert!(depth <= 1, "the compiled callee must never get an interpreter frame");
            match step(&mut process, &builtins).unwrap() {
                true => continue,
                false => break,
            }
        }
        assert!(process.is_root_done());
    }
}
