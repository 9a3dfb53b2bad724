// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.fiber`: the cooperative scheduler surfaced to bytecode, grounded
//! on `include/lauf/lib/fiber.h`'s builtin set. `resume`/`suspend`/
//! `transfer` move a single value at a time — a `call_builtin` site's
//! declared input/output counts only drive the module builder's static
//! stack checker, so the running built-in itself has no way to see how
//! many values a particular call site asked for; a fixed one-value
//! protocol keeps the two in agreement. See DESIGN.md for this choice.
//! `destroy`/`destroy_forced` split the original's single arity-1
//! `lauf_lib_fiber_destroy` into an unforced variant that requires the
//! target already be `done`, and a forced variant that does not.

use lauf_process::{BuiltinContext, BuiltinFlags, BuiltinLibrary, FiberHandle, Panic};
use lauf_types::Value;

/// Every entry here operates on the process's fiber scheduler directly,
/// so none of them can run in a JIT-compiled context without a live
/// process pointer.
const VM_ONLY: BuiltinFlags = BuiltinFlags {
    no_panic: false,
    no_process: false,
    vm_only: true,
};

fn create(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let target = ctx.pop()?.as_function_address();
    if target.is_null() {
        return Err(Panic::new("fiber_create with a null function address"));
    }
    let handle = ctx
        .process
        .fiber_create(target)
        .map_err(|_| Panic::new("could not create fiber"))?;
    ctx.push(handle.to_value())
}

fn destroy(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = FiberHandle::from_value(ctx.pop()?);
    ctx.process.fiber_destroy(handle, false).map_err(|err| match err {
        lauf_process::FiberError::NotDone => {
            Panic::new("fiber_destroy on a fiber that is not done; use destroy_forced")
        }
        _ => Panic::new("invalid fiber handle"),
    })
}

/// Destroys a fiber regardless of its state (as long as it isn't the one
/// currently running), reclaiming a `ready`/`suspended` fiber's stacks
/// out from under anything that still held a handle to it. A distinct
/// builtin rather than a runtime flag on `destroy`: a `call_builtin` site
/// names its behavior statically, the same reasoning `lauf.int` uses for
/// one builtin per overflow mode.
fn destroy_forced(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = FiberHandle::from_value(ctx.pop()?);
    ctx.process
        .fiber_destroy(handle, true)
        .map_err(|_| Panic::new("invalid fiber handle"))
}

fn current(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = ctx.process.running_fiber().unwrap_or(FiberHandle::NULL);
    ctx.push(handle.to_value())
}

fn parent(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = ctx
        .process
        .current_fiber()
        .and_then(|f| f.parent)
        .unwrap_or(FiberHandle::NULL);
    ctx.push(handle.to_value())
}

fn done(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = FiberHandle::from_value(ctx.pop()?);
    let is_done = ctx.process.fiber_done(handle).map_err(|_| Panic::new("invalid fiber handle"))?;
    ctx.push(Value::from_uint(is_done as u64))
}

fn resume(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = FiberHandle::from_value(ctx.pop()?);
    ctx.process
        .fiber_resume(handle, 1, true)
        .map_err(|_| Panic::new("fiber is not ready or suspended"))
}

fn suspend(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    ctx.process.fiber_suspend(1).map_err(|_| Panic::new("fiber has no parent to suspend to"))
}

/// `resume` without reassigning the target's parent — symmetric handoff
/// between coroutines that already agreed on their relationship.
fn transfer(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let handle = FiberHandle::from_value(ctx.pop()?);
    ctx.process
        .fiber_resume(handle, 1, false)
        .map_err(|_| Panic::new("fiber is not ready or suspended"))
}

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.fiber");
    lib.register("create", 1, 1, create);
    lib.register("destroy", 1, 0, destroy);
    lib.register("destroy_forced", 1, 0, destroy_forced);
    lib.register("current", 0, 1, current);
    lib.register("parent", 0, 1, parent);
    lib.register("done", 1, 1, done);
    lib.register("resume", 2, 1, resume);
    lib.register("suspend", 1, 1, suspend);
    lib.register("transfer", 2, 1, transfer);
    lib
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauf_image::ModuleBuilder;
    use lauf_process::{BuiltinContext, BuiltinTable, Process, ProcessConfig};
    use lauf_types::{FunctionAddress, Signature};
    use pretty_assertions::assert_eq;

    fn ping_pong_module() -> lauf_image::Module {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("child", Signature::new(0, 0));
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn destroying_a_ready_fiber_without_force_is_rejected() {
        let module = ping_pong_module();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = Process::new(&module, entry, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);

        ctx.push(Value::from_function_address(entry)).unwrap();
        create(&mut ctx).unwrap();
        let handle_value = ctx.pop().unwrap();

        ctx.push(handle_value).unwrap();
        assert!(destroy(&mut ctx).is_err());
    }

    #[test]
    fn force_destroying_a_ready_fiber_reclaims_it() {
        let module = ping_pong_module();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = Process::new(&module, entry, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);

        ctx.push(Value::from_function_address(entry)).unwrap();
        create(&mut ctx).unwrap();
        let handle_value = ctx.pop().unwrap();

        ctx.push(handle_value).unwrap();
        destroy_forced(&mut ctx).unwrap();
    }

    #[test]
    fn destroying_a_done_fiber_without_force_succeeds() {
        let module = ping_pong_module();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = Process::new(&module, entry, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        let builtins = BuiltinTable::new();

        let handle = process.fiber_create(entry).unwrap();
        process.fiber_resume(handle, 0, true).unwrap();
        // Drive the child's `return_()` (and then the root's own) to
        // completion so the target is genuinely `done`.
        lauf_process::run(&mut process, &builtins).unwrap();
        assert!(process.fiber_done(handle).unwrap());

        process.fiber_destroy(handle, false).unwrap();
    }

    #[test]
    fn current_fiber_has_no_parent_at_the_root() {
        let module = ping_pong_module();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = Process::new(&module, entry, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);

        parent(&mut ctx).unwrap();
        let handle = FiberHandle::from_value(ctx.pop().unwrap());
        assert!(handle.is_null());
    }
}
