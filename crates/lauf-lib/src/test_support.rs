// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Shared scaffolding for built-in unit tests: a process with nothing in
//! it but an empty entry function, just enough to give a `BuiltinContext`
//! a running fiber to push and pop against.

#![cfg(test)]

use lauf_image::{Module, ModuleBuilder};
use lauf_process::{BuiltinContext, BuiltinFn, BuiltinTable, Panic, Process, ProcessConfig};
use lauf_types::{FunctionAddress, Signature, Value};

pub fn trivial_module() -> Module {
    let mut builder = ModuleBuilder::new("test");
    let mut f = builder.start_function("entry", Signature::new(0, 0));
    f.return_().unwrap();
    builder.finish_function(f).unwrap();
    builder.finish().unwrap()
}

pub const TRIVIAL_ENTRY: FunctionAddress = FunctionAddress {
    index: 0,
    input_count: 0,
    output_count: 0,
};

/// Pushes `inputs` (as unsigned words) onto a fresh process, runs `func`,
/// and returns the single value it left behind.
pub fn run_builtin(func: BuiltinFn, inputs: &[u64]) -> Value {
    let module = trivial_module();
    let mut process = Process::new(&module, TRIVIAL_ENTRY, ProcessConfig::default());
    process.fiber_resume(process.root_fiber(), 0, false).unwrap();
    let builtins = BuiltinTable::new();
    let mut ctx = BuiltinContext::new(&mut process, &builtins);
    for &v in inputs {
        ctx.push(Value::from_uint(v)).unwrap();
    }
    func(&mut ctx).unwrap();
    ctx.pop().unwrap()
}

/// Like `run_builtin`, but expects `func` to panic and returns the panic.
pub fn run_builtin_err(func: BuiltinFn, inputs: &[u64]) -> Panic {
    let module = trivial_module();
    let mut process = Process::new(&module, TRIVIAL_ENTRY, ProcessConfig::default());
    process.fiber_resume(process.root_fiber(), 0, false).unwrap();
    let builtins = BuiltinTable::new();
    let mut ctx = BuiltinContext::new(&mut process, &builtins);
    for &v in inputs {
        ctx.push(Value::from_uint(v)).unwrap();
    }
    func(&mut ctx).unwrap_err()
}
