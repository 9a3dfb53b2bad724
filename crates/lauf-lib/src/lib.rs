// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The built-in libraries bytecode reaches through `call_builtin`: bits,
//! checked/wrapping/saturating integer arithmetic, the heap, raw memory
//! access, fibers, the step-limit budget, debug printing and test
//! assertions. Each module owns one `lauf-process::BuiltinLibrary`; the
//! root `lauf` crate links whichever subset a program needs into a
//! `BuiltinTable` in a fixed order (see `all_libraries`).

pub mod bits;
pub mod debug;
pub mod fiber;
pub mod heap;
pub mod int;
pub mod limits;
pub mod memory;

mod test_support;

use lauf_process::BuiltinLibrary;

/// Every library this crate provides, in the order a `lauf` program
/// linking all of them would see their built-in indices assigned.
pub fn all_libraries() -> Vec<BuiltinLibrary> {
    vec![
        bits::library(),
        int::library(),
        heap::library(),
        memory::library(),
        fiber::library(),
        limits::library(),
        debug::library(),
        test::library(),
    ]
}
