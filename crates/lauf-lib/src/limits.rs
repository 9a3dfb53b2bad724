// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.limits`: the step budget built-ins, grounded on
//! `src/lauf/lib/limits.cpp`. `step` is meant to be woven into generated
//! code at function entry and loop back-edges by whatever produces the
//! bytecode, not called by hand for every instruction the way `consume_step`
//! already is inside the dispatch loop itself — the two enforce the same
//! budget from two different callers.

use lauf_process::{BuiltinContext, BuiltinLibrary, Panic};

fn set_step_limit(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let limit = ctx.pop()?.as_uint();
    ctx.process.set_step_limit(limit)
}

fn step(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    ctx.process.consume_step()
}

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.limits");
    lib.register("set_step_limit", 1, 0, set_step_limit);
    lib.register("step", 0, 0, step);
    lib
}
