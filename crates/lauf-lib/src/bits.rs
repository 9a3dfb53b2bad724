// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.bits`: bitwise-only built-ins, grounded on `lib/bits.h`. Every
//! entry pops its right-hand operand first — the one pushed last — then
//! its left-hand operand, so `push a; push b; call_builtin` reads as
//! `a op b`.

use lauf_process::{BuiltinContext, BuiltinFlags, BuiltinLibrary, Panic};
use lauf_types::Value;

/// Every entry here only ever touches the value stack.
const NO_PROCESS: BuiltinFlags = BuiltinFlags {
    no_panic: false,
    no_process: true,
    vm_only: false,
};
const NO_PROCESS_NO_PANIC: BuiltinFlags = BuiltinFlags {
    no_panic: true,
    no_process: true,
    vm_only: false,
};

fn and(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let b = ctx.pop()?.as_uint();
    let a = ctx.pop()?.as_uint();
    ctx.push(Value::from_uint(a & b))
}

fn or(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let b = ctx.pop()?.as_uint();
    let a = ctx.pop()?.as_uint();
    ctx.push(Value::from_uint(a | b))
}

fn xor(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let b = ctx.pop()?.as_uint();
    let a = ctx.pop()?.as_uint();
    ctx.push(Value::from_uint(a ^ b))
}

fn shl(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let n = ctx.pop()?.as_uint();
    let x = ctx.pop()?.as_uint();
    if n >= 64 {
        return Err(Panic::new("shift amount out of range"));
    }
    ctx.push(Value::from_uint(x << n))
}

fn ushr(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let n = ctx.pop()?.as_uint();
    let x = ctx.pop()?.as_uint();
    if n >= 64 {
        return Err(Panic::new("shift amount out of range"));
    }
    ctx.push(Value::from_uint(x >> n))
}

fn sshr(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let n = ctx.pop()?.as_uint();
    let x = ctx.pop()?.as_sint();
    if n >= 64 {
        return Err(Panic::new("shift amount out of range"));
    }
    ctx.push(Value::from_sint(x >> n))
}

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.bits");
    lib.register_with_flags("and", 2, 1, NO_PROCESS_NO_PANIC, and);
    lib.register_with_flags("or", 2, 1, NO_PROCESS_NO_PANIC, or);
    lib.register_with_flags("xor", 2, 1, NO_PROCESS_NO_PANIC, xor);
    lib.register_with_flags("shl", 2, 1, NO_PROCESS, shl);
    lib.register_with_flags("ushr", 2, 1, NO_PROCESS, ushr);
    lib.register_with_flags("sshr", 2, 1, NO_PROCESS, sshr);
    lib
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_builtin;
    use pretty_assertions::assert_eq;

    #[test]
    fn and_or_xor() {
        assert_eq!(run_builtin(and, &[0b1100, 0b1010]).as_uint(), 0b1000);
        assert_eq!(run_builtin(or, &[0b1100, 0b1010]).as_uint(), 0b1110);
        assert_eq!(run_builtin(xor, &[0b1100, 0b1010]).as_uint(), 0b0110);
    }

    #[test]
    fn shl_discards_overflowed_bits() {
        assert_eq!(run_builtin(shl, &[1, 4]).as_uint(), 16);
    }

    #[test]
    fn sshr_sign_extends() {
        let x = (-8i64) as u64;
        assert_eq!(run_builtin(sshr, &[x, 1]).as_sint(), -4);
    }

    #[test]
    fn ushr_zero_fills() {
        let x = u64::MAX;
        assert_eq!(run_builtin(ushr, &[x, 60]).as_uint(), 0xF);
    }
}
