// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.int`: checked/wrapping/saturating arithmetic and three-way
//! comparison, grounded on `lauf_sadd_builtin`/`lauf_ssub_builtin`/
//! `lauf_smul_builtin`/`lauf_scmp_builtin` and their unsigned counterparts
//! (`src/lib/int_aarch64.cpp`, `benchmarks/trivial.cpp`). The original
//! builds one distinct builtin per `lauf_integer_overflow` mode rather
//! than branching on a runtime flag; each mode gets its own entry here for
//! the same reason — a `call_builtin` site names its overflow behavior
//! statically, at assembly time, not as a value.
//!
//! Every binary entry pops its right-hand operand (pushed last) before
//! its left-hand one, so `push a; push b; call_builtin` computes `a op b`.

use lauf_process::{BuiltinContext, BuiltinFlags, BuiltinLibrary, Panic};
use lauf_types::Value;

macro_rules! checked_op {
    ($name:ident, $method:ident, $as_ty:ident, $from_ty:ident) => {
        fn $name(ctx: &mut BuiltinContext) -> Result<(), Panic> {
            let b = ctx.pop()?.$as_ty();
            let a = ctx.pop()?.$as_ty();
            let result = a.$method(b).ok_or_else(|| Panic::new("integer overflow"))?;
            ctx.push(Value::$from_ty(result))
        }
    };
}

macro_rules! wrapping_op {
    ($name:ident, $method:ident, $as_ty:ident, $from_ty:ident) => {
        fn $name(ctx: &mut BuiltinContext) -> Result<(), Panic> {
            let b = ctx.pop()?.$as_ty();
            let a = ctx.pop()?.$as_ty();
            ctx.push(Value::$from_ty(a.$method(b)))
        }
    };
}

macro_rules! saturating_op {
    ($name:ident, $method:ident, $as_ty:ident, $from_ty:ident) => {
        fn $name(ctx: &mut BuiltinContext) -> Result<(), Panic> {
            let b = ctx.pop()?.$as_ty();
            let a = ctx.pop()?.$as_ty();
            ctx.push(Value::$from_ty(a.$method(b)))
        }
    };
}

checked_op!(sadd_panic, checked_add, as_sint, from_sint);
wrapping_op!(sadd_wrap, wrapping_add, as_sint, from_sint);
saturating_op!(sadd_saturate, saturating_add, as_sint, from_sint);

checked_op!(ssub_panic, checked_sub, as_sint, from_sint);
wrapping_op!(ssub_wrap, wrapping_sub, as_sint, from_sint);
saturating_op!(ssub_saturate, saturating_sub, as_sint, from_sint);

checked_op!(smul_panic, checked_mul, as_sint, from_sint);
wrapping_op!(smul_wrap, wrapping_mul, as_sint, from_sint);
saturating_op!(smul_saturate, saturating_mul, as_sint, from_sint);

checked_op!(uadd_panic, checked_add, as_uint, from_uint);
wrapping_op!(uadd_wrap, wrapping_add, as_uint, from_uint);
saturating_op!(uadd_saturate, saturating_add, as_uint, from_uint);

checked_op!(usub_panic, checked_sub, as_uint, from_uint);
wrapping_op!(usub_wrap, wrapping_sub, as_uint, from_uint);
saturating_op!(usub_saturate, saturating_sub, as_uint, from_uint);

checked_op!(umul_panic, checked_mul, as_uint, from_uint);
wrapping_op!(umul_wrap, wrapping_mul, as_uint, from_uint);
saturating_op!(umul_saturate, saturating_mul, as_uint, from_uint);

fn scmp(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let b = ctx.pop()?.as_sint();
    let a = ctx.pop()?.as_sint();
    ctx.push(Value::from_sint(a.cmp(&b) as i64))
}

fn ucmp(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let b = ctx.pop()?.as_uint();
    let a = ctx.pop()?.as_uint();
    ctx.push(Value::from_sint(a.cmp(&b) as i64))
}

/// Every entry here only ever touches the value stack, never
/// `BuiltinContext::process` — `no_process` holds for the whole library.
/// The `.wrap`/`.saturate`/compare entries additionally never return a
/// panic, unlike their `.panic` counterparts.
const PANICKING: BuiltinFlags = BuiltinFlags {
    no_panic: false,
    no_process: true,
    vm_only: false,
};
const NON_PANICKING: BuiltinFlags = BuiltinFlags {
    no_panic: true,
    no_process: true,
    vm_only: false,
};

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.int");
    lib.register_with_flags("sadd.panic", 2, 1, PANICKING, sadd_panic);
    lib.register_with_flags("sadd.wrap", 2, 1, NON_PANICKING, sadd_wrap);
    lib.register_with_flags("sadd.saturate", 2, 1, NON_PANICKING, sadd_saturate);
    lib.register_with_flags("ssub.panic", 2, 1, PANICKING, ssub_panic);
    lib.register_with_flags("ssub.wrap", 2, 1, NON_PANICKING, ssub_wrap);
    lib.register_with_flags("ssub.saturate", 2, 1, NON_PANICKING, ssub_saturate);
    lib.register_with_flags("smul.panic", 2, 1, PANICKING, smul_panic);
    lib.register_with_flags("smul.wrap", 2, 1, NON_PANICKING, smul_wrap);
    lib.register_with_flags("smul.saturate", 2, 1, NON_PANICKING, smul_saturate);
    lib.register_with_flags("uadd.panic", 2, 1, PANICKING, uadd_panic);
    lib.register_with_flags("uadd.wrap", 2, 1, NON_PANICKING, uadd_wrap);
    lib.register_with_flags("uadd.saturate", 2, 1, NON_PANICKING, uadd_saturate);
    lib.register_with_flags("usub.panic", 2, 1, PANICKING, usub_panic);
    lib.register_with_flags("usub.wrap", 2, 1, NON_PANICKING, usub_wrap);
    lib.register_with_flags("usub.saturate", 2, 1, NON_PANICKING, usub_saturate);
    lib.register_with_flags("umul.panic", 2, 1, PANICKING, umul_panic);
    lib.register_with_flags("umul.wrap", 2, 1, NON_PANICKING, umul_wrap);
    lib.register_with_flags("umul.saturate", 2, 1, NON_PANICKING, umul_saturate);
    lib.register_with_flags("scmp", 2, 1, NON_PANICKING, scmp);
    lib.register_with_flags("ucmp", 2, 1, NON_PANICKING, ucmp);
    lib
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run_builtin, run_builtin_err};
    use pretty_assertions::assert_eq;

    #[test]
    fn trivial_add_is_forty_two_plus_eleven() {
        assert_eq!(run_builtin(sadd_panic, &[42, 11]).as_sint(), 53);
    }

    #[test]
    fn sadd_panic_on_overflow() {
        let panic = run_builtin_err(sadd_panic, &[i64::MAX as u64, 1]);
        assert_eq!(panic.message, "integer overflow");
    }

    #[test]
    fn sadd_wrap_wraps_around() {
        assert_eq!(run_builtin(sadd_wrap, &[i64::MAX as u64, 1]).as_sint(), i64::MIN);
    }

    #[test]
    fn sadd_saturate_clamps_to_max() {
        assert_eq!(run_builtin(sadd_saturate, &[i64::MAX as u64, 1]).as_sint(), i64::MAX);
    }

    #[test]
    fn smul_panic_trivial() {
        assert_eq!(run_builtin(smul_panic, &[6, 7]).as_sint(), 42);
    }

    #[test]
    fn scmp_three_way() {
        assert_eq!(run_builtin(scmp, &[1, 2]).as_sint(), -1);
        assert_eq!(run_builtin(scmp, &[2, 2]).as_sint(), 0);
        assert_eq!(run_builtin(scmp, &[3, 2]).as_sint(), 1);
    }

    #[test]
    fn usub_wrap_underflows() {
        assert_eq!(run_builtin(usub_wrap, &[0, 1]).as_uint(), u64::MAX);
    }
}
