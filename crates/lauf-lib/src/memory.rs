// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.memory`: the address arithmetic and raw load/store built-ins
//! listed alongside the heap family. `load`/`store` thread their
//! access straight through `MemoryManager::resolve`, so every bounds,
//! generation, poison and const-write check the manager already enforces
//! applies here too — these are not a separate unchecked path.
//!
//! `load`/`store` read/write `size` little-endian bytes (`size <= 8`)
//! zero-extended to a full value word; `addr_add` moves within the same
//! allocation without checking bounds until the address is next resolved;
//! `addr_distance` computes the byte offset between two addresses and
//! panics if they don't name the same allocation.

use lauf_memory::AccessMode;
use lauf_process::{BuiltinContext, BuiltinLibrary, Panic};
use lauf_types::Value;

fn load(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let align = ctx.pop()?.as_uint() as usize;
    let size = ctx.pop()?.as_uint() as usize;
    let address = ctx.pop()?.as_address();
    if size == 0 || size > 8 {
        return Err(Panic::new("invalid load size"));
    }
    let ptr = ctx
        .process
        .memory()
        .resolve(address, size, align, AccessMode::Read)
        .map_err(|e| Panic::new(e.to_string()))?;
    // SAFETY: `resolve` just validated `size` live, readable bytes at `ptr`.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(bytes);
    ctx.push(Value::from_uint(u64::from_le_bytes(buf)))
}

fn store(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let value = ctx.pop()?.as_uint();
    let align = ctx.pop()?.as_uint() as usize;
    let size = ctx.pop()?.as_uint() as usize;
    let address = ctx.pop()?.as_address();
    if size == 0 || size > 8 {
        return Err(Panic::new("invalid store size"));
    }
    let ptr = ctx
        .process
        .memory()
        .resolve(address, size, align, AccessMode::ReadWrite)
        .map_err(|e| Panic::new(e.to_string()))?;
    let bytes = value.to_le_bytes();
    // SAFETY: `resolve` just validated `size` live, writable bytes at `ptr`.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, size) };
    Ok(())
}

fn addr_add(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let offset = ctx.pop()?.as_sint();
    let address = ctx.pop()?.as_address();
    ctx.push(Value::from_address(address.offset_by(offset)))
}

fn addr_distance(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let b = ctx.pop()?.as_address();
    let a = ctx.pop()?.as_address();
    if a.allocation != b.allocation || a.generation != b.generation {
        return Err(Panic::new("addresses do not share an allocation"));
    }
    ctx.push(Value::from_sint(b.offset as i64 - a.offset as i64))
}

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.memory");
    lib.register("load", 3, 1, load);
    lib.register("store", 4, 0, store);
    lib.register("addr_add", 2, 1, addr_add);
    lib.register("addr_distance", 2, 1, addr_distance);
    lib
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{trivial_module, TRIVIAL_ENTRY};
    use lauf_memory::AllocationSource;
    use lauf_process::{BuiltinContext, BuiltinTable, Process, ProcessConfig};
    use pretty_assertions::assert_eq;

    #[test]
    fn store_then_load_round_trips() {
        let module = trivial_module();
        let mut process = Process::new(&module, TRIVIAL_ENTRY, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();

        let mut bytes = [0u8; 8];
        let address = process
            .memory_mut()
            .allocate(AllocationSource::Heap, bytes.as_mut_ptr(), 8, 8);

        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);

        ctx.push(Value::from_address(address)).unwrap();
        ctx.push(Value::from_uint(8)).unwrap();
        ctx.push(Value::from_uint(8)).unwrap();
        ctx.push(Value::from_uint(0x1122_3344_5566_7788)).unwrap();
        store(&mut ctx).unwrap();

        ctx.push(Value::from_address(address)).unwrap();
        ctx.push(Value::from_uint(8)).unwrap();
        ctx.push(Value::from_uint(8)).unwrap();
        load(&mut ctx).unwrap();
        assert_eq!(ctx.pop().unwrap().as_uint(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn addr_add_moves_within_the_allocation() {
        let module = trivial_module();
        let mut process = Process::new(&module, TRIVIAL_ENTRY, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        let mut bytes = [0u8; 8];
        let address = process
            .memory_mut()
            .allocate(AllocationSource::Heap, bytes.as_mut_ptr(), 8, 1);

        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);
        ctx.push(Value::from_address(address)).unwrap();
        ctx.push(Value::from_sint(4)).unwrap();
        addr_add(&mut ctx).unwrap();
        let moved = ctx.pop().unwrap().as_address();
        assert_eq!(moved.offset, address.offset + 4);
        assert_eq!(moved.allocation, address.allocation);
    }
}
