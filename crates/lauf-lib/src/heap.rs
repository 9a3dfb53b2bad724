// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.heap`: dynamic allocation through the process's `VmAllocator`,
//! grounded directly on `src/lauf/lib/heap.cpp`. `alloc` pops `size`
//! (pushed last) then `alignment`; `free`/`leak` take the address alone.

use std::alloc::Layout;

use lauf_memory::AllocationSource;
use lauf_process::{BuiltinContext, BuiltinFlags, BuiltinLibrary, Panic};
use lauf_types::Value;

/// Every entry here reaches into the process's allocator, so none of them
/// can run in a JIT-compiled context without a live process pointer.
const VM_ONLY: BuiltinFlags = BuiltinFlags {
    no_panic: false,
    no_process: false,
    vm_only: true,
};

fn alloc(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let size = ctx.pop()?.as_uint() as usize;
    let alignment = ctx.pop()?.as_uint() as usize;
    let alignment = alignment.max(1);
    if size == 0 {
        return ctx.push(Value::from_address(lauf_types::Address::NULL));
    }
    let layout = Layout::from_size_align(size, alignment).map_err(|_| Panic::new("invalid heap layout"))?;
    // SAFETY: `layout` has non-zero size, just checked above.
    let ptr = unsafe { ctx.process.allocate_heap_bytes(layout) };
    if ptr.is_null() {
        return Err(Panic::new("out of memory"));
    }
    let address = ctx.process.memory_mut().allocate(AllocationSource::Heap, ptr, size, alignment);
    ctx.push(Value::from_address(address))
}

fn free(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let address = ctx.pop()?.as_address();
    let freed = ctx
        .process
        .memory_mut()
        .free(address, AllocationSource::Heap)
        .map_err(|_| Panic::new("invalid heap address"))?;
    if let Ok(layout) = Layout::from_size_align(freed.size, freed.align) {
        // SAFETY: `freed.ptr`/layout came from the matching `alloc` above.
        unsafe { ctx.process.deallocate_heap_bytes(freed.ptr, layout) };
    }
    Ok(())
}

/// Marks heap memory as leaked: every future access panics, but the bytes
/// are never handed back to the allocator, matching the header's "prevents
/// code from ever accessing it again" without reclaiming anything.
fn leak(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let address = ctx.pop()?.as_address();
    ctx.process
        .memory_mut()
        .poison(address)
        .map_err(|_| Panic::new("invalid heap address"))
}

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.heap");
    lib.register_with_flags("alloc", 2, 1, VM_ONLY, alloc);
    lib.register_with_flags("free", 1, 0, VM_ONLY, free);
    lib.register_with_flags("leak", 1, 0, VM_ONLY, leak);
    lib
}
