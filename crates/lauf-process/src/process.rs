// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The process owns the allocation table, the fiber table, and the step
//! budget for one execution of a `Module`. Grounded on `crates/context`'s
//! `thread_context`/`thread_resources` split (one resource table shared by
//! every fiber, reused by id) generalized with the `(index, generation)`
//! handle idiom already used for memory allocations.

use std::alloc::Layout;
use std::sync::Arc;

use lauf_image::{GlobalKind, Module};
use lauf_jit::JitCache;
use lauf_memory::{AccessMode, AllocationSource, MemoryManager};
use lauf_stack::{CallStack, Frame, ValueStack};
use lauf_types::{Address, FunctionAddress};

use crate::allocator::{GlobalAllocator, VmAllocator};
use crate::fiber::{Fiber, FiberHandle, FiberState};
use crate::io::{NullReader, NullWriter, Reader, Writer};
use crate::panic::Panic;

pub struct ProcessConfig {
    pub initial_vstack_elements: usize,
    pub max_vstack_elements: usize,
    pub initial_cstack_bytes: usize,
    pub max_cstack_bytes: usize,
    /// Zero means unlimited.
    pub step_limit: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            initial_vstack_elements: 256,
            max_vstack_elements: 1 << 20,
            initial_cstack_bytes: 4096,
            max_cstack_bytes: 16 << 20,
            step_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    Invalid,
    NotReadyOrSuspended,
    NoParent,
    StillRunning,
    NotDone,
}

/// One execution of a `Module`: the allocation table, the fiber table, and
/// the remaining step budget. Each `Process` owns its own copy of the
/// module's static data ("Static memory is copied from the module so
/// multiple concurrent programs can mutate their globals independently") —
/// the copy happens exactly once, here, when the process is created.
pub struct Process<'m> {
    pub module: &'m Module,
    pub(crate) memory: MemoryManager,
    allocator: Box<dyn VmAllocator>,
    static_memory: Box<[u8]>,
    static_addresses: Vec<Address>,
    pub(crate) fibers: Vec<Option<Fiber>>,
    free_fiber_slots: Vec<u32>,
    pub(crate) running: Option<u32>,
    root: FiberHandle,
    config: ProcessConfig,
    pub(crate) remaining_steps: u64,
    pub(crate) step_limit_ceiling: u64,
    writer: Box<dyn Writer>,
    reader: Box<dyn Reader>,
    user_data: Option<Box<dyn std::any::Any>>,
    pub(crate) jit: Option<Arc<JitCache>>,
}

impl<'m> Process<'m> {
    pub fn new(module: &'m Module, entry_function: FunctionAddress, config: ProcessConfig) -> Self {
        Self::with_allocator(module, entry_function, config, Box::new(GlobalAllocator))
    }

    pub fn with_allocator(
        module: &'m Module,
        entry_function: FunctionAddress,
        config: ProcessConfig,
        allocator: Box<dyn VmAllocator>,
    ) -> Self {
        let mut memory = MemoryManager::new();
        let mut static_memory: Box<[u8]> = module.static_data().template_bytes().to_vec().into_boxed_slice();

        let base = static_memory.as_mut_ptr();
        let static_addresses = module
            .static_data()
            .globals()
            .iter()
            .map(|slot| {
                let source = match slot.kind {
                    GlobalKind::Const => AllocationSource::StaticConst,
                    GlobalKind::Zero | GlobalKind::Mut => AllocationSource::StaticMut,
                };
                // SAFETY: `offset + size <= static_memory.len()` by
                // construction in `StaticDataBuilder`.
                let ptr = unsafe { base.add(slot.offset as usize) };
                memory.allocate(source, ptr, slot.size as usize, slot.align as usize)
            })
            .collect();

        let step_limit_ceiling = config.step_limit;
        let mut process = Self {
            module,
            memory,
            allocator,
            static_memory,
            static_addresses,
            fibers: Vec::new(),
            free_fiber_slots: Vec::new(),
            running: None,
            root: FiberHandle { index: 0, generation: 0 },
            config,
            remaining_steps: step_limit_ceiling,
            step_limit_ceiling,
            writer: Box::new(NullWriter),
            reader: Box::new(NullReader),
            user_data: None,
            jit: None,
        };

        let root = process.create_fiber_internal(entry_function, None);
        process.root = root;
        process
    }

    pub fn static_address(&self, global_index: usize) -> Option<Address> {
        self.static_addresses.get(global_index).copied()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    pub fn root_fiber(&self) -> FiberHandle {
        self.root
    }

    pub fn set_writer(&mut self, writer: Box<dyn Writer>) {
        self.writer = writer;
    }

    pub fn set_reader(&mut self, reader: Box<dyn Reader>) {
        self.reader = reader;
    }

    pub fn writer_mut(&mut self) -> &mut dyn Writer {
        self.writer.as_mut()
    }

    pub fn reader_mut(&mut self) -> &mut dyn Reader {
        self.reader.as_mut()
    }

    /// Installs the cache `dispatch::enter_function` consults before
    /// pushing an interpreter frame for an ordinary call. `None` (the
    /// default) means every call interprets — matching a `Vm` that was
    /// never handed a compiled module.
    pub fn set_jit_cache(&mut self, cache: Arc<JitCache>) {
        self.jit = Some(cache);
    }

    pub fn jit_cache(&self) -> Option<&Arc<JitCache>> {
        self.jit.as_ref()
    }

    /// The opaque `user_data` a `VmOptions` was constructed with,
    /// delivered to built-ins through the process rather than a separate
    /// argument every `BuiltinFn` would otherwise need to thread through.
    pub fn set_user_data(&mut self, data: Box<dyn std::any::Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn std::any::Any> {
        self.user_data.as_deref()
    }

    pub fn user_data_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        self.user_data.as_deref_mut()
    }

    /// The number of fiber slots ever allocated, including destroyed ones
    /// still occupying a slot — an upper bound for `fiber_at`.
    pub fn fiber_slot_count(&self) -> usize {
        self.fibers.len()
    }

    /// Direct slot access by raw index, bypassing the generation check —
    /// used by `lauf-lib`'s `print_all_cstacks` to walk every live fiber
    /// without needing a handle to each one.
    pub fn fiber_at(&self, index: u32) -> Option<&Fiber> {
        self.fibers.get(index as usize).and_then(|f| f.as_ref())
    }

    pub fn running_fiber(&self) -> Option<FiberHandle> {
        self.running.map(|index| FiberHandle {
            index,
            generation: self.fibers[index as usize].as_ref().unwrap().generation,
        })
    }

    /// # Safety
    /// `layout` must have non-zero size.
    pub unsafe fn allocate_heap_bytes(&self, layout: Layout) -> *mut u8 {
        self.allocator.allocate(layout)
    }

    /// # Safety
    /// `ptr`/`layout` must match a prior `allocate_heap_bytes` call.
    pub unsafe fn deallocate_heap_bytes(&self, ptr: *mut u8, layout: Layout) {
        self.allocator.deallocate(ptr, layout)
    }

    fn fiber(&self, handle: FiberHandle) -> Result<&Fiber, FiberError> {
        let slot = self
            .fibers
            .get(handle.index as usize)
            .and_then(|f| f.as_ref())
            .ok_or(FiberError::Invalid)?;
        if slot.generation != handle.generation {
            return Err(FiberError::Invalid);
        }
        Ok(slot)
    }

    fn fiber_mut(&mut self, handle: FiberHandle) -> Result<&mut Fiber, FiberError> {
        let slot = self
            .fibers
            .get_mut(handle.index as usize)
            .and_then(|f| f.as_mut())
            .ok_or(FiberError::Invalid)?;
        if slot.generation != handle.generation {
            return Err(FiberError::Invalid);
        }
        Ok(slot)
    }

    pub fn fiber_state(&self, handle: FiberHandle) -> Result<FiberState, FiberError> {
        Ok(self.fiber(handle)?.state)
    }

    fn create_fiber_internal(&mut self, entry_function: FunctionAddress, parent: Option<FiberHandle>) -> FiberHandle {
        let value_stack = ValueStack::new(self.config.initial_vstack_elements, self.config.max_vstack_elements);
        let call_stack = CallStack::new(self.config.initial_cstack_bytes, self.config.max_cstack_bytes);

        if let Some(id) = self.free_fiber_slots.pop() {
            let generation = self.fibers[id as usize].as_ref().unwrap().generation + 1;
            self.fibers[id as usize] = Some(Fiber::new(value_stack, call_stack, parent, generation, entry_function));
            return FiberHandle { index: id, generation };
        }

        let index = self.fibers.len() as u32;
        self.fibers.push(Some(Fiber::new(value_stack, call_stack, parent, 0, entry_function)));
        FiberHandle { index, generation: 0 }
    }

    /// `fiber_create`: allocates a new fiber in `ready` state, parented to
    /// the currently running one.
    pub fn fiber_create(&mut self, entry_function: FunctionAddress) -> Result<FiberHandle, FiberError> {
        let parent = self.running_fiber();
        Ok(self.create_fiber_internal(entry_function, parent))
    }

    pub fn fiber_done(&self, handle: FiberHandle) -> Result<bool, FiberError> {
        Ok(self.fiber(handle)?.state == FiberState::Done)
    }

    /// `fiber_destroy`: the target must be `done`, or — if `forced` — any
    /// state other than `running`. An unforced destroy of a still-live
    /// `ready`/`suspended` fiber is rejected rather than silently
    /// reclaiming stacks a suspended caller might still resume into.
    /// Reclaims the target's stacks and increments its generation so
    /// stale handles never resolve again.
    pub fn fiber_destroy(&mut self, handle: FiberHandle, forced: bool) -> Result<(), FiberError> {
        if self.running == Some(handle.index) {
            return Err(FiberError::StillRunning);
        }
        let fiber = self.fiber(handle)?;
        if fiber.state != FiberState::Done && !forced {
            return Err(FiberError::NotDone);
        }
        crate::dispatch::free_all_locals(self, handle.index);
        let fiber = self.fiber_mut(handle)?;
        fiber.state = FiberState::Done;
        self.free_fiber_slots.push(handle.index);
        Ok(())
    }

    /// `fiber_resume`: the target must be `ready` or `suspended`. Marks the
    /// current fiber `suspended` and the target `running`, transferring
    /// `input_count` values between their value stacks.
    pub fn fiber_resume(
        &mut self,
        handle: FiberHandle,
        input_count: usize,
        reassign_parent: bool,
    ) -> Result<(), FiberError> {
        let was_ready = {
            let target = self.fiber(handle)?;
            if !matches!(target.state, FiberState::Ready | FiberState::Suspended) {
                return Err(FiberError::NotReadyOrSuspended);
            }
            target.state == FiberState::Ready
        };

        let mut inputs = Vec::with_capacity(input_count);
        if let Some(current_index) = self.running {
            let current = self.fibers[current_index as usize].as_mut().unwrap();
            for _ in 0..input_count {
                if let Ok(v) = current.value_stack.pop() {
                    inputs.push(v);
                }
            }
            inputs.reverse();
            current.state = FiberState::Suspended;
        }

        let target = self.fiber_mut(handle)?;
        for v in inputs {
            let _ = target.value_stack.push(v);
        }
        if reassign_parent {
            target.parent = self.running_fiber();
        }
        target.state = FiberState::Running;
        self.running = Some(handle.index);

        // A fiber's entry function never arrives through `call`/`call_indirect`,
        // so nothing has pushed its frame yet; do it here, the first (and only
        // the first) time it starts running, so `return_`/`argument`/`local_addr`
        // see the same call-stack shape an ordinarily-called function would.
        if was_ready {
            let entry = self.fibers[handle.index as usize].as_ref().unwrap().current_function;
            crate::dispatch::enter_function(self, entry, entry.input_count as usize, usize::MAX)
                .map_err(|_| FiberError::Invalid)?;
        }
        Ok(())
    }

    /// `fiber_suspend`: requires a parent; transfers `output_count` values
    /// to it and makes it `running` again.
    pub fn fiber_suspend(&mut self, output_count: usize) -> Result<(), FiberError> {
        let current_index = self.running.ok_or(FiberError::Invalid)?;
        let parent = self.fibers[current_index as usize]
            .as_ref()
            .unwrap()
            .parent
            .ok_or(FiberError::NoParent)?;

        let mut outputs = Vec::with_capacity(output_count);
        {
            let current = self.fibers[current_index as usize].as_mut().unwrap();
            for _ in 0..output_count {
                if let Ok(v) = current.value_stack.pop() {
                    outputs.push(v);
                }
            }
            outputs.reverse();
            current.state = FiberState::Suspended;
        }

        let parent_fiber = self.fiber_mut(parent)?;
        for v in outputs {
            let _ = parent_fiber.value_stack.push(v);
        }
        parent_fiber.state = FiberState::Running;
        self.running = Some(parent.index);
        Ok(())
    }

    /// Marks the currently running fiber `done`, transferring its
    /// declared outputs to its parent (if any) exactly like `fiber_suspend`
    /// — the distinction is that a `done` fiber never runs again.
    pub fn fiber_complete(&mut self, output_count: usize) -> Result<Option<FiberHandle>, Panic> {
        let current_index = match self.running {
            Some(index) => index,
            None => return Ok(None),
        };
        let parent = self.fibers[current_index as usize].as_ref().unwrap().parent;

        let mut outputs = Vec::with_capacity(output_count);
        {
            let current = self.fibers[current_index as usize].as_mut().unwrap();
            for _ in 0..output_count {
                match current.value_stack.pop() {
                    Ok(v) => outputs.push(v),
                    Err(_) => return Err(Panic::new("missing declared outputs at fiber completion")),
                }
            }
            outputs.reverse();
            current.state = FiberState::Done;
        }

        if let Some(parent) = parent {
            if let Ok(parent_fiber) = self.fiber_mut(parent) {
                for v in outputs {
                    let _ = parent_fiber.value_stack.push(v);
                }
                parent_fiber.state = FiberState::Running;
                self.running = Some(parent.index);
                return Ok(Some(parent));
            }
        }
        self.running = None;
        Ok(None)
    }

    pub fn is_root_done(&self) -> bool {
        self.fiber(self.root)
            .map(|f| f.state == FiberState::Done)
            .unwrap_or(true)
    }

    pub fn current_fiber_mut(&mut self) -> Option<&mut Fiber> {
        self.running.and_then(move |index| self.fibers[index as usize].as_mut())
    }

    pub fn current_fiber(&self) -> Option<&Fiber> {
        self.running.and_then(|index| self.fibers[index as usize].as_ref())
    }

    /// `limits_set_step_limit`: zero (removing the limit entirely) is
    /// always rejected, and a configured ceiling may only ever be
    /// decreased, never raised.
    pub fn set_step_limit(&mut self, n: u64) -> Result<(), Panic> {
        if n == 0 {
            return Err(Panic::new("cannot remove step limit"));
        }
        if self.step_limit_ceiling != 0 && n > self.step_limit_ceiling {
            return Err(Panic::new("cannot increase step limit"));
        }
        self.remaining_steps = n;
        Ok(())
    }

    /// `limits_step`: decrements the remaining budget, panicking at zero.
    /// A budget of zero-forever (never limited) is encoded as
    /// `step_limit_ceiling == 0`.
    pub fn consume_step(&mut self) -> Result<(), Panic> {
        if self.step_limit_ceiling == 0 {
            return Ok(());
        }
        if self.remaining_steps == 0 {
            return Err(Panic::new("step limit exceeded"));
        }
        self.remaining_steps -= 1;
        Ok(())
    }

    /// Lifts the step limit entirely — used when a step-limit panic is
    /// caught by a recovery scope.
    pub fn clear_step_limit(&mut self) {
        self.step_limit_ceiling = 0;
    }

    pub fn push_frame(&mut self, frame: Frame) -> Result<(), Panic> {
        let fiber = self.current_fiber_mut().expect("a fiber must be running to call");
        fiber
            .call_stack
            .push(frame)
            .map_err(|_| Panic::new("cstack_overflow"))
    }

    pub fn pop_frame(&mut self) -> Result<Frame, Panic> {
        let fiber = self.current_fiber_mut().expect("a fiber must be running to return");
        fiber.call_stack.pop().map_err(|_| Panic::new("cstack_underflow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauf_image::ModuleBuilder;
    use lauf_types::Signature;
    use pretty_assertions::assert_eq;

    fn trivial_module() -> Module {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("entry", Signature::new(0, 0));
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn new_process_has_a_running_root_fiber() {
        let module = trivial_module();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut process = Process::new(&module, entry, ProcessConfig::default());
        assert_eq!(process.fiber_state(process.root_fiber()).unwrap(), FiberState::Ready);
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        assert_eq!(process.fiber_state(process.root_fiber()).unwrap(), FiberState::Running);
    }

    #[test]
    fn static_globals_round_trip_through_the_registered_allocation() {
        let mut builder = ModuleBuilder::new("m");
        builder.static_data_mut().add_mut(&[1, 2, 3, 4], 4);
        let mut f = builder.start_function("entry", Signature::new(0, 0));
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();

        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let process = Process::new(&module, entry, ProcessConfig::default());
        let addr = process.static_address(0).unwrap();
        let ptr = process.memory().resolve(addr, 4, 4, AccessMode::Read).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 4) };
        assert_eq!(bytes, &[1, 2, 3, 4]);
    }

    #[test]
    fn step_limit_decrements_and_panics_at_zero() {
        let module = trivial_module();
        let entry = FunctionAddress {
            index: 0,
            input_count: 0,
            output_count: 0,
        };
        let mut config = ProcessConfig::default();
        config.step_limit = 2;
        let mut process = Process::new(&module, entry, config);
        process.consume_step().unwrap();
        process.consume_step().unwrap();
        let err = process.consume_step().unwrap_err();
        assert_eq!(err.message, "step limit exceeded");
    }
}
