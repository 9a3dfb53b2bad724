// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The per-process allocation table. Grounded on the slot-reuse pattern in
//! `crates/allocator/src/simple_allocator.rs` (`Vec<Option<MemoryItem>>`
//! with a linear scan for a free slot), generalized with the 2-bit
//! generation counter from `lauf_runtime_address`.

use std::fmt;

use lauf_types::Address;

use crate::allocation::{AccessMode, Allocation, AllocationSource, AllocationStatus};

/// The maximum generation value a 2-bit counter can hold.
const MAX_GENERATION: u8 = 0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    Invalid,
    WrongSource,
    WrongGeneration,
    DoubleFree,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FreeError::Invalid => "invalid address",
            FreeError::WrongSource => "wrong allocation source",
            FreeError::WrongGeneration => "wrong generation",
            FreeError::DoubleFree => "double free",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    InvalidAddress,
    WrongGeneration,
    Poisoned,
    Freed,
    OutOfBounds,
    Misaligned,
    WriteToConst,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ResolveError::InvalidAddress => "invalid address",
            ResolveError::WrongGeneration => "wrong generation",
            ResolveError::Poisoned => "access to poisoned memory",
            ResolveError::Freed => "access to freed memory",
            ResolveError::OutOfBounds => "out of bounds access",
            ResolveError::Misaligned => "misaligned access",
            ResolveError::WriteToConst => "write to read-only memory",
        };
        f.write_str(msg)
    }
}

/// What `free()` hands back so a caller (e.g. the heap built-in) can
/// release the underlying bytes to the right pool. `None` for sources that
/// are book-keeping only.
pub struct FreedBytes {
    pub ptr: *mut u8,
    pub size: usize,
    pub align: usize,
}

/// The per-process allocation table: `allocate`,
/// `free`, `poison`/`unpoison`, `resolve`.
#[derive(Default)]
pub struct MemoryManager {
    slots: Vec<Allocation>,
    /// Indices of freed slots still eligible for reuse (generation hasn't
    /// exhausted its 2-bit window).
    free_list: Vec<u32>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Registers already-allocated bytes (obtained by the caller from the
    /// appropriate pool: the VM allocator for heap, the frame bump region
    /// for locals, program memory for static data) under a fresh or
    /// recycled allocation id.
    pub fn allocate(
        &mut self,
        source: AllocationSource,
        ptr: *mut u8,
        size: usize,
        align: usize,
    ) -> Address {
        if let Some(id) = self.free_list.pop() {
            let slot = &mut self.slots[id as usize];
            debug_assert_eq!(slot.status, AllocationStatus::Freed);
            slot.ptr = ptr;
            slot.size = size;
            slot.align = align;
            slot.source = source;
            slot.status = AllocationStatus::Allocated;
            slot.generation += 1;
            debug_assert!(slot.generation <= MAX_GENERATION);
            return Address::new(id, slot.generation, 0);
        }

        let id = self.slots.len() as u32;
        self.slots.push(Allocation::new(ptr, size, align, source));
        Address::new(id, 0, 0)
    }

    fn slot(&self, id: u32) -> Option<&Allocation> {
        self.slots.get(id as usize)
    }

    fn slot_mut(&mut self, id: u32) -> Option<&mut Allocation> {
        self.slots.get_mut(id as usize)
    }

    pub fn free(
        &mut self,
        address: Address,
        expected_source: AllocationSource,
    ) -> Result<FreedBytes, FreeError> {
        let id = address.allocation;
        let slot = self.slot_mut(id).ok_or(FreeError::Invalid)?;

        if slot.generation != address.generation {
            return Err(FreeError::WrongGeneration);
        }
        if slot.source != expected_source {
            return Err(FreeError::WrongSource);
        }
        match slot.status {
            AllocationStatus::Freed => return Err(FreeError::DoubleFree),
            AllocationStatus::Allocated | AllocationStatus::Poisoned => {}
            AllocationStatus::Split => return Err(FreeError::Invalid),
        }

        let freed = FreedBytes {
            ptr: slot.ptr,
            size: slot.size,
            align: slot.align,
        };
        slot.status = AllocationStatus::Freed;

        // Generation exhaustion: once a slot has cycled through all four
        // generation values, it is retired rather than reused, so a stale
        // address can never alias a live one within the 2-bit window. See
        // DESIGN.md for why widening the field was rejected.
        if slot.generation < MAX_GENERATION {
            self.free_list.push(id);
        }

        Ok(freed)
    }

    pub fn poison(&mut self, address: Address) -> Result<(), ResolveError> {
        let slot = self.lookup_live_mut(address)?;
        slot.status = AllocationStatus::Poisoned;
        Ok(())
    }

    pub fn unpoison(&mut self, address: Address) -> Result<(), ResolveError> {
        let id = address.allocation;
        let slot = self.slot_mut(id).ok_or(ResolveError::InvalidAddress)?;
        if slot.generation != address.generation {
            return Err(ResolveError::WrongGeneration);
        }
        if slot.status != AllocationStatus::Poisoned {
            return Err(ResolveError::InvalidAddress);
        }
        slot.status = AllocationStatus::Allocated;
        Ok(())
    }

    fn lookup_live_mut(&mut self, address: Address) -> Result<&mut Allocation, ResolveError> {
        let id = address.allocation;
        let slot = self.slot_mut(id).ok_or(ResolveError::InvalidAddress)?;
        if slot.generation != address.generation {
            return Err(ResolveError::WrongGeneration);
        }
        match slot.status {
            AllocationStatus::Allocated => Ok(slot),
            AllocationStatus::Poisoned => Err(ResolveError::Poisoned),
            AllocationStatus::Freed | AllocationStatus::Split => Err(ResolveError::Freed),
        }
    }

    /// Performs the generation match, status check, bounds check and
    /// alignment check atomically from the caller's perspective, returning
    /// a native pointer to the first byte of the access.
    pub fn resolve(
        &self,
        address: Address,
        size: usize,
        align: usize,
        access_mode: AccessMode,
    ) -> Result<*mut u8, ResolveError> {
        let slot = self.slot(address.allocation).ok_or(ResolveError::InvalidAddress)?;

        if slot.generation != address.generation {
            return Err(ResolveError::WrongGeneration);
        }
        match slot.status {
            AllocationStatus::Allocated => {}
            AllocationStatus::Poisoned => return Err(ResolveError::Poisoned),
            AllocationStatus::Freed | AllocationStatus::Split => return Err(ResolveError::Freed),
        }
        if access_mode == AccessMode::ReadWrite && slot.source == AllocationSource::StaticConst {
            return Err(ResolveError::WriteToConst);
        }

        let offset = address.offset as usize;
        let end = offset.checked_add(size).ok_or(ResolveError::OutOfBounds)?;
        if end > slot.size {
            return Err(ResolveError::OutOfBounds);
        }

        // SAFETY: `offset + size <= slot.size` just checked, `slot.ptr`
        // points to `slot.size` live bytes owned by this allocation.
        let ptr = unsafe { slot.ptr.add(offset) };
        if align != 0 && (ptr as usize) % align != 0 {
            return Err(ResolveError::Misaligned);
        }

        Ok(ptr)
    }

    pub fn allocation_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fake_bytes(size: usize) -> *mut u8 {
        Box::into_raw(vec![0u8; size].into_boxed_slice()) as *mut u8
    }

    #[test]
    fn freed_slot_is_reused_with_incremented_generation() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        mm.free(a, AllocationSource::Heap).unwrap();

        let b = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        assert_eq!(a.allocation, b.allocation);
        assert_eq!(b.generation, a.generation + 1);
    }

    #[test]
    fn stale_address_never_resolves_after_reuse() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        mm.free(a, AllocationSource::Heap).unwrap();
        let _b = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);

        let err = mm
            .resolve(a, 1, 1, AccessMode::Read)
            .expect_err("stale address must not resolve");
        assert_eq!(err, ResolveError::WrongGeneration);
    }

    #[test]
    fn double_free_is_rejected_and_leaves_slot_unchanged() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        mm.free(a, AllocationSource::Heap).unwrap();

        let before_generation = mm.slot(a.allocation).unwrap().generation;
        let err = mm.free(a, AllocationSource::Heap).unwrap_err();
        assert_eq!(err, FreeError::DoubleFree);
        assert_eq!(mm.slot(a.allocation).unwrap().generation, before_generation);
    }

    #[test]
    fn wrong_source_is_rejected() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        let err = mm.free(a, AllocationSource::StaticMut).unwrap_err();
        assert_eq!(err, FreeError::WrongSource);
    }

    #[test]
    fn poison_makes_every_access_fail() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        mm.poison(a).unwrap();

        let err = mm.resolve(a, 1, 1, AccessMode::Read).unwrap_err();
        assert_eq!(err, ResolveError::Poisoned);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        let err = mm.resolve(a, 16, 1, AccessMode::Read).unwrap_err();
        assert_eq!(err, ResolveError::OutOfBounds);
    }

    #[test]
    fn static_const_rejects_writes() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(AllocationSource::StaticConst, fake_bytes(8), 8, 1);
        let err = mm.resolve(a, 1, 1, AccessMode::ReadWrite).unwrap_err();
        assert_eq!(err, ResolveError::WriteToConst);
        assert!(mm.resolve(a, 1, 1, AccessMode::Read).is_ok());
    }

    #[test]
    fn generation_exhaustion_retires_the_slot() {
        let mut mm = MemoryManager::new();
        let mut addr = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        // Cycle through all four generations (0..=3); the fourth free must
        // retire the slot instead of recycling it.
        for _ in 0..3 {
            mm.free(addr, AllocationSource::Heap).unwrap();
            addr = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        }
        assert_eq!(addr.generation, 3);
        mm.free(addr, AllocationSource::Heap).unwrap();

        let count_before = mm.allocation_count();
        let _new_addr = mm.allocate(AllocationSource::Heap, fake_bytes(8), 8, 1);
        assert_eq!(mm.allocation_count(), count_before + 1, "retired slot must not be reused");
    }
}
