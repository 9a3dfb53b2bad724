// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Component D: the per-process memory manager. Owns the allocation table
//! behind every `Address`, and is the sole place that turns a bytecode
//! address into a native pointer.

pub mod allocation;
pub mod manager;

pub use allocation::{AccessMode, Allocation, AllocationSource, AllocationStatus};
pub use manager::{FreeError, FreedBytes, MemoryManager, ResolveError};
