// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Component G: one cooperative fiber — its own value/call stacks, current
//! instruction position, and recovery scopes.

use lauf_stack::{CallStack, ValueStack};
use lauf_types::{FunctionAddress, Value};

use crate::panic::CatchPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Ready,
    Running,
    Suspended,
    Done,
}

/// A stable handle to a fiber, in the same `(index, generation)` shape the
/// memory manager uses for allocations — same rationale, one structural
/// pattern applied twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberHandle {
    pub index: u32,
    pub generation: u8,
}

impl FiberHandle {
    /// The reserved all-ones value denoting "no fiber" — used by
    /// `lauf-lib`'s `fiber_parent` when the queried fiber has none.
    pub const NULL: FiberHandle = FiberHandle {
        index: u32::MAX,
        generation: u8::MAX,
    };

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Packs into a `Value` the same way `Address`/`FunctionAddress` do,
    /// so bytecode can carry a fiber handle across the value stack.
    pub fn to_value(self) -> Value {
        Value::from_uint(self.index as u64 | ((self.generation as u64) << 32))
    }

    pub fn from_value(value: Value) -> Self {
        let bits = value.as_uint();
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u8,
        }
    }
}

pub struct Fiber {
    pub state: FiberState,
    pub value_stack: ValueStack,
    pub call_stack: CallStack,
    pub parent: Option<FiberHandle>,
    pub generation: u8,
    pub current_function: FunctionAddress,
    pub ip: usize,
    pub catch_points: Vec<CatchPoint>,
}

impl Fiber {
    pub fn new(
        value_stack: ValueStack,
        call_stack: CallStack,
        parent: Option<FiberHandle>,
        generation: u8,
        entry_function: FunctionAddress,
    ) -> Self {
        Self {
            state: FiberState::Ready,
            value_stack,
            call_stack,
            parent,
            generation,
            current_function: entry_function,
            ip: 0,
            catch_points: Vec::new(),
        }
    }
}
