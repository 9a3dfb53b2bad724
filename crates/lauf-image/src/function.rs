// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use lauf_types::{Instruction, Signature};

use crate::debug_location::DebugLocation;

/// An immutable function, finished by `ModuleBuilder::finish_function`.
pub struct Function {
    pub name: String,
    pub signature: Signature,
    pub max_vstack_size: u16,
    pub local_stack_size: u32,
    pub instructions: Vec<Instruction>,
    /// `(instruction_index, location)`, sorted and deduplicated by index;
    /// a location applies from its index up to (not including) the next
    /// entry's index.
    debug_locations: Vec<(u32, DebugLocation)>,
}

impl Function {
    pub fn new(
        name: String,
        signature: Signature,
        max_vstack_size: u16,
        local_stack_size: u32,
        instructions: Vec<Instruction>,
        debug_locations: Vec<(u32, DebugLocation)>,
    ) -> Self {
        Self {
            name,
            signature,
            max_vstack_size,
            local_stack_size,
            instructions,
            debug_locations,
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Looks up the source location in effect at `instruction_index`, or
    /// `None` if no debug information was recorded before it.
    pub fn debug_location_at(&self, instruction_index: u32) -> Option<DebugLocation> {
        match self
            .debug_locations
            .binary_search_by_key(&instruction_index, |(idx, _)| *idx)
        {
            Ok(i) => Some(self.debug_locations[i].1),
            Err(0) => None,
            Err(i) => Some(self.debug_locations[i - 1].1),
        }
    }
}
