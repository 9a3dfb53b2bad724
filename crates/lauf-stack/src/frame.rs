// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use lauf_types::{Address, FunctionAddress};

/// The activation record for one in-progress call: which function is
/// running, where to resume the caller, where the caller's operands start
/// (for argument/return accounting), and the frame's local-data allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub function: FunctionAddress,
    pub return_ip: usize,
    pub caller_vstack_depth: usize,
    pub locals: Address,
}

impl Frame {
    pub fn new(
        function: FunctionAddress,
        return_ip: usize,
        caller_vstack_depth: usize,
        locals: Address,
    ) -> Self {
        Self {
            function,
            return_ip,
            caller_vstack_depth,
            locals,
        }
    }
}
