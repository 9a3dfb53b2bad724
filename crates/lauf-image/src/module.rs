// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

use lauf_arena::{Arena, PageAllocator};

use crate::function::Function;
use crate::literal_pool::LiteralPool;
use crate::static_data::StaticDataSegment;

/// An immutable, finished module: a name, an optional source path, a
/// literal pool, a function table indexed by function index, a static-data
/// segment, and the arena that backs the builder's allocations. Nothing
/// about a `Module` changes after `ModuleBuilder::finish` returns it.
pub struct Module {
    pub name: String,
    pub path: Option<String>,
    literal_pool: LiteralPool,
    functions: Vec<Function>,
    static_data: StaticDataSegment,
    /// Kept alive for the lifetime of the module; not otherwise consulted
    /// once `finish` has run since `functions`/`literal_pool` are ordinary
    /// owned collections. See DESIGN.md for the scoping rationale.
    _arena: Arena,
    _pages: PageAllocator,
}

impl Module {
    pub(crate) fn new(
        name: String,
        path: Option<String>,
        literal_pool: LiteralPool,
        functions: Vec<Function>,
        static_data: StaticDataSegment,
        arena: Arena,
        pages: PageAllocator,
    ) -> Self {
        Self {
            name,
            path,
            literal_pool,
            functions,
            static_data,
            _arena: arena,
            _pages: pages,
        }
    }

    pub fn function(&self, index: u16) -> Option<&Function> {
        self.functions.get(index as usize)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function_index_by_name(&self, name: &str) -> Option<u16> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|idx| idx as u16)
    }

    pub fn literal(&self, idx: u32) -> Option<lauf_types::Value> {
        self.literal_pool.get(idx)
    }

    pub fn static_data(&self) -> &StaticDataSegment {
        &self.static_data
    }
}
