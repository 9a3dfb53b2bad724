// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! A module's literal pool, deduplicating by bitwise identity of the
//! 8-byte value — ported from
//! `examples/original_source/src/lauf/detail/literal_pool.hpp`'s
//! `memcmp`-based `insert`.

use lauf_types::Value;

#[derive(Default)]
pub struct LiteralPool {
    values: Vec<Value>,
}

impl LiteralPool {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Returns the index of `value` in the pool, appending it only if no
    /// bitwise-identical entry already exists.
    pub fn insert(&mut self, value: Value) -> u32 {
        if let Some(idx) = self.values.iter().position(|existing| existing.0 == value.0) {
            return idx as u32;
        }
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }

    pub fn get(&self, idx: u32) -> Option<Value> {
        self.values.get(idx as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
