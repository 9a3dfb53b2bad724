// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The VM options table, in `ProgramSettings`'s shape: a
//! plain struct with a `Default` impl, plus a small fluent builder since
//! unlike `ProgramSettings` this one has optional collaborator hooks
//! (`panic_handler`, `allocator`) that read awkwardly as positional
//! constructor arguments.

use std::alloc::Layout;
use std::sync::Arc;

use lauf_process::{Panic, ProcessConfig, VmAllocator};

/// `(process, message, stacktrace) -> void`; receives the panic that
/// escaped the root fiber before `Vm::run` returns it to the caller.
pub type PanicHandler = fn(&Panic);

fn default_panic_handler(panic: &Panic) {
    eprintln!("{}", panic);
}

struct SharedAllocator(Arc<dyn VmAllocator>);

impl VmAllocator for SharedAllocator {
    unsafe fn allocate(&self, layout: Layout) -> *mut u8 {
        self.0.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        self.0.deallocate(ptr, layout)
    }
}

/// The VM options table. `allocator` is shared across every
/// `Process` a `Vm` runs rather than moved into one, since `VmAllocator`'s
/// methods already take `&self` — the same heap-allocator pair is meant to
/// serve every process a `Vm` runs.
#[derive(Clone)]
pub struct VmOptions {
    pub panic_handler: Option<PanicHandler>,
    pub allocator: Option<Arc<dyn VmAllocator>>,
    pub initial_vstack_size_in_elements: usize,
    pub max_vstack_size_in_elements: usize,
    pub initial_cstack_size_in_bytes: usize,
    pub max_cstack_size_in_bytes: usize,
    pub step_limit: u64,
    /// Opaque pointer delivered to built-ins through `Process::user_data`,
    /// shared across every process this `Vm` runs.
    pub user_data: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

impl Default for VmOptions {
    fn default() -> Self {
        let config = ProcessConfig::default();
        Self {
            panic_handler: Some(default_panic_handler as PanicHandler),
            allocator: None,
            initial_vstack_size_in_elements: config.initial_vstack_elements,
            max_vstack_size_in_elements: config.max_vstack_elements,
            initial_cstack_size_in_bytes: config.initial_cstack_bytes,
            max_cstack_size_in_bytes: config.max_cstack_bytes,
            step_limit: config.step_limit,
            user_data: None,
        }
    }
}

impl VmOptions {
    /// Boxes up a fresh `VmAllocator` for one `Process`, sharing whatever
    /// allocator was configured — `None` falls back to `Process::new`'s own
    /// default (the global Rust allocator).
    pub(crate) fn make_allocator(&self) -> Option<Box<dyn VmAllocator>> {
        self.allocator.clone().map(|shared| Box::new(SharedAllocator(shared)) as Box<dyn VmAllocator>)
    }
}

#[derive(Default)]
pub struct VmOptionsBuilder {
    options: VmOptions,
}

impl VmOptionsBuilder {
    pub fn new() -> Self {
        Self { options: VmOptions::default() }
    }

    pub fn panic_handler(mut self, handler: PanicHandler) -> Self {
        self.options.panic_handler = Some(handler);
        self
    }

    pub fn no_panic_handler(mut self) -> Self {
        self.options.panic_handler = None;
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn VmAllocator>) -> Self {
        self.options.allocator = Some(allocator);
        self
    }

    pub fn user_data(mut self, data: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        self.options.user_data = Some(data);
        self
    }

    pub fn initial_vstack_size_in_elements(mut self, n: usize) -> Self {
        self.options.initial_vstack_size_in_elements = n;
        self
    }

    pub fn max_vstack_size_in_elements(mut self, n: usize) -> Self {
        self.options.max_vstack_size_in_elements = n;
        self
    }

    pub fn initial_cstack_size_in_bytes(mut self, n: usize) -> Self {
        self.options.initial_cstack_size_in_bytes = n;
        self
    }

    pub fn max_cstack_size_in_bytes(mut self, n: usize) -> Self {
        self.options.max_cstack_size_in_bytes = n;
        self
    }

    pub fn step_limit(mut self, n: u64) -> Self {
        self.options.step_limit = n;
        self
    }

    pub fn build(self) -> VmOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_overrides_only_the_fields_it_touches() {
        let options = VmOptionsBuilder::new().step_limit(10).build();
        assert_eq!(options.step_limit, 10);
        assert_eq!(options.initial_vstack_size_in_elements, ProcessConfig::default().initial_vstack_elements);
    }
}
