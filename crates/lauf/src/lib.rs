// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The `lauf` facade: wires `lauf-image`, `lauf-memory`, `lauf-process` and
//! `lauf-lib` into the one entry point an embedder actually calls —
//! `Vm::run` on a `Program` it already built with `lauf_image::ModuleBuilder`.
//! Kept a library rather than a CLI binary so a host can link it
//! directly instead of shelling out to a separate process.

pub mod io;
pub mod options;
pub mod program;

pub use io::{StdinReader, StdoutWriter};
pub use options::{PanicHandler, VmOptions, VmOptionsBuilder};
pub use program::Program;

use lauf_lib::all_libraries;
use lauf_process::{run, BuiltinTable, Panic, Process, ProcessConfig};

/// One configured VM: a built-in table assembled once from `lauf-lib`, plus
/// the options every `Process` it runs is constructed with.
pub struct Vm {
    options: VmOptions,
    builtins: BuiltinTable,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut builtins = BuiltinTable::new();
        for library in all_libraries() {
            builtins.add_library(library);
        }
        Self { options, builtins }
    }

    pub fn builder() -> VmOptionsBuilder {
        VmOptionsBuilder::new()
    }

    pub fn builtins(&self) -> &BuiltinTable {
        &self.builtins
    }

    /// Runs `program`'s entry function to completion on a freshly created
    /// `Process`, invoking the configured panic handler (if any) on an
    /// unrecovered panic before returning it to the caller.
    pub fn run(&self, program: &Program) -> Result<(), Panic> {
        let config = ProcessConfig {
            initial_vstack_elements: self.options.initial_vstack_size_in_elements,
            max_vstack_elements: self.options.max_vstack_size_in_elements,
            initial_cstack_bytes: self.options.initial_cstack_size_in_bytes,
            max_cstack_bytes: self.options.max_cstack_size_in_bytes,
            step_limit: self.options.step_limit,
        };
        let mut process = match self.options.make_allocator() {
            Some(allocator) => Process::with_allocator(program.module(), program.entry(), config, allocator),
            None => Process::new(program.module(), program.entry(), config),
        };
        process.set_writer(Box::new(StdoutWriter));
        process.set_reader(Box::new(StdinReader));
        if let Some(user_data) = self.options.user_data.clone() {
            process.set_user_data(Box::new(user_data));
        }
        process.fiber_resume(process.root_fiber(), 0, false).expect("a fresh process's root fiber is always ready");

        let result = run(&mut process, &self.builtins);
        if let Err(panic) = &result {
            if let Some(handler) = self.options.panic_handler {
                handler(panic);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauf_image::ModuleBuilder;
    use lauf_types::Signature;
    use pretty_assertions::assert_eq;

    #[test]
    fn running_a_trivial_program_through_the_facade_succeeds() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("entry", Signature::new(0, 0));
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let program = Program::new(module, "entry").unwrap();

        let vm = Vm::new(VmOptions::default());
        vm.run(&program).unwrap();
    }

    #[test]
    fn user_data_configured_on_the_vm_reaches_the_process() {
        use std::any::Any;
        use std::sync::Arc;

        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("entry", Signature::new(0, 0));
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let program = Program::new(module, "entry").unwrap();

        let data: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let options = Vm::builder().user_data(data).build();
        assert!(options.user_data.is_some());
        let vm = Vm::new(options);
        vm.run(&program).unwrap();
    }

    #[test]
    fn an_unrecovered_panic_reaches_the_caller_and_the_handler() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("boom", Signature::new(0, 0));
        f.panic().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();
        let program = Program::new(module, "boom").unwrap();

        use std::sync::atomic::{AtomicBool, Ordering};
        static HANDLER_RAN: AtomicBool = AtomicBool::new(false);
        fn handler(_panic: &Panic) {
            HANDLER_RAN.store(true, Ordering::SeqCst);
        }

        let options = Vm::builder().panic_handler(handler).build();
        let vm = Vm::new(options);
        let err = vm.run(&program).unwrap_err();
        assert_eq!(err.message, "explicit panic instruction");
        assert!(HANDLER_RAN.load(Ordering::SeqCst));
    }
}
