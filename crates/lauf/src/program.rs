// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! A `Program`: a finished `Module` paired with the entry function a `Vm`
//! should start at. Resolving the entry by name here, once, means `Vm::run`
//! never has to guess a `FunctionAddress`'s declared arity.

use lauf_image::Module;
use lauf_types::FunctionAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownEntryFunction;

impl std::fmt::Display for UnknownEntryFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry function not found in module")
    }
}

impl std::error::Error for UnknownEntryFunction {}

pub struct Program {
    module: Module,
    entry: FunctionAddress,
}

impl Program {
    pub fn new(module: Module, entry_function_name: &str) -> Result<Self, UnknownEntryFunction> {
        let index = module.function_index_by_name(entry_function_name).ok_or(UnknownEntryFunction)?;
        let signature = module.function(index).expect("index came from this module").signature;
        let entry = FunctionAddress {
            index,
            input_count: signature.input_count,
            output_count: signature.output_count,
        };
        Ok(Self { module, entry })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn entry(&self) -> FunctionAddress {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauf_image::ModuleBuilder;
    use lauf_types::Signature;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolves_the_named_entry_functions_signature() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.start_function("main", Signature::new(1, 1));
        f.argument(0).unwrap();
        f.return_().unwrap();
        builder.finish_function(f).unwrap();
        let module = builder.finish().unwrap();

        let program = Program::new(module, "main").unwrap();
        assert_eq!(program.entry().input_count, 1);
        assert_eq!(program.entry().output_count, 1);
    }

    #[test]
    fn an_unknown_entry_name_is_reported() {
        let builder = ModuleBuilder::new("m");
        let module = builder.finish().unwrap();
        assert_eq!(Program::new(module, "missing").unwrap_err(), UnknownEntryFunction);
    }
}
