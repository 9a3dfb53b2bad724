// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The module builder, an in-crate stand-in for an external assembler:
//! one method per opcode family plus
//! `finish`/`finish_function`, which run the verification rules the engine
//! enforces before it will execute a module.

use lauf_arena::{Arena, PageAllocator};
use lauf_types::{Opcode, Signature, Value};

use crate::function::Function;
use crate::function_builder::FunctionBuilder;
use crate::literal_pool::LiteralPool;
use crate::module::Module;
use crate::static_data::StaticDataBuilder;
use crate::verify_error::{VerifyError, VerifyErrorKind};

pub struct ModuleBuilder {
    name: String,
    path: Option<String>,
    literal_pool: LiteralPool,
    functions: Vec<Function>,
    static_data: StaticDataBuilder,
    arena: Arena,
    pages: PageAllocator,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            literal_pool: LiteralPool::new(),
            functions: Vec::new(),
            static_data: StaticDataBuilder::new(),
            arena: Arena::new(),
            pages: PageAllocator::new(),
        }
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn static_data_mut(&mut self) -> &mut StaticDataBuilder {
        &mut self.static_data
    }

    pub fn insert_literal(&mut self, value: Value) -> u32 {
        self.literal_pool.insert(value)
    }

    pub fn start_function(&self, name: impl Into<String>, signature: Signature) -> FunctionBuilder {
        FunctionBuilder::new(name, signature)
    }

    /// Finishes a function, assigning it the next function index.
    pub fn finish_function(&mut self, builder: FunctionBuilder) -> Result<u16, VerifyError> {
        let function = builder.finish()?;
        let idx = self.functions.len() as u16;
        self.functions.push(function);
        Ok(idx)
    }

    /// Checks every `call`'s target index against the function table (the
    /// one check that needs the whole module, not just one function),
    /// then hands back an immutable `Module`.
    pub fn finish(self) -> Result<Module, VerifyError> {
        let function_count = self.functions.len() as u32;
        for function in &self.functions {
            for (idx, instruction) in function.instructions.iter().enumerate() {
                if instruction.opcode() == Some(Opcode::call)
                    && instruction.payload_u24() >= function_count
                {
                    return Err(VerifyError {
                        function_name: function.name.clone(),
                        instruction_index: idx as u32,
                        kind: VerifyErrorKind::OutOfRange {
                            what: "function index",
                        },
                    });
                }
                if instruction.opcode() == Some(Opcode::push_literal)
                    && instruction.payload_u24() as usize >= self.literal_pool.len()
                {
                    return Err(VerifyError {
                        function_name: function.name.clone(),
                        instruction_index: idx as u32,
                        kind: VerifyErrorKind::OutOfRange {
                            what: "literal index",
                        },
                    });
                }
            }
        }

        let Self {
            name,
            path,
            literal_pool,
            functions,
            static_data,
            mut arena,
            mut pages,
        } = self;
        let static_data = {
            let bytes = static_data.template_bytes_for_finish();
            let ptr = arena.allocate(&mut pages, bytes.len().max(1), 1);
            if !bytes.is_empty() {
                // SAFETY: `ptr` is freshly allocated with at least
                // `bytes.len()` bytes by the `allocate` call above.
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
            }
            static_data.into_segment(ptr, bytes.len())
        };

        Ok(Module::new(
            name,
            path,
            literal_pool,
            functions,
            static_data,
            arena,
            pages,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn call_to_an_unknown_function_is_rejected() {
        let mut module = ModuleBuilder::new("m");
        let mut f = module.start_function("f", Signature::new(0, 0));
        f.call(5, 0, 0).unwrap();
        f.return_().unwrap();
        let idx = module.finish_function(f).unwrap();
        assert_eq!(idx, 0);
        let err = module.finish().unwrap_err();
        assert!(matches!(
            err.kind,
            VerifyErrorKind::OutOfRange { what: "function index" }
        ));
    }

    #[test]
    fn a_well_formed_module_finishes() {
        let mut module = ModuleBuilder::new("m");
        let mut f = module.start_function("id", Signature::new(1, 1));
        f.argument(0).unwrap();
        f.return_().unwrap();
        module.finish_function(f).unwrap();
        let finished = module.finish().unwrap();
        assert_eq!(finished.functions().len(), 1);
        assert_eq!(finished.function(0).unwrap().name, "id");
    }
}
