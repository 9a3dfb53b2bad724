// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Component C: immutable module/function layout, plus the in-crate
//! `ModuleBuilder`/`FunctionBuilder` that assemble and verify one.

pub mod debug_location;
pub mod function;
pub mod function_builder;
pub mod literal_pool;
pub mod module;
pub mod module_builder;
pub mod stack_checker;
pub mod static_data;
pub mod verify_error;

pub use debug_location::DebugLocation;
pub use function::Function;
pub use function_builder::FunctionBuilder;
pub use literal_pool::LiteralPool;
pub use module::Module;
pub use module_builder::ModuleBuilder;
pub use stack_checker::StackChecker;
pub use static_data::{GlobalKind, GlobalSlot, StaticDataBuilder, StaticDataSegment};
pub use verify_error::{VerifyError, VerifyErrorKind};
