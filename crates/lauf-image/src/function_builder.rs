// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Emits one function's instruction stream while tracking its net
//! value-stack effect with a `StackChecker`, turning any violation of
//! these verification rules into a `VerifyError` that names the offending
//! instruction.

use lauf_types::{Instruction, Opcode, Signature};

use crate::debug_location::DebugLocation;
use crate::function::Function;
use crate::stack_checker::StackChecker;
use crate::verify_error::{VerifyError, VerifyErrorKind};

const MAX_PAYLOAD_U24: u32 = (1 << 24) - 1;
const MAX_PAYLOAD_I24: i32 = (1 << 23) - 1;
const MIN_PAYLOAD_I24: i32 = -(1 << 23);

pub struct FunctionBuilder {
    name: String,
    signature: Signature,
    max_vstack_size: Option<u16>,
    local_stack_size: u32,
    instructions: Vec<Instruction>,
    debug_locations: Vec<(u32, DebugLocation)>,
    checker: StackChecker,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
            max_vstack_size: None,
            local_stack_size: 0,
            instructions: Vec::new(),
            debug_locations: Vec::new(),
            checker: StackChecker::new(),
        }
    }

    pub fn set_local_stack_size(&mut self, size: u32) {
        self.local_stack_size = size;
    }

    /// Declares the function's `max_vstack_size` explicitly. If never
    /// called, `finish` uses the checker's tracked peak.
    pub fn set_max_vstack_size(&mut self, size: u16) {
        self.max_vstack_size = Some(size);
    }

    pub fn set_debug_location(&mut self, location: DebugLocation) {
        let idx = self.instructions.len() as u32;
        if self.debug_locations.last().map(|(_, l)| *l) != Some(location) {
            self.debug_locations.push((idx, location));
        }
    }

    pub fn current_instruction_index(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn err(&self, instruction_index: u32, kind: VerifyErrorKind) -> VerifyError {
        VerifyError {
            function_name: self.name.clone(),
            instruction_index,
            kind,
        }
    }

    fn emit(&mut self, instruction: Instruction) -> u32 {
        let idx = self.instructions.len() as u32;
        self.instructions.push(instruction);
        idx
    }

    fn track_push(&mut self, n: u16) -> Result<(), VerifyErrorKind> {
        if self.checker.push(n) {
            Ok(())
        } else {
            Err(VerifyErrorKind::StackDepthOverflow)
        }
    }

    fn track_pop(&mut self, n: u16) -> Result<(), VerifyErrorKind> {
        if self.checker.pop(n) {
            Ok(())
        } else {
            Err(VerifyErrorKind::StackUnderflow)
        }
    }

    fn unsigned_payload(n: u32, what: &'static str) -> Result<u32, VerifyErrorKind> {
        if n > MAX_PAYLOAD_U24 {
            Err(VerifyErrorKind::OutOfRange { what })
        } else {
            Ok(n)
        }
    }

    fn signed_payload(n: i32, what: &'static str) -> Result<u32, VerifyErrorKind> {
        if !(MIN_PAYLOAD_I24..=MAX_PAYLOAD_I24).contains(&n) {
            return Err(VerifyErrorKind::OutOfRange { what });
        }
        Ok((n as u32) & MAX_PAYLOAD_U24)
    }

    pub fn nop(&mut self) -> Result<u32, VerifyError> {
        Ok(self.emit(Instruction::new(Opcode::nop, 0)))
    }

    pub fn return_(&mut self) -> Result<u32, VerifyError> {
        let expected = self.signature.output_count as u16;
        if self.checker.current() != expected {
            let idx = self.current_instruction_index();
            return Err(self.err(
                idx,
                VerifyErrorKind::SignatureMismatch {
                    declared_outputs: self.signature.output_count,
                    actual: self.checker.current(),
                },
            ));
        }
        Ok(self.emit(Instruction::new(Opcode::return_, 0)))
    }

    pub fn jump(&mut self, offset: i32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        let payload = Self::signed_payload(offset, "jump offset").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::jump, payload)))
    }

    pub fn jump_if(&mut self, offset: i32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_pop(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::signed_payload(offset, "jump_if offset").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::jump_if, payload)))
    }

    pub fn call(&mut self, function_index: u32, input_count: u8, output_count: u8) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_pop(input_count as u16).map_err(|k| self.err(idx, k))?;
        self.track_push(output_count as u16).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(function_index, "function index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::call, payload)))
    }

    pub fn call_indirect(&mut self, input_count: u8, output_count: u8) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        // the function address itself is popped, then its declared arity.
        self.track_pop(1).map_err(|k| self.err(idx, k))?;
        self.track_pop(input_count as u16).map_err(|k| self.err(idx, k))?;
        self.track_push(output_count as u16).map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::call_indirect, 0)))
    }

    pub fn call_builtin(&mut self, builtin_index: u32, input_count: u8, output_count: u8) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_pop(input_count as u16).map_err(|k| self.err(idx, k))?;
        self.track_push(output_count as u16).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(builtin_index, "builtin index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::call_builtin, payload)))
    }

    pub fn panic(&mut self) -> Result<u32, VerifyError> {
        Ok(self.emit(Instruction::new(Opcode::panic, 0)))
    }

    pub fn push_literal(&mut self, literal_index: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(literal_index, "literal index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::push_literal, payload)))
    }

    pub fn push_zero(&mut self) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::push_zero, 0)))
    }

    pub fn push_small_zext(&mut self, value: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(value, "push_small_zext immediate").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::push_small_zext, payload)))
    }

    /// `value` is the magnitude to negate; encodes `-value` as a 24-bit
    /// two's complement payload.
    pub fn push_small_neg(&mut self, value: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::signed_payload(-(value as i32), "push_small_neg immediate")
            .map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::push_small_neg, payload)))
    }

    pub fn pop(&mut self, n: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_pop(n as u16).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(n, "pop count").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::pop, payload)))
    }

    pub fn pop_one(&mut self) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_pop(1).map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::pop_one, 0)))
    }

    pub fn pick(&mut self, n: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        // `pick` duplicates the nth value: it reads below the current top
        // without consuming, then pushes one more.
        if (n as u16) >= self.checker.current() {
            return Err(self.err(idx, VerifyErrorKind::StackUnderflow));
        }
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(n, "pick index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::pick, payload)))
    }

    pub fn roll(&mut self, n: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        if (n as u16) >= self.checker.current() {
            return Err(self.err(idx, VerifyErrorKind::StackUnderflow));
        }
        let payload = Self::unsigned_payload(n, "roll index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::roll, payload)))
    }

    pub fn local_addr(&mut self, local_index: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(local_index, "local index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::local_addr, payload)))
    }

    pub fn argument(&mut self, n: u32) -> Result<u32, VerifyError> {
        let idx = self.current_instruction_index();
        self.track_push(1).map_err(|k| self.err(idx, k))?;
        let payload = Self::unsigned_payload(n, "argument index").map_err(|k| self.err(idx, k))?;
        Ok(self.emit(Instruction::new(Opcode::argument, payload)))
    }

    /// Runs the final checks: jump targets land inside the
    /// function, the tracked peak does not exceed a declared
    /// `max_vstack_size`, and the function ends with a balanced stack.
    pub fn finish(self) -> Result<Function, VerifyError> {
        let instruction_count = self.instructions.len() as i64;
        for (idx, instruction) in self.instructions.iter().enumerate() {
            let opcode = instruction.opcode();
            if matches!(opcode, Some(Opcode::jump) | Some(Opcode::jump_if)) {
                let target = idx as i64 + 1 + instruction.payload_i24() as i64;
                if target < 0 || target >= instruction_count {
                    return Err(self.err(idx as u32, VerifyErrorKind::OutOfRange { what: "jump target" }));
                }
            }
        }

        let declared_max = self.max_vstack_size.unwrap_or(self.checker.max());
        if self.checker.max() > declared_max {
            return Err(self.err(
                instruction_count as u32,
                VerifyErrorKind::MaxStackSizeExceeded {
                    declared: declared_max,
                    actual: self.checker.max(),
                },
            ));
        }

        Ok(Function::new(
            self.name,
            self.signature,
            declared_max,
            self.local_stack_size,
            self.instructions,
            self.debug_locations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn balanced_function_verifies() {
        let mut b = FunctionBuilder::new("id", Signature::new(1, 1));
        b.argument(0).unwrap();
        b.return_().unwrap();
        let f = b.finish().unwrap();
        assert_eq!(f.signature, Signature::new(1, 1));
        assert_eq!(f.max_vstack_size, 1);
    }

    #[test]
    fn return_with_wrong_depth_is_rejected() {
        let mut b = FunctionBuilder::new("bad", Signature::new(0, 1));
        let err = b.return_().unwrap_err();
        assert_eq!(err.function_name, "bad");
        assert!(matches!(err.kind, VerifyErrorKind::SignatureMismatch { .. }));
    }

    #[test]
    fn pop_past_empty_stack_is_rejected() {
        let mut b = FunctionBuilder::new("bad", Signature::new(0, 0));
        let err = b.pop_one().unwrap_err();
        assert_eq!(err.kind, VerifyErrorKind::StackUnderflow);
    }

    #[test]
    fn jump_target_outside_the_function_is_rejected() {
        let mut b = FunctionBuilder::new("bad", Signature::new(0, 0));
        b.jump(100).unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err.kind, VerifyErrorKind::OutOfRange { what: "jump target" }));
    }

    #[test]
    fn declared_max_vstack_size_lower_than_peak_is_rejected() {
        let mut b = FunctionBuilder::new("bad", Signature::new(0, 2));
        b.set_max_vstack_size(1);
        b.push_zero().unwrap();
        b.push_zero().unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err.kind, VerifyErrorKind::MaxStackSizeExceeded { .. }));
    }
}
