// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `lauf.debug`: printing and breakpoint built-ins, grounded on
//! `lib/debug.h`. Output goes through `Process::writer_mut`, never
//! directly to stdout, so tests (and embedders that want to capture it)
//! can swap in their own `Writer`.

use lauf_process::{BuiltinContext, BuiltinLibrary, Panic};
use lauf_types::Value;

fn print(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let value = ctx.pop()?;
    let line = format!("{}\n", value.as_sint());
    ctx.process.writer_mut().write(line.as_bytes());
    ctx.push(value)
}

fn print_vstack(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let fiber = ctx.process.current_fiber().expect("a fiber must be running to call a builtin");
    let depth = fiber.value_stack.depth();
    let mut line = format!("vstack ({} values):\n", depth);
    for i in 0..depth {
        if let Ok(v) = fiber.value_stack.peek(i) {
            line.push_str(&format!("  [{}] {}\n", i, v.as_sint()));
        }
    }
    ctx.process.writer_mut().write(line.as_bytes());
    Ok(())
}

fn print_cstack(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let fiber = ctx.process.current_fiber().expect("a fiber must be running to call a builtin");
    let mut line = format!("cstack ({} frames):\n", fiber.call_stack.depth());
    for frame in fiber.call_stack.frames() {
        line.push_str(&format!("  function #{}\n", frame.function.index));
    }
    ctx.process.writer_mut().write(line.as_bytes());
    Ok(())
}

fn print_all_cstacks(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let mut out = String::new();
    for index in 0..ctx.process.fiber_slot_count() as u32 {
        if let Some(fiber) = ctx.process.fiber_at(index) {
            out.push_str(&format!("fiber #{} ({} frames):\n", index, fiber.call_stack.depth()));
            for frame in fiber.call_stack.frames() {
                out.push_str(&format!("  function #{}\n", frame.function.index));
            }
        }
    }
    ctx.process.writer_mut().write(out.as_bytes());
    Ok(())
}

/// A no-op hook for an attached debugger to break on; nothing to do
/// without one.
fn break_(_ctx: &mut BuiltinContext) -> Result<(), Panic> {
    Ok(())
}

fn read(ctx: &mut BuiltinContext) -> Result<(), Panic> {
    let bytes = ctx.process.reader_mut().read(16);
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    ctx.push(Value::from_uint(u64::from_le_bytes(buf)))
}

pub fn library() -> BuiltinLibrary {
    let mut lib = BuiltinLibrary::new("lauf.debug");
    lib.register("print", 1, 1, print);
    lib.register("print_vstack", 0, 0, print_vstack);
    lib.register("print_cstack", 0, 0, print_cstack);
    lib.register("print_all_cstacks", 0, 0, print_all_cstacks);
    lib.register("break", 0, 0, break_);
    lib.register("read", 0, 1, read);
    lib
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{trivial_module, TRIVIAL_ENTRY};
    use lauf_process::{BuiltinContext, BuiltinTable, Process, ProcessConfig, Reader, Writer};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct CapturingWriter {
        captured: Vec<u8>,
    }

    impl Writer for CapturingWriter {
        fn write(&mut self, bytes: &[u8]) {
            self.captured.extend_from_slice(bytes);
        }
    }

    struct FixedReader(Vec<u8>);

    impl Reader for FixedReader {
        fn read(&mut self, max_len: usize) -> Vec<u8> {
            let n = self.0.len().min(max_len);
            self.0.drain(..n).collect()
        }
    }

    #[test]
    fn print_forwards_the_value_unchanged() {
        let module = trivial_module();
        let mut process = Process::new(&module, TRIVIAL_ENTRY, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        process.set_writer(Box::new(CapturingWriter::default()));
        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);
        ctx.push(Value::from_sint(-7)).unwrap();
        print(&mut ctx).unwrap();
        assert_eq!(ctx.pop().unwrap().as_sint(), -7);
    }

    #[test]
    fn read_zero_extends_fewer_than_eight_bytes() {
        let module = trivial_module();
        let mut process = Process::new(&module, TRIVIAL_ENTRY, ProcessConfig::default());
        process.fiber_resume(process.root_fiber(), 0, false).unwrap();
        process.set_reader(Box::new(FixedReader(vec![0x2a])));
        let builtins = BuiltinTable::new();
        let mut ctx = BuiltinContext::new(&mut process, &builtins);
        read(&mut ctx).unwrap();
        assert_eq!(ctx.pop().unwrap().as_uint(), 0x2a);
    }
}
