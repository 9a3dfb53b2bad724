// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The `Writer`/`Reader` collaborator interfaces: the only I/O seams
//! the engine exposes, used solely by `lauf-lib`'s debug and test
//! built-ins. The engine ships null implementations so a `Process` never
//! needs one wired up to do anything useful; the root `lauf` crate
//! supplies real stdout/stdin-backed ones.

pub trait Writer {
    fn write(&mut self, bytes: &[u8]);
}

pub trait Reader {
    fn read(&mut self, max_len: usize) -> Vec<u8>;
}

pub struct NullWriter;

impl Writer for NullWriter {
    fn write(&mut self, _bytes: &[u8]) {}
}

pub struct NullReader;

impl Reader for NullReader {
    fn read(&mut self, _max_len: usize) -> Vec<u8> {
        Vec::new()
    }
}
