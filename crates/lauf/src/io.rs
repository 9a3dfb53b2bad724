// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! Real stdout/stdin-backed `Writer`/`Reader` implementations, replacing
//! `lauf_process`'s `NullWriter`/`NullReader` for a VM actually meant to
//! run programs rather than exercise the engine in isolation.

use std::io::{Read, Write};

use lauf_process::{Reader, Writer};

pub struct StdoutWriter;

impl Writer for StdoutWriter {
    fn write(&mut self, bytes: &[u8]) {
        let _ = std::io::stdout().write_all(bytes);
    }
}

pub struct StdinReader;

impl Reader for StdinReader {
    fn read(&mut self, max_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max_len];
        match std::io::stdin().read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(_) => Vec::new(),
        }
    }
}
