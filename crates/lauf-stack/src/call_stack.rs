// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! The per-fiber call stack: a linear array of `Frame`s with its own
//! byte-denominated growth bound (`vm.max_cstack_size`), separate from the
//! value stack's element-denominated one.

use crate::{frame::Frame, StackError};

pub struct CallStack {
    frames: Vec<Frame>,
    max_frames: usize,
}

impl CallStack {
    pub fn new(initial_bytes: usize, max_bytes: usize) -> Self {
        let frame_size = std::mem::size_of::<Frame>().max(1);
        let initial_frames = (initial_bytes / frame_size).max(1);
        let max_frames = (max_bytes / frame_size).max(initial_frames);
        Self {
            frames: Vec::with_capacity(initial_frames),
            max_frames,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), StackError> {
        if self.frames.len() >= self.max_frames {
            return Err(StackError::Overflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Frame, StackError> {
        self.frames.pop().ok_or(StackError::Underflow)
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// All active frames, outermost first — used by the debug library's
    /// stacktrace-printing built-ins.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}
