// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection operation FSM: Idle / Read / Write.
//!
//! `Result`-returning methods plus a `debug_assert`-guarded invariant check:
//! a violation here is a programming bug, not a runtime condition a caller
//! can recover from.

use crate::error::FsmError;

/// The kind of operation a connection is currently performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Idle,
    Read,
    Write,
}

/// Per-connection byte-level state machine.
///
/// Invariants: in `Idle`, `buffer` is empty and both counters are unset
/// (`None`); in `Read`, `expected_len` is `Some` and `offset` is `None`; in
/// `Write`, `offset` is `Some` and `expected_len` is `None`.
#[derive(Debug)]
pub struct ConnectionState {
    operation: Operation,
    buffer: Vec<u8>,
    offset: Option<usize>,
    expected_len: Option<i64>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            operation: Operation::Idle,
            buffer: Vec::new(),
            offset: None,
            expected_len: None,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    pub fn offset_mut(&mut self) -> &mut usize {
        self.offset.get_or_insert(0)
    }

    pub fn expected_len_mut(&mut self) -> &mut i64 {
        self.expected_len.get_or_insert(0)
    }

    fn check_invariants(&self) {
        let valid = match self.operation {
            Operation::Idle => self.buffer.is_empty() && self.offset.is_none() && self.expected_len.is_none(),
            Operation::Read => self.expected_len.is_some() && self.offset.is_none(),
            Operation::Write => self.offset.is_some() && self.expected_len.is_none(),
        };
        if !valid {
            panic!(
                "invalid connection state: operation={:?} buf_len={} offset={:?} expected_len={:?}",
                self.operation,
                self.buffer.len(),
                self.offset,
                self.expected_len
            );
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.operation {
            Operation::Read => Some(self.buffer.len() as i64) == self.expected_len,
            Operation::Write => Some(self.buffer.len()) == self.offset,
            Operation::Idle => false,
        }
    }

    /// Transitions from `Idle` into `Read` or `Write`, initializing the
    /// corresponding counter. Fails if an operation is already in progress,
    /// or if `kind` is `Idle`.
    pub fn start(&mut self, kind: Operation) -> Result<(), FsmError> {
        self.check_invariants();
        if kind == Operation::Idle {
            return Err(FsmError::InvalidOperation);
        }
        if self.operation != Operation::Idle {
            return Err(FsmError::OperationInProgress);
        }
        self.operation = kind;
        match kind {
            Operation::Read => self.expected_len = Some(0),
            Operation::Write => self.offset = Some(0),
            Operation::Idle => unreachable!(),
        }
        self.check_invariants();
        Ok(())
    }

    /// Transitions back to `Idle`, provided `is_complete()` holds. Resets
    /// the buffer and counters on success.
    pub fn end(&mut self) -> Result<(), FsmError> {
        self.check_invariants();
        if self.operation == Operation::Idle {
            return Err(FsmError::Incomplete);
        }
        if !self.is_complete() {
            return Err(FsmError::Incomplete);
        }
        self.buffer.clear();
        self.offset = None;
        self.expected_len = None;
        self.operation = Operation::Idle;
        self.check_invariants();
        Ok(())
    }
}
