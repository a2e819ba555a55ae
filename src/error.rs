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

//! Crate-wide error type covering transport closure, framing, codec, AEAD,
//! protocol, TPM, key store and FSM failures. `main` and the protocol
//! driver log a single line and unwind; they never need to match on
//! variants beyond `Protocol`'s sub-kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UltrablueError {
    #[error("transport closed")]
    TransportClosed,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("CBOR codec error: {0}")]
    Codec(String),

    #[error("AEAD error: {0}")]
    Aead(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("TPM error: {0}")]
    Tpm(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("FSM error: {0}")]
    Fsm(#[from] FsmError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("authentication failure")]
    AuthFailure,
    #[error("attestation failure")]
    AttestationFailure,
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("an operation is already in progress")]
    OperationInProgress,
    #[error("cannot start an Idle operation")]
    InvalidOperation,
    #[error("the operation hasn't been completed")]
    Incomplete,
}

pub type Result<T> = std::result::Result<T, UltrablueError>;
