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

//! Library crate backing the `ultrablue` binary: the BLE transport, TPM
//! adapter, key store, session, and protocol driver. Split out from
//! `main.rs` so integration tests can drive the protocol driver over an
//! in-memory pipe and a fake TPM directly.

pub mod ble;
pub mod config;
pub mod error;
pub mod keystore;
pub mod protocol;
pub mod qr;
pub mod session;
pub mod tpm;
