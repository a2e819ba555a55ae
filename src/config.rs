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

//! CLI flags, parsed once in `main` and threaded through construction
//! explicitly rather than as package-level globals.

use std::path::PathBuf;

use clap::Parser;

/// Directory under which sealed per-verifier key pairs are stored.
pub const DEFAULT_KEY_DIR: &str = "/etc/ultrablue/";

/// Minimum and maximum accepted BLE MTU; values outside this range are
/// clamped to 20 by the framing codec.
pub const MTU_MIN: u16 = 20;
pub const MTU_MAX: u16 = 500;

#[derive(Parser, Debug, Clone)]
#[command(name = "ultrablue", about = "TPM 2.0 remote-attestation BLE server")]
pub struct Config {
    /// Enroll a new verifier instead of running a plain attestation.
    #[arg(long, default_value_t = false)]
    pub enroll: bool,

    /// Verbosity: 0 = errors only, 1 = info, 2 = debug, 3 = trace.
    #[arg(long, default_value_t = 1)]
    pub loglevel: u8,

    /// BLE MTU in bytes. Clamped to [20, 500] by the framing codec.
    #[arg(long, default_value_t = 500)]
    pub mtu: u16,

    /// Extend PCR 9 with the response secret on a successful attestation.
    #[arg(long, default_value_t = false)]
    pub pcr_extend: bool,

    /// Seal/unseal the pairing key behind a TPM PIN policy.
    #[arg(long, default_value_t = false)]
    pub with_pin: bool,

    /// Directory holding sealed per-verifier key pairs.
    #[arg(long, default_value = DEFAULT_KEY_DIR)]
    pub key_dir: PathBuf,
}

impl Config {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.loglevel {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
