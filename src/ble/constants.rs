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

//! BLE service and characteristic UUIDs, and wire-level constants.

use uuid::Uuid;

/// Ultrablue GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xebee1789_50b3_4943_8396_16c0b7231cad);

/// The single characteristic exposed by the service. Readable (server
/// sends) and writable (server receives).
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xebee1790_50b3_4943_8396_16c0b7231cad);

/// Advertised local name.
pub const ADVERTISED_NAME: &str = "Ultrablue server";

/// PCR index extended with the response secret when `--pcr-extend` is set.
pub const PCR_EXTEND_INDEX: u32 = 9;

/// Length, in bytes, of the little-endian message-length prefix carried by
/// the first fragment of a message.
pub const LENGTH_PREFIX_SIZE: usize = 4;
