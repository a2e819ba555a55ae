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

//! 4-byte length-prefixed chunking over an MTU-bounded byte pipe.
//!
//! This is the attester's framing layer: it knows nothing about encryption
//! or CBOR, only about splitting/reassembling byte strings across fragments
//! no larger than the negotiated MTU.

use crate::config::{MTU_MAX, MTU_MIN};
use crate::error::{Result, UltrablueError};

use super::constants::LENGTH_PREFIX_SIZE;

/// Destination for an outgoing fragment. `Vec<u8>` is the trivial sink used
/// by the GATT read handler, which just returns the packet bytes to BlueZ.
pub trait PacketSink {
    fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()>;
}

impl PacketSink for Vec<u8> {
    fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.clear();
        self.extend_from_slice(packet);
        Ok(())
    }
}

/// Clamps `mtu` to `[MTU_MIN, MTU_MAX]`, falling back to `MTU_MIN` when out
/// of range.
pub fn clamp_mtu(mtu: u16) -> u16 {
    if mtu < MTU_MIN || mtu > MTU_MAX {
        MTU_MIN
    } else {
        mtu
    }
}

/// Writes at most `mtu` bytes of `msg` (including the 4-byte length prefix
/// when `*offset == 0`) to `sink`, and advances `*offset`.
///
/// No-op if `*offset` already covers the whole message.
pub fn send_chunk<S: PacketSink>(
    offset: &mut usize,
    msg: &[u8],
    mtu: u16,
    sink: &mut S,
) -> Result<()> {
    if *offset >= msg.len() {
        return Ok(());
    }

    let mtu = clamp_mtu(mtu) as usize;
    let header_len = if *offset == 0 { LENGTH_PREFIX_SIZE } else { 0 };
    let capacity = mtu.saturating_sub(header_len);

    let remaining = msg.len() - *offset;
    let take = remaining.min(capacity);

    let mut packet = Vec::with_capacity(header_len + take);
    if *offset == 0 {
        packet.extend_from_slice(&(msg.len() as u32).to_le_bytes());
    }
    packet.extend_from_slice(&msg[*offset..*offset + take]);

    sink.write_packet(&packet)
        .map_err(|e| UltrablueError::Framing(e.to_string()))?;

    *offset += take;
    Ok(())
}

/// Appends the payload of `fragment` to `buffer`, initializing
/// `*expected_len` from the little-endian length prefix on the first
/// fragment of a message (i.e. when `*expected_len == 0`).
pub fn recv_chunk(buffer: &mut Vec<u8>, expected_len: &mut i64, fragment: &[u8]) -> Result<()> {
    let mut payload_offset = 0;

    if *expected_len == 0 && fragment.len() >= LENGTH_PREFIX_SIZE {
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&fragment[..LENGTH_PREFIX_SIZE]);
        *expected_len = u32::from_le_bytes(prefix) as i64;
        payload_offset = LENGTH_PREFIX_SIZE;
    }

    if *expected_len < 0 {
        return Err(UltrablueError::Framing(
            "invalid length prefix: negative".into(),
        ));
    }

    buffer.extend_from_slice(&fragment[payload_offset..]);

    if buffer.len() as i64 > *expected_len {
        return Err(UltrablueError::Framing(
            "fragment overshoots the declared message length".into(),
        ));
    }

    Ok(())
}
