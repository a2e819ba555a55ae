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

//! Enrollment QR code: prints the pairing payload to stdout as an ASCII-art
//! QR code so the verifier app can scan it instead of requiring manual entry.

use qrcode::render::unicode;
use qrcode::QrCode;

use crate::error::{Result, UltrablueError};

/// Prints an ASCII-art QR code encoding `{"addr":"<mac>","key":"<hex>"}` to
/// stdout, where `mac` is colon-separated and `key` is lowercase hex.
pub fn print_enrollment_qr(mac: &str, key: &[u8]) -> Result<()> {
    let payload = format!(
        r#"{{"addr":"{}","key":"{}"}}"#,
        mac,
        hex::encode(key)
    );

    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| UltrablueError::KeyStore(format!("rendering enrollment QR: {e}")))?;
    let image = code
        .render::<unicode::Dense1x2>()
        .quiet_zone(true)
        .build();

    println!("Scan this code with the Ultrablue app to enroll:\n");
    println!("{image}");
    Ok(())
}
