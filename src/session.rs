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

//! CBOR message transport over the BLE pipe, with an optional AEAD layer
//! switched on mid-session once a pairing key has been established.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ble::pipe::DriverEnd;
use crate::error::{Result, UltrablueError};
use crate::tpm::TpmAdapter;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// A single client connection's message channel: CBOR framing over the
/// rendezvous pipe, with AES-256-GCM switched on after pairing.
///
/// Holds its TPM handle as an `Arc` rather than a borrow so a `Session` can
/// be moved wholesale into the `tokio::spawn`ed protocol driver task.
pub struct Session {
    pipe: DriverEnd,
    tpm: Arc<dyn TpmAdapter>,
    cipher: Option<Aes256Gcm>,
}

impl Session {
    pub fn new(pipe: DriverEnd, tpm: Arc<dyn TpmAdapter>) -> Self {
        Self {
            pipe,
            tpm,
            cipher: None,
        }
    }

    /// Switches on AEAD for every subsequent `send`/`recv`. Fails if
    /// encryption is already active: a session establishes its pairing key
    /// exactly once.
    pub fn start_encryption(&mut self, key: &[u8]) -> Result<()> {
        if self.cipher.is_some() {
            return Err(UltrablueError::Aead("encryption already started".into()));
        }
        if key.len() != KEY_LEN {
            return Err(UltrablueError::Aead(format!(
                "expected a {KEY_LEN}-byte key, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Closes the underlying pipe, the canonical fatal-error signal (§7):
    /// used by the protocol driver's own logic errors (auth failure,
    /// credential-activation failure) that aren't surfaced through
    /// `send`/`recv` themselves.
    pub fn close(&mut self) {
        self.pipe.close();
    }

    /// CBOR-encodes `value`, encrypts it if encryption is active, and sends
    /// it across the pipe. Blocks until the characteristic layer
    /// acknowledges full delivery. Closes the pipe itself on an encoding or
    /// AEAD-seal failure, so the characteristic side unwinds on its next
    /// interaction rather than lingering on a session the driver has
    /// abandoned.
    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut plain = Vec::new();
        if let Err(e) = ciborium::into_writer(value, &mut plain) {
            self.pipe.close();
            return Err(UltrablueError::Codec(e.to_string()));
        }

        let payload = match &self.cipher {
            Some(cipher) => match self.seal(cipher, &plain) {
                Ok(sealed) => sealed,
                Err(e) => {
                    self.pipe.close();
                    return Err(e);
                }
            },
            None => plain,
        };

        self.pipe
            .send(payload)
            .await
            .ok_or(UltrablueError::TransportClosed)
    }

    /// Waits for a full message, decrypts it if encryption is active, and
    /// CBOR-decodes it as `T`. Closes the pipe itself on an AEAD-open or
    /// decode failure, matching `send`'s discipline.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self
            .pipe
            .recv()
            .await
            .ok_or(UltrablueError::TransportClosed)?;

        let plain = match &self.cipher {
            Some(cipher) => match self.open(cipher, &payload) {
                Ok(plain) => plain,
                Err(e) => {
                    self.pipe.close();
                    return Err(e);
                }
            },
            None => payload,
        };

        ciborium::from_reader(plain.as_slice()).map_err(|e| {
            self.pipe.close();
            UltrablueError::Codec(e.to_string())
        })
    }

    fn seal(&self, cipher: &Aes256Gcm, plain: &[u8]) -> Result<Vec<u8>> {
        let iv = self
            .tpm
            .get_random(NONCE_LEN)
            .map_err(|e| UltrablueError::Aead(e.to_string()))?;
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = cipher
            .encrypt(nonce, plain)
            .map_err(|e| UltrablueError::Aead(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, cipher: &Aes256Gcm, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            return Err(UltrablueError::Aead("payload shorter than IV".into()));
        }
        let (iv, ciphertext) = payload.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|e| UltrablueError::Aead(e.to_string()))
    }
}
