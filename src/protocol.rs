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

//! The attestation script: the only place in the crate that knows the
//! *order* messages are exchanged in.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::constants::PCR_EXTEND_INDEX;
use crate::config::Config;
use crate::error::{ProtocolError, Result, UltrablueError};
use crate::keystore::KeyStore;
use crate::session::Session;
use crate::tpm::TpmAdapter;

const NONCE_LEN: usize = 16;
pub(crate) const SESSION_KEY_LEN: usize = 32;

/// Sent during enrollment: the host's endorsement key material, plus
/// whether this host will extend a PCR on a successful response.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollData {
    pub ek_cert: Vec<u8>,
    pub ek_n: Vec<u8>,
    pub ek_e: u32,
    pub pcr_extend: bool,
}

/// Wraps a raw byte string. CBOR byte arrays decode unreliably in a few
/// client libraries when sent bare, so every raw-bytes message on the wire
/// uses this wrapper instead.
#[derive(Debug, Serialize, Deserialize)]
pub struct Bytestring {
    pub bytes: Vec<u8>,
}

impl Bytestring {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// The AK's public area plus the TPM's proof that it was created under this
/// TPM's hierarchy, as required for credential activation.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttestationParameters {
    pub public: Vec<u8>,
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: Vec<u8>,
}

/// The verifier's credential-activation challenge.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptedCredential {
    pub credential: Vec<u8>,
    pub secret: Vec<u8>,
}

/// One PCR bank's worth of values, keyed by PCR index.
#[derive(Debug, Serialize, Deserialize)]
pub struct PcrBank {
    pub algorithm: String,
    pub pcrs: Vec<(u32, Vec<u8>)>,
}

/// A single signed quote: the attested structure, its signature, and the
/// PCR bank it covers.
#[derive(Debug, Serialize, Deserialize)]
pub struct Quote {
    pub quoted: Vec<u8>,
    pub signature: Vec<u8>,
    pub pcrs: PcrBank,
}

/// Everything the quote phase sends to the verifier.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlatformParameters {
    pub quotes: Vec<Quote>,
    pub event_log: Vec<u8>,
}

/// The verifier's final verdict.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub err: bool,
    pub secret: Vec<u8>,
}

/// Outcome of a full protocol run, used by `main` to choose an exit code.
/// Any connection-level failure before the Response phase is *not*
/// represented here: it unwinds the driver task without touching the
/// process exit code (§7 propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ResponseFailure,
}

/// Runs the full attestation script over `session`, sealing/loading the
/// pairing key against `tpm` and `keystore` as needed. A hard error at any
/// phase propagates to the caller, which treats it as a plain disconnect,
/// with the exception of the Response phase itself, whose outcome maps to
/// the process exit code.
///
/// `enroll_key` is the session key printed in the enrollment QR code; it
/// must already exist before this connection is accepted, since the
/// verifier needs it out of band to know what to encrypt with, so it is
/// generated once in `main` rather than here. Only read when `config.enroll`
/// is set.
pub async fn run(
    config: &Config,
    tpm: &dyn TpmAdapter,
    keystore: &KeyStore,
    enroll_key: Option<&[u8]>,
    mut session: Session,
) -> Result<Outcome> {
    let uuid = handshake(config, tpm, keystore, enroll_key, &mut session).await?;
    authenticate(tpm, &mut session).await?;

    if config.enroll {
        enroll(config, tpm, &mut session).await?;
    }

    let ak = tpm.new_ak().map_err(|e| UltrablueError::Tpm(e.to_string()))?;
    activate_credential(tpm, &ak, &mut session).await?;
    quote(tpm, &ak, &mut session).await?;

    let outcome = respond(config, tpm, &mut session).await?;

    tracing::info!(%uuid, ?outcome, "attestation run complete");
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(outcome)
}

async fn handshake(
    config: &Config,
    tpm: &dyn TpmAdapter,
    keystore: &KeyStore,
    enroll_key: Option<&[u8]>,
    session: &mut Session,
) -> Result<Uuid> {
    let id_msg: Bytestring = session.recv().await?;
    let uuid = Uuid::from_slice(&id_msg.bytes)
        .map_err(|e| UltrablueError::Protocol(ProtocolError::Unexpected(e.to_string())))?;

    let key = if config.enroll {
        let key = enroll_key
            .ok_or_else(|| UltrablueError::Tpm("no enrollment key generated".into()))?
            .to_vec();
        let pin = if config.with_pin {
            Some(read_pin()?)
        } else {
            None
        };
        let blob = tpm
            .seal(&key, pin.as_deref())
            .map_err(|e| UltrablueError::Tpm(e.to_string()))?;
        keystore.store(uuid, &blob)?;
        key
    } else {
        let pin = if config.with_pin {
            Some(read_pin()?)
        } else {
            None
        };
        let blob = keystore.load(uuid)?;
        tpm.unseal(&blob, pin.as_deref())
            .map_err(|e| UltrablueError::Tpm(e.to_string()))?
    };

    session.start_encryption(&key)?;
    Ok(uuid)
}

async fn authenticate(tpm: &dyn TpmAdapter, session: &mut Session) -> Result<()> {
    let nonce = tpm
        .get_random(NONCE_LEN)
        .map_err(|e| UltrablueError::Tpm(e.to_string()))?;
    session.send(&Bytestring::new(nonce.clone())).await?;

    let reply: Bytestring = session.recv().await?;
    if !constant_time_eq(&nonce, &reply.bytes) {
        session.close();
        return Err(UltrablueError::Protocol(ProtocolError::AuthFailure));
    }
    Ok(())
}

async fn enroll(config: &Config, tpm: &dyn TpmAdapter, session: &mut Session) -> Result<()> {
    let eks = tpm
        .endorsement_keys()
        .map_err(|e| UltrablueError::Tpm(e.to_string()))?;
    let ek = eks
        .first()
        .ok_or_else(|| UltrablueError::Tpm("TPM reports no endorsement keys".into()))?;

    session
        .send(&EnrollData {
            ek_cert: ek.cert_der.clone(),
            ek_n: ek.n.clone(),
            ek_e: ek.e,
            pcr_extend: config.pcr_extend,
        })
        .await
}

async fn activate_credential(
    tpm: &dyn TpmAdapter,
    ak: &crate::tpm::AttestationKey,
    session: &mut Session,
) -> Result<()> {
    session
        .send(&AttestationParameters {
            public: ak.public.clone(),
            creation_data: ak.creation_data.clone(),
            creation_hash: ak.creation_hash.clone(),
            creation_ticket: ak.creation_ticket.clone(),
        })
        .await?;

    let challenge: EncryptedCredential = session.recv().await?;
    let secret = tpm
        .activate_credential(ak, &challenge.credential, &challenge.secret)
        .map_err(|_| {
            session.close();
            UltrablueError::Protocol(ProtocolError::AttestationFailure)
        })?;

    session.send(&Bytestring::new(secret)).await
}

async fn quote(
    tpm: &dyn TpmAdapter,
    ak: &crate::tpm::AttestationKey,
    session: &mut Session,
) -> Result<()> {
    let nonce: Bytestring = session.recv().await?;

    let attestation = tpm
        .quote(ak, &nonce.bytes)
        .map_err(|e| UltrablueError::Tpm(e.to_string()))?;

    let quotes = attestation
        .quotes
        .into_iter()
        .map(|q| Quote {
            quoted: q.quoted,
            signature: q.signature,
            pcrs: PcrBank {
                algorithm: q.hash_algorithm,
                pcrs: q.pcr_values,
            },
        })
        .collect();

    session
        .send(&PlatformParameters {
            quotes,
            event_log: attestation.event_log,
        })
        .await
}

async fn respond(config: &Config, tpm: &dyn TpmAdapter, session: &mut Session) -> Result<Outcome> {
    let response: Response = session.recv().await?;
    if response.err {
        return Ok(Outcome::ResponseFailure);
    }

    if config.pcr_extend && !response.secret.is_empty() {
        tpm.pcr_extend(PCR_EXTEND_INDEX, &response.secret)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))?;
    }
    Ok(Outcome::Success)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn read_pin() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| UltrablueError::KeyStore(format!("reading PIN: {e}")))?;
    Ok(line.trim().to_string())
}
