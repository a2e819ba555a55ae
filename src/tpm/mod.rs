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

//! TPM 2.0 adapter.
//!
//! Wraps `tss-esapi` behind a small trait so the protocol driver and its
//! tests don't need real hardware.

mod esys;

use crate::error::{Result, UltrablueError};

/// Persistent NV index the Storage Root Key is evicted to.
///
/// TCG TPM v2.0 Provisioning Guidance, section 7.8.
pub const SRK_HANDLE: u32 = 0x8100_0001;

/// An endorsement key: TPM-manufacturer-certified, uniquely identifies the
/// TPM. Only RSA EKs are supported.
#[derive(Debug, Clone)]
pub struct EndorsementKey {
    /// DER-encoded EK certificate, empty if the TPM has none burned in.
    pub cert_der: Vec<u8>,
    /// RSA modulus.
    pub n: Vec<u8>,
    /// RSA public exponent.
    pub e: u32,
}

/// A freshly created attestation key, plus the attestation parameters sent
/// to the verifier to prove it was created under this TPM's EK.
#[derive(Debug)]
pub struct AttestationKey {
    pub(crate) handle: esys::KeyHandle,
    pub public: Vec<u8>,
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: Vec<u8>,
}

/// A sealed (private, public) blob pair, as persisted by the key store.
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

/// One TPM quote: a signed PCR snapshot plus the signature over it.
#[derive(Debug, Clone)]
pub struct QuoteResult {
    pub quoted: Vec<u8>,
    pub signature: Vec<u8>,
    pub pcr_values: Vec<(u32, Vec<u8>)>,
    pub hash_algorithm: String,
}

/// Everything the attestation quote phase sends to the verifier.
#[derive(Debug)]
pub struct PlatformAttestation {
    pub quotes: Vec<QuoteResult>,
    pub event_log: Vec<u8>,
}

/// Abstracts the TPM operations the protocol driver needs. The production
/// implementation, [`Tpm`], opens the platform's default TPM 2.0 device;
/// tests use an in-memory fake (`tpm::testing::MockTpm`) instead.
pub trait TpmAdapter: Send + Sync {
    /// Returns exactly `n` random bytes, never all-zero.
    fn get_random(&self, n: usize) -> Result<Vec<u8>>;

    /// Seals `data` under the SRK, optionally behind a PIN policy.
    fn seal(&self, data: &[u8], pin: Option<&str>) -> Result<SealedBlob>;

    /// Unseals a blob pair previously produced by [`TpmAdapter::seal`].
    fn unseal(&self, blob: &SealedBlob, pin: Option<&str>) -> Result<Vec<u8>>;

    /// Extends `index` with `data` (no event-log entry is written — see the
    /// "PCR-extend without event-log entry" design note).
    fn pcr_extend(&self, index: u32, data: &[u8]) -> Result<()>;

    /// Enumerates this TPM's endorsement keys.
    fn endorsement_keys(&self) -> Result<Vec<EndorsementKey>>;

    /// Creates a fresh attestation key under the SRK.
    fn new_ak(&self) -> Result<AttestationKey>;

    /// Runs TPM2_ActivateCredential, returning the decrypted secret.
    fn activate_credential(
        &self,
        ak: &AttestationKey,
        credential: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>>;

    /// Quotes the platform's PCR banks over `nonce`, signed by `ak`.
    fn quote(&self, ak: &AttestationKey, nonce: &[u8]) -> Result<PlatformAttestation>;
}

/// Production TPM adapter, backed by `tss-esapi` against the platform's
/// default TPM 2.0 device (no explicit device path flag).
///
/// Uses `parking_lot::Mutex` rather than `std::sync::Mutex`: a TPM command
/// failing partway through never needs to taint every later command with
/// poisoning, so there's no poisoning to handle at each call site.
pub struct Tpm {
    ctx: parking_lot::Mutex<esys::Context>,
}

impl Tpm {
    /// Opens the platform TPM. The underlying handle is released when `Tpm`
    /// is dropped.
    pub fn open() -> Result<Self> {
        let ctx = esys::Context::open().map_err(|e| UltrablueError::Tpm(e.to_string()))?;
        Ok(Self {
            ctx: parking_lot::Mutex::new(ctx),
        })
    }
}

impl TpmAdapter for Tpm {
    fn get_random(&self, n: usize) -> Result<Vec<u8>> {
        let mut ctx = self.ctx.lock();
        let bytes = ctx
            .get_random(n)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))?;
        if bytes.len() != n || bytes.iter().all(|b| *b == 0) {
            return Err(UltrablueError::Tpm(
                "TPM returned an unusable random buffer".into(),
            ));
        }
        Ok(bytes)
    }

    fn seal(&self, data: &[u8], pin: Option<&str>) -> Result<SealedBlob> {
        let mut ctx = self.ctx.lock();
        ctx.seal(data, pin)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))
    }

    fn unseal(&self, blob: &SealedBlob, pin: Option<&str>) -> Result<Vec<u8>> {
        let mut ctx = self.ctx.lock();
        ctx.unseal(blob, pin)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))
    }

    fn pcr_extend(&self, index: u32, data: &[u8]) -> Result<()> {
        let mut ctx = self.ctx.lock();
        ctx.pcr_event(index, data)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))
    }

    fn endorsement_keys(&self) -> Result<Vec<EndorsementKey>> {
        let mut ctx = self.ctx.lock();
        ctx.endorsement_keys()
            .map_err(|e| UltrablueError::Tpm(e.to_string()))
    }

    fn new_ak(&self) -> Result<AttestationKey> {
        let mut ctx = self.ctx.lock();
        ctx.new_ak().map_err(|e| UltrablueError::Tpm(e.to_string()))
    }

    fn activate_credential(
        &self,
        ak: &AttestationKey,
        credential: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let mut ctx = self.ctx.lock();
        ctx.activate_credential(ak, credential, secret)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))
    }

    fn quote(&self, ak: &AttestationKey, nonce: &[u8]) -> Result<PlatformAttestation> {
        let mut ctx = self.ctx.lock();
        ctx.quote(ak, nonce)
            .map_err(|e| UltrablueError::Tpm(e.to_string()))
    }
}

/// In-memory TPM stand-in, public under the `test-util` feature so both
/// this crate's own tests and external integration tests can drive the
/// protocol/session/keystore layers without real hardware.
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// `rng` is a deterministic byte source so tests are reproducible;
    /// seal/unseal is plain XOR "encryption" keyed by an in-process secret,
    /// which is enough to exercise the seal/unseal contract (and the
    /// PIN-mismatch path) without real hardware.
    pub struct MockTpm {
        rng_seed: Mutex<u8>,
        pin_required: Option<String>,
        extends: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    impl MockTpm {
        pub fn new() -> Self {
            Self {
                rng_seed: Mutex::new(1),
                pin_required: None,
                extends: Mutex::new(Vec::new()),
            }
        }

        pub fn with_pin(pin: &str) -> Self {
            Self {
                pin_required: Some(pin.to_string()),
                ..Self::new()
            }
        }

        pub fn extends(&self) -> Vec<(u32, Vec<u8>)> {
            self.extends.lock().unwrap().clone()
        }

        fn seal_key() -> u8 {
            0x5A
        }
    }

    impl Default for MockTpm {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TpmAdapter for MockTpm {
        fn get_random(&self, n: usize) -> Result<Vec<u8>> {
            let mut seed = self.rng_seed.lock().unwrap();
            let bytes: Vec<u8> = (0..n)
                .map(|i| {
                    *seed = seed.wrapping_add(0x2F).wrapping_add(i as u8);
                    *seed | 1 // never all-zero
                })
                .collect();
            Ok(bytes)
        }

        fn seal(&self, data: &[u8], pin: Option<&str>) -> Result<SealedBlob> {
            if let Some(required) = &self.pin_required {
                if pin != Some(required.as_str()) {
                    return Err(UltrablueError::Tpm("PIN required to seal".into()));
                }
            }
            let xored: Vec<u8> = data.iter().map(|b| b ^ Self::seal_key()).collect();
            Ok(SealedBlob {
                private: xored,
                public: b"mock-public".to_vec(),
            })
        }

        fn unseal(&self, blob: &SealedBlob, pin: Option<&str>) -> Result<Vec<u8>> {
            if let Some(required) = &self.pin_required {
                if pin != Some(required.as_str()) {
                    return Err(UltrablueError::Tpm("PIN mismatch".into()));
                }
            }
            Ok(blob.private.iter().map(|b| b ^ Self::seal_key()).collect())
        }

        fn pcr_extend(&self, index: u32, data: &[u8]) -> Result<()> {
            self.extends.lock().unwrap().push((index, data.to_vec()));
            Ok(())
        }

        fn endorsement_keys(&self) -> Result<Vec<EndorsementKey>> {
            Ok(vec![EndorsementKey {
                cert_der: Vec::new(),
                n: vec![0xDE, 0xAD, 0xBE, 0xEF],
                e: 65537,
            }])
        }

        fn new_ak(&self) -> Result<AttestationKey> {
            Ok(AttestationKey {
                handle: esys::KeyHandle::mock(),
                public: b"mock-ak-public".to_vec(),
                creation_data: b"mock-creation-data".to_vec(),
                creation_hash: b"mock-creation-hash".to_vec(),
                creation_ticket: b"mock-creation-ticket".to_vec(),
            })
        }

        fn activate_credential(
            &self,
            _ak: &AttestationKey,
            _credential: &[u8],
            secret: &[u8],
        ) -> Result<Vec<u8>> {
            Ok(secret.to_vec())
        }

        fn quote(&self, _ak: &AttestationKey, nonce: &[u8]) -> Result<PlatformAttestation> {
            Ok(PlatformAttestation {
                quotes: vec![QuoteResult {
                    quoted: nonce.to_vec(),
                    signature: b"mock-signature".to_vec(),
                    pcr_values: vec![(0, vec![0u8; 32])],
                    hash_algorithm: "sha256".to_string(),
                }],
                event_log: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockTpm;
    use super::TpmAdapter;

    #[test]
    fn get_random_is_never_all_zero() {
        let tpm = MockTpm::new();
        let bytes = tpm.get_random(16).unwrap();
        assert_eq!(bytes.len(), 16);
        assert!(bytes.iter().any(|b| *b != 0));
    }

    #[test]
    fn seal_unseal_roundtrips() {
        let tpm = MockTpm::new();
        let blob = tpm.seal(b"top secret", None).unwrap();
        let data = tpm.unseal(&blob, None).unwrap();
        assert_eq!(data, b"top secret");
    }

    #[test]
    fn pin_mismatch_fails_unseal() {
        let tpm = MockTpm::with_pin("1234");
        let blob = tpm.seal(b"top secret", Some("1234")).unwrap();
        assert!(tpm.unseal(&blob, Some("0000")).is_err());
        assert!(tpm.unseal(&blob, Some("1234")).is_ok());
    }
}
