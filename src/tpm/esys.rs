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

//! Thin wrapper around `tss-esapi`'s `Context`, isolating every ESYS call
//! behind plain Rust types so [`super::Tpm`] never has to name a
//! `tss_esapi` type outside this module.
//!
//! The SRK is loaded from the well-known persistent handle `0x81000001` if
//! present, or created and evicted there on first use; sealing uses a
//! policy session with an optional `TPM2_PolicyPassword`; PCR extension
//! goes through `TPM2_PCREvent`.

use tss_esapi::{
    abstraction::{ak, ek, pcr},
    attributes::ObjectAttributesBuilder,
    constants::SessionType,
    handles::{KeyHandle as EsysKeyHandle, PersistentTpmHandle, TpmHandle},
    interface_types::{
        algorithm::{HashingAlgorithm, PublicAlgorithm},
        key_bits::RsaKeyBits,
        resource_handles::Hierarchy,
        session_handles::PolicySession,
    },
    structures::{
        Auth, CreatePrimaryKeyResult, Digest, PcrSelectionListBuilder, PcrSlot, Public,
        PublicBuilder, PublicRsaParametersBuilder, RsaExponent, RsaScheme, SensitiveData,
        SignatureScheme, SymmetricDefinition, SymmetricDefinitionObject,
    },
    tcti_ldr::TctiNameConf,
    Context as EsapiContext,
};

use super::{AttestationKey, EndorsementKey, PlatformAttestation, QuoteResult, SealedBlob};

const SRK_PERSISTENT_HANDLE: u32 = super::SRK_HANDLE;

/// Opaque handle to a key loaded in the TPM, scoped to this process's
/// `Context`. `Mock` stands in for `tpm::testing::MockTpm`'s
/// `AttestationKey`, which has no real ESYS handle to carry; the real
/// [`Context`] methods are never invoked with a mock-backed `AttestationKey`
/// since `MockTpm` never routes through this module.
#[derive(Debug)]
pub enum KeyHandle {
    Real(EsysKeyHandle),
    Mock,
}

impl KeyHandle {
    #[cfg(any(test, feature = "test-util"))]
    pub fn mock() -> Self {
        KeyHandle::Mock
    }

    fn real(&self) -> EsysKeyHandle {
        match self {
            KeyHandle::Real(h) => *h,
            KeyHandle::Mock => unreachable!(
                "a mock AttestationKey was passed to the real tss-esapi context"
            ),
        }
    }
}

pub struct Context {
    esys: EsapiContext,
    srk: EsysKeyHandle,
}

/// RSA-2048/SHA-256 SRK template: fixedTPM|fixedParent|sensitiveDataOrigin|
/// userWithAuth|restricted|decrypt|noDA, AES-128-CFB symmetric.
fn srk_template() -> Result<Public, String> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_restricted(true)
        .with_no_da(true)
        .build()
        .map_err(|e| e.to_string())?;

    let rsa_params = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(RsaExponent::default())
        .with_is_decryption_key(true)
        .with_restricted(true)
        .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
        .build()
        .map_err(|e| e.to_string())?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .build()
        .map_err(|e| e.to_string())
}

impl Context {
    pub fn open() -> Result<Self, String> {
        let tcti = TctiNameConf::from_environment_variable()
            .map_err(|_| "no TPM2TOOLS_TCTI / TCTI environment configured".to_string())?;
        let mut esys = EsapiContext::new(tcti).map_err(|e| e.to_string())?;
        let srk = Self::load_or_create_srk(&mut esys)?;
        Ok(Self { esys, srk })
    }

    fn load_or_create_srk(esys: &mut EsapiContext) -> Result<EsysKeyHandle, String> {
        let handle = TpmHandle::Persistent(
            PersistentTpmHandle::new(SRK_PERSISTENT_HANDLE).map_err(|e| e.to_string())?,
        );
        if let Ok(object_handle) = esys.tr_from_tpm_public(handle) {
            return Ok(object_handle.into());
        }

        let template = srk_template()?;
        let CreatePrimaryKeyResult { key_handle, .. } = esys
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, template.clone(), None, None, None, None)
            })
            .map_err(|e| e.to_string())?;

        esys.execute_with_nullauth_session(|ctx| {
            ctx.evict_control(
                Hierarchy::Owner.into(),
                key_handle.into(),
                PersistentTpmHandle::new(SRK_PERSISTENT_HANDLE)
                    .map_err(|e| e.to_string())?
                    .into(),
            )
        })
        .map_err(|e| e.to_string())?;

        Ok(key_handle)
    }

    pub fn get_random(&mut self, n: usize) -> Result<Vec<u8>, String> {
        let digest = self
            .esys
            .get_random(n)
            .map_err(|e| e.to_string())?;
        Ok(digest.as_bytes().to_vec())
    }

    /// Computes the policy digest a seal/unseal pair must agree on: empty
    /// when `with_pin` is false (the object is protected by the TPM binding
    /// alone), otherwise the digest of a single `TPM2_PolicyPassword`
    /// command.
    fn policy_digest(&mut self, with_pin: bool) -> Result<Digest, String> {
        let session = self
            .esys
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Trial,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "TPM returned no trial session".to_string())?;
        let policy_session = PolicySession::try_from(session).map_err(|e| e.to_string())?;

        if with_pin {
            self.esys
                .policy_password(policy_session)
                .map_err(|e| e.to_string())?;
        }
        let digest = self
            .esys
            .policy_get_digest(policy_session)
            .map_err(|e| e.to_string())?;
        self.esys
            .flush_context(session.into())
            .map_err(|e| e.to_string())?;
        Ok(digest)
    }

    /// Opens a real (non-trial) policy session satisfying the same policy
    /// computed by [`Context::policy_digest`], ready to authorize a single
    /// `unseal`.
    fn open_policy_session(&mut self, pin: Option<&str>) -> Result<PolicySession, String> {
        let session = self
            .esys
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "TPM returned no policy session".to_string())?;
        let policy_session = PolicySession::try_from(session).map_err(|e| e.to_string())?;

        if let Some(p) = pin {
            let auth = Auth::try_from(p.as_bytes().to_vec()).map_err(|e| e.to_string())?;
            self.esys
                .tr_set_auth(session.into(), auth)
                .map_err(|e| e.to_string())?;
            self.esys
                .policy_password(policy_session)
                .map_err(|e| e.to_string())?;
        }
        Ok(policy_session)
    }

    /// Seals `data` under the SRK. When `pin` is set, the returned blob can
    /// only be unsealed by a policy session that also supplies that PIN via
    /// `TPM2_PolicyPassword`; an unseal with a mismatched PIN fails the TPM's
    /// own session-auth check and increments the dictionary-attack counter.
    pub fn seal(&mut self, data: &[u8], pin: Option<&str>) -> Result<SealedBlob, String> {
        let policy = self.policy_digest(pin.is_some())?;
        let sensitive_data = SensitiveData::try_from(data.to_vec()).map_err(|e| e.to_string())?;

        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()
            .map_err(|e| e.to_string())?;

        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(policy)
            .build()
            .map_err(|e| e.to_string())?;

        let srk = self.srk;
        let (private, public_out) = self
            .esys
            .execute_with_nullauth_session(|ctx| {
                ctx.create(srk, public, None, Some(sensitive_data), None, None)
            })
            .map(|result| (result.out_private, result.out_public))
            .map_err(|e| e.to_string())?;

        Ok(SealedBlob {
            private: private.as_bytes().to_vec(),
            public: public_out.marshall().map_err(|e| e.to_string())?,
        })
    }

    pub fn unseal(&mut self, blob: &SealedBlob, pin: Option<&str>) -> Result<Vec<u8>, String> {
        let public = Public::unmarshall(&blob.public).map_err(|e| e.to_string())?;
        let private = blob
            .private
            .clone()
            .try_into()
            .map_err(|e: tss_esapi::Error| e.to_string())?;

        let srk = self.srk;
        let loaded = self
            .esys
            .execute_with_nullauth_session(|ctx| ctx.load(srk, private, public))
            .map_err(|e| e.to_string())?;

        let policy_session = self.open_policy_session(pin)?;
        let data = self
            .esys
            .execute_with_session(Some(policy_session.into()), |ctx| {
                ctx.unseal(loaded.into())
            })
            .map_err(|e| e.to_string())?;

        Ok(data.as_bytes().to_vec())
    }

    pub fn pcr_event(&mut self, index: u32, data: &[u8]) -> Result<(), String> {
        let selection = PcrSelectionListBuilder::new()
            .with_selection(HashingAlgorithm::Sha256, &[pcr_slot(index)?])
            .build()
            .map_err(|e| e.to_string())?;
        let digest = Digest::try_from(data.to_vec()).map_err(|e| e.to_string())?;

        self.esys
            .execute_with_nullauth_session(|ctx| ctx.pcr_event(selection.clone(), digest.clone()))
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn endorsement_keys(&mut self) -> Result<Vec<EndorsementKey>, String> {
        let ek_handle = ek::create_ek_object(&mut self.esys, HashingAlgorithm::Sha256, None)
            .map_err(|e| e.to_string())?;
        let (public, ..) = self
            .esys
            .read_public(ek_handle)
            .map_err(|e| e.to_string())?;
        let cert = ek::retrieve_ek_pubcert(&mut self.esys, HashingAlgorithm::Sha256)
            .unwrap_or_default();

        let (n, e) = match &public {
            Public::Rsa { unique, parameters, .. } => {
                (unique.as_bytes().to_vec(), parameters.exponent().value())
            }
            _ => return Err("endorsement key is not RSA".to_string()),
        };

        Ok(vec![EndorsementKey {
            cert_der: cert,
            n,
            e,
        }])
    }

    pub fn new_ak(&mut self) -> Result<AttestationKey, String> {
        let ek_handle = ek::create_ek_object(&mut self.esys, HashingAlgorithm::Sha256, None)
            .map_err(|e| e.to_string())?;

        let ak_result = ak::create_ak(
            &mut self.esys,
            ek_handle,
            HashingAlgorithm::Sha256,
            SignatureScheme::RsaSsa,
            None,
            None,
        )
        .map_err(|e| e.to_string())?;

        let ak_handle = ak::load_ak(
            &mut self.esys,
            ek_handle,
            None,
            ak_result.out_private.clone(),
            ak_result.out_public.clone(),
        )
        .map_err(|e| e.to_string())?;

        Ok(AttestationKey {
            handle: KeyHandle::Real(ak_handle),
            public: ak_result.out_public.marshall().map_err(|e| e.to_string())?,
            creation_data: ak_result
                .creation_data
                .marshall()
                .map_err(|e| e.to_string())?,
            creation_hash: ak_result.creation_hash.as_bytes().to_vec(),
            creation_ticket: ak_result
                .creation_ticket
                .marshall()
                .map_err(|e| e.to_string())?,
        })
    }

    pub fn activate_credential(
        &mut self,
        ak: &AttestationKey,
        credential: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>, String> {
        let credential_blob =
            tss_esapi::structures::IdObject::try_from(credential.to_vec())
                .map_err(|e| e.to_string())?;
        let secret = tss_esapi::structures::EncryptedSecret::try_from(secret.to_vec())
            .map_err(|e| e.to_string())?;

        let ak_handle = ak.handle.real();
        let digest = self
            .esys
            .execute_with_nullauth_session(|ctx| {
                ctx.activate_credential(ak_handle, self.srk, credential_blob.clone(), secret.clone())
            })
            .map_err(|e| e.to_string())?;

        Ok(digest.as_bytes().to_vec())
    }

    pub fn quote(
        &mut self,
        ak: &AttestationKey,
        nonce: &[u8],
    ) -> Result<PlatformAttestation, String> {
        let qualifying_data = Digest::try_from(nonce.to_vec()).map_err(|e| e.to_string())?;
        let selection = pcr::pcr_extend_selection_list(HashingAlgorithm::Sha256);

        let ak_handle = ak.handle.real();
        let (attestation, signature) = self
            .esys
            .execute_with_nullauth_session(|ctx| {
                ctx.quote(
                    ak_handle,
                    qualifying_data.clone(),
                    SignatureScheme::Null,
                    selection.clone(),
                )
            })
            .map_err(|e| e.to_string())?;

        let pcr_data = pcr::read_all(&mut self.esys, selection.clone()).map_err(|e| e.to_string())?;
        let pcr_values = pcr_data
            .pcr_bank(HashingAlgorithm::Sha256)
            .map(|bank| {
                bank.into_iter()
                    .map(|(slot, digest)| (slot_index(slot), digest.value().to_vec()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(PlatformAttestation {
            quotes: vec![QuoteResult {
                quoted: attestation.marshall().map_err(|e| e.to_string())?,
                signature: signature.marshall().map_err(|e| e.to_string())?,
                pcr_values,
                hash_algorithm: "sha256".to_string(),
            }],
            event_log: std::fs::read("/sys/kernel/security/tpm0/binary_bios_measurements")
                .unwrap_or_default(),
        })
    }
}

fn pcr_slot(index: u32) -> Result<PcrSlot, String> {
    PcrSlot::try_from(index).map_err(|_| format!("invalid PCR index: {index}"))
}

fn slot_index(slot: PcrSlot) -> u32 {
    u32::from(slot)
}
