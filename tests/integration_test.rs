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

//! End-to-end scenarios driving the protocol driver over an in-memory pipe
//! against the mock TPM, the way a real verifier would drive it over BLE.
//! Each test plays the part of the verifier: it writes/reads the same
//! characteristic pipe the GATT dispatch layer would, without involving
//! BlueZ at all.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use ultrablue::ble::dispatch::{DriverSpawner, GattHandler};
use ultrablue::ble::framing::recv_chunk;
use ultrablue::ble::pipe::{pipe, CharEnd, DriverEnd};
use ultrablue::config::Config;
use ultrablue::keystore::KeyStore;
use ultrablue::protocol::{self, Bytestring, EncryptedCredential, Outcome, Response};
use ultrablue::session::Session;
use ultrablue::tpm::testing::MockTpm;
use ultrablue::tpm::TpmAdapter;

fn base_config(dir: &std::path::Path) -> Config {
    Config {
        enroll: false,
        loglevel: 1,
        mtu: 500,
        pcr_extend: false,
        with_pin: false,
        key_dir: dir.to_path_buf(),
    }
}

fn encrypt(cipher: &Aes256Gcm, plain: &[u8]) -> Vec<u8> {
    let iv: [u8; 12] = rand::random();
    let ciphertext = cipher.encrypt(Nonce::from_slice(&iv), plain).unwrap();
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

fn try_decrypt(cipher: &Aes256Gcm, payload: &[u8]) -> Option<Vec<u8>> {
    let (iv, ciphertext) = payload.split_at(12);
    cipher.decrypt(Nonce::from_slice(iv), ciphertext).ok()
}

async fn send_plain<T: Serialize>(ch: &mut CharEnd, value: &T) {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).unwrap();
    ch.deliver_inbound(buf).await.unwrap();
}

async fn send_encrypted<T: Serialize>(ch: &mut CharEnd, cipher: &Aes256Gcm, value: &T) {
    let mut plain = Vec::new();
    ciborium::into_writer(value, &mut plain).unwrap();
    ch.deliver_inbound(encrypt(cipher, &plain)).await.unwrap();
}

async fn recv_encrypted<T: DeserializeOwned>(ch: &mut CharEnd, cipher: &Aes256Gcm) -> T {
    let payload = ch.request_outbound().await.unwrap();
    ch.finish_outbound();
    let plain = try_decrypt(cipher, &payload).expect("verifier holds the real session key");
    ciborium::from_reader(plain.as_slice()).unwrap()
}

async fn discard(ch: &mut CharEnd) {
    let _ = ch.request_outbound().await.unwrap();
    ch.finish_outbound();
}

/// Plays the credential-activation and quote legs identically across
/// scenarios A, B and E: the driver doesn't care what's inside these
/// messages (the mock TPM echoes the secret verbatim), only that a
/// well-formed reply shows up.
async fn play_activation_and_quote(ch: &mut CharEnd, cipher: &Aes256Gcm) {
    discard(ch).await; // AttestationParameters
    send_encrypted(
        ch,
        cipher,
        &EncryptedCredential {
            credential: vec![0x01, 0x02],
            secret: vec![0x03, 0x04],
        },
    )
    .await;
    discard(ch).await; // activation secret echoed back
    send_encrypted(ch, cipher, &Bytestring::new(vec![0x10; 16])).await; // quote nonce
    discard(ch).await; // PlatformParameters
}

#[tokio::test]
async fn scenario_a_enrollment_creates_sealed_key_pair_with_private_mode() {
    let dir = tempfile::tempdir().unwrap();
    let keystore = KeyStore::open(dir.path()).unwrap();
    let tpm: Arc<dyn TpmAdapter> = Arc::new(MockTpm::new());
    let config = Config {
        enroll: true,
        ..base_config(dir.path())
    };
    let enroll_key = vec![0xABu8; 32];
    let uuid = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();

    let (driver, mut ch) = pipe();
    let session = Session::new(driver, tpm.clone());

    let run_tpm = tpm.clone();
    let run_key = enroll_key.clone();
    let server = tokio::spawn(async move {
        protocol::run(&config, run_tpm.as_ref(), &keystore, Some(run_key.as_slice()), session).await
    });

    send_plain(&mut ch, &Bytestring::new(uuid.as_bytes().to_vec())).await;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&enroll_key));
    let nonce: Bytestring = recv_encrypted(&mut ch, &cipher).await;
    send_encrypted(&mut ch, &cipher, &Bytestring::new(nonce.bytes.clone())).await;

    discard(&mut ch).await; // EnrollData
    play_activation_and_quote(&mut ch, &cipher).await;

    send_encrypted(
        &mut ch,
        &cipher,
        &Response {
            err: false,
            secret: Vec::new(),
        },
    )
    .await;

    let outcome = server.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Success);

    let priv_path = dir.path().join(uuid.to_string());
    let pub_path = dir.path().join(format!("{uuid}.pub"));
    assert!(priv_path.is_file());
    assert!(pub_path.is_file());
    let mode = std::fs::metadata(&priv_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[tokio::test]
async fn scenario_b_response_secret_extends_pcr_nine() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockTpm::new());
    let tpm: Arc<dyn TpmAdapter> = mock.clone();
    let key = vec![0x01u8; 32];
    let uuid = Uuid::new_v4();

    let keystore = KeyStore::open(dir.path()).unwrap();
    keystore.store(uuid, &tpm.seal(&key, None).unwrap()).unwrap();

    let config = Config {
        pcr_extend: true,
        ..base_config(dir.path())
    };

    let (driver, mut ch) = pipe();
    let session = Session::new(driver, tpm.clone());
    let run_tpm = tpm.clone();
    let server =
        tokio::spawn(async move { protocol::run(&config, run_tpm.as_ref(), &keystore, None, session).await });

    send_plain(&mut ch, &Bytestring::new(uuid.as_bytes().to_vec())).await;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce: Bytestring = recv_encrypted(&mut ch, &cipher).await;
    send_encrypted(&mut ch, &cipher, &Bytestring::new(nonce.bytes.clone())).await;
    play_activation_and_quote(&mut ch, &cipher).await;

    send_encrypted(
        &mut ch,
        &cipher,
        &Response {
            err: false,
            secret: vec![0xAA, 0xBB],
        },
    )
    .await;

    let outcome = server.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Success);
    assert_eq!(mock.extends(), vec![(9, vec![0xAA, 0xBB])]);
}

#[tokio::test]
async fn scenario_c_wrong_session_key_fails_authentication_without_crashing() {
    let dir = tempfile::tempdir().unwrap();
    let tpm: Arc<dyn TpmAdapter> = Arc::new(MockTpm::new());
    let real_key = vec![0x01u8; 32];
    let wrong_key = vec![0x02u8; 32];
    let uuid = Uuid::new_v4();

    let keystore = KeyStore::open(dir.path()).unwrap();
    keystore.store(uuid, &tpm.seal(&real_key, None).unwrap()).unwrap();

    let config = base_config(dir.path());
    let (driver, mut ch) = pipe();
    let session = Session::new(driver, tpm.clone());
    let run_tpm = tpm.clone();
    let server =
        tokio::spawn(async move { protocol::run(&config, run_tpm.as_ref(), &keystore, None, session).await });

    send_plain(&mut ch, &Bytestring::new(uuid.as_bytes().to_vec())).await;

    // The verifier never learns the real nonce: it can't decrypt the
    // server's message with the key it (wrongly) believes is correct. It
    // discards the fragment and replies using the wrong key regardless.
    discard(&mut ch).await;
    let wrong_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrong_key));
    send_encrypted(&mut ch, &wrong_cipher, &Bytestring::new(vec![0u8; 16])).await;

    let result = server.await.unwrap();
    assert!(result.is_err(), "AEAD mismatch must surface as an error, not a panic");
}

#[tokio::test]
async fn scenario_d_mutated_nonce_reply_fails_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let tpm: Arc<dyn TpmAdapter> = Arc::new(MockTpm::new());
    let key = vec![0x03u8; 32];
    let uuid = Uuid::new_v4();

    let keystore = KeyStore::open(dir.path()).unwrap();
    keystore.store(uuid, &tpm.seal(&key, None).unwrap()).unwrap();

    let config = base_config(dir.path());
    let (driver, mut ch) = pipe();
    let session = Session::new(driver, tpm.clone());
    let run_tpm = tpm.clone();
    let server =
        tokio::spawn(async move { protocol::run(&config, run_tpm.as_ref(), &keystore, None, session).await });

    send_plain(&mut ch, &Bytestring::new(uuid.as_bytes().to_vec())).await;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce: Bytestring = recv_encrypted(&mut ch, &cipher).await;
    let mutated: Vec<u8> = nonce.bytes.iter().map(|b| b ^ 0x01).collect();
    send_encrypted(&mut ch, &cipher, &Bytestring::new(mutated)).await;

    let result = server.await.unwrap();
    assert!(matches!(
        result,
        Err(ultrablue::error::UltrablueError::Protocol(
            ultrablue::error::ProtocolError::AuthFailure
        ))
    ));
}

#[tokio::test]
async fn scenario_e_error_response_exits_without_pcr_extend() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockTpm::new());
    let tpm: Arc<dyn TpmAdapter> = mock.clone();
    let key = vec![0x04u8; 32];
    let uuid = Uuid::new_v4();

    let keystore = KeyStore::open(dir.path()).unwrap();
    keystore.store(uuid, &tpm.seal(&key, None).unwrap()).unwrap();

    let config = Config {
        pcr_extend: true,
        ..base_config(dir.path())
    };

    let (driver, mut ch) = pipe();
    let session = Session::new(driver, tpm.clone());
    let run_tpm = tpm.clone();
    let server =
        tokio::spawn(async move { protocol::run(&config, run_tpm.as_ref(), &keystore, None, session).await });

    send_plain(&mut ch, &Bytestring::new(uuid.as_bytes().to_vec())).await;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce: Bytestring = recv_encrypted(&mut ch, &cipher).await;
    send_encrypted(&mut ch, &cipher, &Bytestring::new(nonce.bytes.clone())).await;
    play_activation_and_quote(&mut ch, &cipher).await;

    send_encrypted(
        &mut ch,
        &cipher,
        &Response {
            err: true,
            secret: Vec::new(),
        },
    )
    .await;

    let outcome = server.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::ResponseFailure);
    assert!(mock.extends().is_empty());
}

struct CapturingSpawner {
    driver: tokio::sync::Mutex<Option<DriverEnd>>,
    notify: tokio::sync::Notify,
}

impl CapturingSpawner {
    fn new() -> Self {
        Self {
            driver: tokio::sync::Mutex::new(None),
            notify: tokio::sync::Notify::new(),
        }
    }
}

impl DriverSpawner for CapturingSpawner {
    fn spawn(&self, driver: DriverEnd) {
        if let Ok(mut slot) = self.driver.try_lock() {
            *slot = Some(driver);
        }
        self.notify.notify_one();
    }
}

#[tokio::test]
async fn scenario_f_mtu_clamp_reassembles_a_1000_byte_message() {
    let spawner = Arc::new(CapturingSpawner::new());
    let handler = Arc::new(GattHandler::new(5, spawner.clone()));

    let reader = handler.clone();
    let read_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let mut expected_len: i64 = 0;
        loop {
            let packet = reader.handle_read().await.unwrap();
            recv_chunk(&mut buffer, &mut expected_len, &packet).unwrap();
            if expected_len != 0 && buffer.len() as i64 == expected_len {
                break;
            }
        }
        buffer
    });

    spawner.notify.notified().await;
    let mut driver = spawner.driver.lock().await.take().expect("driver captured on first dispatch");

    let msg: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let expected = msg.clone();
    let send_task = tokio::spawn(async move {
        driver.send(msg).await.unwrap();
    });

    let received = read_task.await.unwrap();
    send_task.await.unwrap();
    assert_eq!(received, expected);
}
