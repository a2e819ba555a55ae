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

//! Ultrablue attester: a TPM 2.0 remote-attestation BLE server.
//!
//! Wires together the TPM adapter, key store, and GATT service, then waits
//! for a single verifier connection to run the attestation script end to
//! end.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ultrablue::ble::{self, pipe::DriverEnd};
use ultrablue::config::Config;
use ultrablue::keystore::KeyStore;
use ultrablue::protocol::{self, Outcome};
use ultrablue::qr;
use ultrablue::session::Session;
use ultrablue::tpm::{Tpm, TpmAdapter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                tracing_subscriber::filter::LevelFilter::from_level(config.tracing_level()).into(),
            ),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ultrablue");

    let tpm: Arc<dyn TpmAdapter> = Arc::new(
        tokio::task::spawn_blocking(Tpm::open)
            .await
            .context("TPM open task panicked")?
            .context("opening TPM")?,
    );

    let keystore = Arc::new(KeyStore::open(config.key_dir.clone()).context("opening key store")?);

    let session = bluer::Session::new().await.context("opening BlueZ session")?;
    let adapter = session
        .default_adapter()
        .await
        .context("getting default Bluetooth adapter")?;
    if !adapter.is_powered().await? {
        tracing::info!("powering on Bluetooth adapter");
        adapter.set_powered(true).await?;
    }

    let enroll_key = if config.enroll {
        let address = adapter.address().await.context("reading adapter address")?;
        let tpm_for_key = tpm.clone();
        let key = tokio::task::spawn_blocking(move || {
            tpm_for_key.get_random(protocol::SESSION_KEY_LEN)
        })
        .await
        .context("random-generation task panicked")?
        .map_err(|e| anyhow::anyhow!("generating enrollment key: {e}"))?;

        qr::print_enrollment_qr(&address.to_string(), &key)?;
        Some(key)
    } else {
        None
    };

    let config = Arc::new(config);
    let spawner_config = config.clone();
    let spawner_tpm = tpm.clone();
    let spawner_keystore = keystore.clone();
    let spawner_enroll_key = enroll_key.clone();

    let spawn_driver = move |driver: DriverEnd| {
        let config = spawner_config.clone();
        let tpm = spawner_tpm.clone();
        let keystore = spawner_keystore.clone();
        let enroll_key = spawner_enroll_key.clone();

        tokio::spawn(async move {
            let session = Session::new(driver, tpm.clone());
            let result = protocol::run(
                &config,
                tpm.as_ref(),
                keystore.as_ref(),
                enroll_key.as_deref(),
                session,
            )
            .await;

            match result {
                Ok(Outcome::Success) => {
                    tracing::info!("attestation succeeded, exiting");
                    std::process::exit(0);
                }
                Ok(Outcome::ResponseFailure) => {
                    tracing::warn!("verifier reported attestation failure, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection terminated before completion");
                }
            }
        });
    };

    let _service = ble::bootstrap::serve(&adapter, config.mtu, Arc::new(spawn_driver))
        .await
        .context("starting GATT service")?;

    tracing::info!("waiting for a verifier connection (Ctrl-C to stop)");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    Ok(())
}
