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

//! Registers the single Ultrablue GATT characteristic with BlueZ and starts
//! advertising.

use std::sync::Arc;

use anyhow::Result;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, Service,
};
use bluer::Adapter;

use super::constants::{ADVERTISED_NAME, CHARACTERISTIC_UUID, SERVICE_UUID};
use super::dispatch::{DriverSpawner, GattHandler};

/// Handles that must stay alive for as long as the service should remain
/// registered and advertised; dropping either tears it down.
pub struct GattService {
    _app: ApplicationHandle,
    _adv: AdvertisementHandle,
}

/// Registers the Ultrablue GATT service on `adapter` and starts advertising
/// it under [`ADVERTISED_NAME`]. `spawner` is invoked once per new
/// connection to spin up that connection's protocol driver task.
pub async fn serve(
    adapter: &Adapter,
    mtu: u16,
    spawner: Arc<dyn DriverSpawner>,
) -> Result<GattService> {
    let handler = Arc::new(GattHandler::new(mtu, spawner));

    let read_handler = handler.clone();
    let write_handler = handler.clone();

    let characteristic = Characteristic {
        uuid: CHARACTERISTIC_UUID,
        read: Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |_req: CharacteristicReadRequest| {
                let handler = read_handler.clone();
                Box::pin(async move { handler.handle_read().await })
            }),
            ..Default::default()
        }),
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |data: Vec<u8>, _req: CharacteristicWriteRequest| {
                    let handler = write_handler.clone();
                    Box::pin(async move { handler.handle_write(data).await })
                },
            )),
            ..Default::default()
        }),
        ..Default::default()
    };

    let service = Service {
        uuid: SERVICE_UUID,
        primary: true,
        characteristics: vec![characteristic],
        ..Default::default()
    };

    let app = Application {
        services: vec![service],
        ..Default::default()
    };

    let app_handle = adapter.serve_gatt_application(app).await?;

    let advertisement = Advertisement {
        service_uuids: vec![SERVICE_UUID].into_iter().collect(),
        discoverable: Some(true),
        local_name: Some(ADVERTISED_NAME.to_string()),
        ..Default::default()
    };
    let adv_handle = adapter.advertise(advertisement).await?;

    tracing::info!(name = ADVERTISED_NAME, %SERVICE_UUID, "GATT service advertising");

    Ok(GattService {
        _app: app_handle,
        _adv: adv_handle,
    })
}
