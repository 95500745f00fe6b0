//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running. The session
//! is opened lazily and dropped after any failure so the next cycle starts
//! from a fresh adapter handle.

use super::{ScanError, ScanFuture, Scanner};
use crate::reading::Advertisement;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Passive LE scanner on the default BlueZ adapter.
#[derive(Default)]
pub struct BluerScanner {
    connection: Mutex<Option<(Session, Adapter)>>,
}

impl BluerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<Adapter, ScanError> {
        let mut connection = self.connection.lock().await;
        if let Some((_, adapter)) = connection.as_ref() {
            return Ok(adapter.clone());
        }

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            })
            .await?;
        info!(adapter = %adapter.name(), "Bluetooth adapter ready");

        *connection = Some((session, adapter.clone()));
        Ok(adapter)
    }

    async fn scan_window(&self, window: Duration) -> Result<Vec<Advertisement>, ScanError> {
        let adapter = self.adapter().await?;
        let mut addresses = BTreeSet::new();

        {
            // Discovery stops when the stream is dropped.
            let events = adapter.discover_devices().await?;
            futures::pin_mut!(events);
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            addresses.insert(address);
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        }

        let mut observations = Vec::new();
        for address in addresses {
            match read_manufacturer_data(&adapter, address).await {
                Ok(mut found) => observations.append(&mut found),
                // Devices can vanish between discovery and the property read.
                Err(e) => debug!(%address, error = %e, "Failed to read device properties"),
            }
        }
        Ok(observations)
    }
}

impl Scanner for BluerScanner {
    fn scan(&self, window: Duration) -> ScanFuture<'_> {
        Box::pin(async move {
            let result = self.scan_window(window).await;
            if result.is_err() {
                *self.connection.lock().await = None;
            }
            result
        })
    }
}

/// One advertisement per manufacturer id the device currently exposes.
async fn read_manufacturer_data(
    adapter: &Adapter,
    address: Address,
) -> Result<Vec<Advertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(Vec::new());
    };
    let rssi = device.rssi().await?;

    Ok(manufacturer_data
        .into_iter()
        .map(|(manufacturer_id, data)| Advertisement {
            mac: address.into(),
            manufacturer_id,
            data,
            rssi,
        })
        .collect())
}
