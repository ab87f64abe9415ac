use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    transport::{NotificationStream, Transport, TransportLink},
    types::ScannedDevice,
    FTMS_SERVICE_UUID,
};

/// btleplug backed [`Transport`]
pub struct BleTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleTransport {
    /// Create a new BLE transport
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn central(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(FtmsError::DeviceNotFound)
    }

    async fn describe(peripheral: &Peripheral) -> ScannedDevice {
        let address = peripheral.address().to_string();
        match peripheral.properties().await {
            Ok(Some(properties)) => ScannedDevice {
                address,
                name: properties.local_name,
                rssi: properties.rssi,
                advertised_services: properties.services,
            },
            _ => ScannedDevice {
                address,
                name: None,
                rssi: None,
                advertised_services: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<ScannedDevice>> {
        info!("Starting scan for FTMS trainers...");

        let central = self.central().await?;
        central
            .start_scan(ScanFilter {
                services: vec![FTMS_SERVICE_UUID],
            })
            .await?;

        tokio::time::sleep(duration).await;

        central.stop_scan().await?;

        let mut devices = Vec::new();
        let mut known = self.peripherals.lock().await;
        for peripheral in central.peripherals().await? {
            let device = Self::describe(&peripheral).await;
            debug!("Discovered {}", device.label());
            known.insert(device.address.clone(), peripheral);
            devices.push(device);
        }

        info!("Scan completed. Found {} device(s)", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn TransportLink>> {
        info!("Connecting to device: {address}");

        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or(FtmsError::DeviceNotFound)?;

        peripheral
            .connect()
            .await
            .map_err(|e| FtmsError::ConnectFailed(e.to_string()))?;
        peripheral.discover_services().await?;

        info!("Successfully connected to {address}");
        Ok(Box::new(BleLink { peripheral }))
    }
}

/// Live btleplug connection to one trainer
pub struct BleLink {
    peripheral: Peripheral,
}

impl BleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(FtmsError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl TransportLink for BleLink {
    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&target).await?;

        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |data| async move {
                (data.uuid == characteristic).then_some(data.value)
            })
            .boxed())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        debug!("Writing {characteristic}: {value:02X?}");

        self.peripheral
            .write(&target, value, WriteType::WithResponse)
            .await
            .map_err(|e| FtmsError::Transport(format!("Failed to write {characteristic}: {e}")))
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .read(&target)
            .await
            .map_err(|e| FtmsError::Transport(format!("Failed to read {characteristic}: {e}")))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
