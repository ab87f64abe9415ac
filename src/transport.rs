use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

use crate::{error::Result, types::ScannedDevice};

/// Stream of raw notification/indication payloads for one characteristic
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Discovery and connection half of a BLE transport
///
/// Implemented by [`BleTransport`](crate::ble::BleTransport) for real radios and
/// by [`SimulatedTrainer`](crate::sim::SimulatedTrainer) for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for advertisers for `duration`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the radio cannot scan.
    async fn scan(&self, duration: Duration) -> Result<Vec<ScannedDevice>>;

    /// Open a link to the device at `address`
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::DeviceNotFound`](crate::FtmsError::DeviceNotFound) for an
    /// unknown address or a transport error if the link cannot be established.
    async fn connect(&self, address: &str) -> Result<Box<dyn TransportLink>>;
}

/// An established link to one peripheral
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Address of the connected peripheral
    fn address(&self) -> String;

    /// Enable notifications (or indications) on a characteristic
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::CharacteristicNotFound`](crate::FtmsError::CharacteristicNotFound)
    /// if the peripheral does not expose the characteristic.
    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream>;

    /// Write a value with response
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Read a characteristic value
    ///
    /// # Errors
    ///
    /// Returns a transport error if the read fails.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Close the link
    ///
    /// # Errors
    ///
    /// Returns a transport error if the peripheral cannot be disconnected.
    async fn disconnect(&self) -> Result<()>;
}
