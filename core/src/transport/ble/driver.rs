// Platform BLE driver abstraction
//
// The relay never touches a radio. Hosts (Swift/Kotlin bindings, a desktop
// stack, or the in-memory loopback) implement `BleDriver`, and every inbound
// happening (advertisements, writes, notifications, link loss) arrives on the
// driver's broadcast event stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Relay GATT service (must match on both peers)
pub const RELAY_SERVICE_UUID: Uuid = Uuid::from_u128(0x7A5E_0001_4C1D_4F3A_9B8E_2D6F0A1B3C5D);

/// Single characteristic carrying both data frames and ACKs
pub const RELAY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7A5E_0002_4C1D_4F3A_9B8E_2D6F0A1B3C5D);

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Platform identifier of a BLE peer (MAC address or OS-assigned UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// GATT DESCRIPTION
// ============================================================================

/// Characteristic properties relevant to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristicInfo>,
}

// ============================================================================
// EVENTS & ERRORS
// ============================================================================

/// Everything the platform reports asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Advertisement seen while scanning
    Advertisement {
        device_id: DeviceId,
        name: Option<String>,
        rssi: i16,
        service_uuids: Vec<Uuid>,
    },
    /// A connected central wrote to our characteristic (peripheral role)
    CharacteristicWritten { device_id: DeviceId, data: Vec<u8> },
    /// A peripheral notified us (central role)
    Notification { device_id: DeviceId, data: Vec<u8> },
    /// Link to a device dropped
    Disconnected { device_id: DeviceId },
}

/// Errors reported by the platform driver
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),
    #[error("Device not connected: {0}")]
    NotConnected(DeviceId),
    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// DRIVER TRAIT
// ============================================================================

/// Platform-specific BLE API
#[async_trait]
pub trait BleDriver: Send + Sync {
    /// Whether the adapter is present and powered
    async fn is_available(&self) -> Result<bool, DriverError>;

    async fn start_scan(&self, service: Uuid) -> Result<(), DriverError>;

    async fn stop_scan(&self) -> Result<(), DriverError>;

    /// Advertise `service` and host `characteristic` (write + notify)
    async fn start_advertising(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), DriverError>;

    async fn stop_advertising(&self) -> Result<(), DriverError>;

    async fn connect(&self, device: &DeviceId) -> Result<(), DriverError>;

    async fn disconnect(&self, device: &DeviceId) -> Result<(), DriverError>;

    async fn is_connected(&self, device: &DeviceId) -> Result<bool, DriverError>;

    async fn discover_services(&self, device: &DeviceId)
        -> Result<Vec<GattServiceInfo>, DriverError>;

    /// Request an MTU; returns the negotiated value
    async fn request_mtu(&self, device: &DeviceId, mtu: usize) -> Result<usize, DriverError>;

    /// Central → peripheral write with response
    async fn write_with_response(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), DriverError>;

    /// Peripheral → central notification
    async fn notify(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), DriverError>;

    /// Subscribe to the platform event stream
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}
