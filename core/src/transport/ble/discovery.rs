/// BLE device discovery
///
/// Wraps the platform driver's scan/advertise primitives for the relay
/// service, and owns the shared device registry that discovery and the
/// connection manager both read.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::driver::{
    BleDriver, DeviceId, DriverError, DriverEvent, RELAY_CHARACTERISTIC_UUID, RELAY_SERVICE_UUID,
};
use crate::clock::Clock;
use crate::error::ConnectionError;

/// Link state of a known device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// RSSI placeholder for records created before any advertisement was seen
pub const UNKNOWN_RSSI: i16 = i16::MIN;

/// What the relay knows about one physical peer
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub display_name: String,
    /// RSSI in dBm
    pub signal_strength: i16,
    pub last_seen_at: u64,
    connection_state: ConnectionState,
}

impl DeviceRecord {
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Rough distance in meters from RSSI (log-distance path loss, n = 2).
    /// None until an advertisement has reported a signal strength.
    pub fn estimate_distance_m(&self) -> Option<f64> {
        // Typical BLE RSSI at 1 m
        const MEASURED_POWER: f64 = -59.0;
        if self.signal_strength == UNKNOWN_RSSI {
            return None;
        }
        Some(10f64.powf((MEASURED_POWER - f64::from(self.signal_strength)) / 20.0))
    }
}

/// Shared table of known devices.
///
/// Discovery creates and refreshes records; only the connection manager
/// changes `connection_state`.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<DeviceId, DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record from an advertisement
    pub fn record_sighting(
        &self,
        device_id: &DeviceId,
        name: Option<String>,
        rssi: i16,
        now: u64,
    ) -> DeviceRecord {
        let mut devices = self.devices.write();
        let record = devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.clone(),
                display_name: device_id.to_string(),
                signal_strength: rssi,
                last_seen_at: now,
                connection_state: ConnectionState::Discovered,
            });
        if let Some(name) = name {
            record.display_name = name;
        }
        record.signal_strength = rssi;
        record.last_seen_at = now;
        record.clone()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn all(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self.devices.read().values().cloned().collect();
        records.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        records
    }

    pub fn connected(&self) -> Vec<DeviceId> {
        self.devices
            .read()
            .values()
            .filter(|r| r.connection_state == ConnectionState::Connected)
            .map(|r| r.device_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Drop idle records not seen since `cutoff`; live links are kept
    pub fn prune_seen_before(&self, cutoff: u64) -> usize {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|_, r| {
            matches!(
                r.connection_state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) || r.last_seen_at >= cutoff
        });
        before - devices.len()
    }

    pub(super) fn set_connection_state(
        &self,
        device_id: &DeviceId,
        state: ConnectionState,
        now: u64,
    ) {
        let mut devices = self.devices.write();
        let record = devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.clone(),
                display_name: device_id.to_string(),
                signal_strength: UNKNOWN_RSSI,
                last_seen_at: now,
                connection_state: state,
            });
        if record.connection_state != state {
            debug!(
                "Device {} {:?} -> {:?}",
                device_id, record.connection_state, state
            );
        }
        record.connection_state = state;
        record.last_seen_at = now;
    }
}

/// Callback invoked for every matching advertisement during a scan
pub type OnDeviceFound = Arc<dyn Fn(DeviceRecord) + Send + Sync>;

/// Scanner / advertiser for the relay service
pub struct BleDiscovery {
    driver: Arc<dyn BleDriver>,
    registry: DeviceRegistry,
    clock: Arc<dyn Clock>,
    scanning: Arc<AtomicBool>,
    advertising: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BleDiscovery {
    pub fn new(driver: Arc<dyn BleDriver>, registry: DeviceRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            driver,
            registry,
            clock,
            scanning: Arc::new(AtomicBool::new(false)),
            advertising: AtomicBool::new(false),
            scan_task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    async fn ensure_available(&self) -> Result<(), ConnectionError> {
        match self.driver.is_available().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ConnectionError::DriverUnavailable(
                "adapter off or missing".to_string(),
            )),
            Err(e) => Err(ConnectionError::DriverUnavailable(e.to_string())),
        }
    }

    /// Begin a timed scan. A scan already running is replaced.
    pub async fn start_scanning(
        &self,
        on_found: OnDeviceFound,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        self.stop_scanning().await;
        self.ensure_available().await?;

        // Subscribe before starting so no advertisement is missed
        let mut events = self.driver.subscribe();
        self.driver
            .start_scan(RELAY_SERVICE_UUID)
            .await
            .map_err(|e| ConnectionError::DriverUnavailable(e.to_string()))?;
        self.scanning.store(true, Ordering::SeqCst);
        info!("BLE scan started ({}ms)", timeout.as_millis());

        let driver = self.driver.clone();
        let registry = self.registry.clone();
        let clock = self.clock.clone();
        let scanning = self.scanning.clone();

        let handle = tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.recv() => match event {
                        Ok(DriverEvent::Advertisement { device_id, name, rssi, service_uuids })
                            if service_uuids.contains(&RELAY_SERVICE_UUID) =>
                        {
                            let record = registry.record_sighting(&device_id, name, rssi, clock.now_ms());
                            debug!("Found relay peer {} ({} dBm)", device_id, rssi);
                            on_found(record);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Scan listener lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            if let Err(e) = driver.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            scanning.store(false, Ordering::SeqCst);
            info!("BLE scan finished");
        });

        *self.scan_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop a running scan. No-op when idle.
    pub async fn stop_scanning(&self) {
        let task = self.scan_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        if self.scanning.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.driver.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            info!("BLE scan stopped");
        }
    }

    /// Advertise the relay service (merchant / receiving mode)
    pub async fn start_advertising(&self) -> Result<(), ConnectionError> {
        if self.is_advertising() {
            return Ok(());
        }
        self.ensure_available().await?;
        self.driver
            .start_advertising(RELAY_SERVICE_UUID, RELAY_CHARACTERISTIC_UUID)
            .await
            .map_err(|e| ConnectionError::DriverUnavailable(e.to_string()))?;
        self.advertising.store(true, Ordering::SeqCst);
        info!("Advertising relay service {}", RELAY_SERVICE_UUID);
        Ok(())
    }

    pub async fn stop_advertising(&self) -> Result<(), ConnectionError> {
        if !self.advertising.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.driver
            .stop_advertising()
            .await
            .map_err(|e: DriverError| ConnectionError::DriverUnavailable(e.to_string()))?;
        info!("Stopped advertising");
        Ok(())
    }
}

impl Drop for BleDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
    }
}
