/// BLE connection lifecycle
///
/// Per device: Idle -> Connecting -> Connected -> Idle. A connect verifies the
/// relay service and a writable relay characteristic before the link counts,
/// negotiates the MTU, and retries with a fixed delay up to the configured
/// bound. Only this module moves a `DeviceRecord` between connection states.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::discovery::{ConnectionState, DeviceRegistry};
use super::driver::{BleDriver, DeviceId, DriverError, RELAY_CHARACTERISTIC_UUID, RELAY_SERVICE_UUID};
use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::error::ConnectionError;

/// Link phase tracked by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Connecting,
    Connected,
}

/// Result of a non-mutating health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub service_present: bool,
    pub characteristic_present: bool,
    pub writable: bool,
}

impl ConnectionHealth {
    pub fn is_healthy(&self) -> bool {
        self.connected && self.service_present && self.characteristic_present && self.writable
    }
}

struct Link {
    phase: LinkPhase,
    mtu: usize,
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

impl Link {
    fn idle() -> Self {
        Self {
            phase: LinkPhase::Idle,
            mtu: 0,
            generation: 0,
            cancel: None,
        }
    }
}

fn map_driver_error(device_id: &DeviceId, err: DriverError) -> ConnectionError {
    match err {
        DriverError::Unavailable(reason) => ConnectionError::DriverUnavailable(reason),
        DriverError::DeviceNotFound(_) => ConnectionError::UnknownDevice(device_id.clone()),
        DriverError::NotConnected(_) => ConnectionError::NotConnected(device_id.clone()),
        DriverError::OperationFailed(reason) => ConnectionError::DriverUnavailable(reason),
    }
}

/// Owns every link to a remote relay peer
pub struct ConnectionManager {
    driver: Arc<dyn BleDriver>,
    registry: DeviceRegistry,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    links: RwLock<HashMap<DeviceId, Link>>,
}

impl ConnectionManager {
    pub fn new(
        driver: Arc<dyn BleDriver>,
        registry: DeviceRegistry,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            driver,
            registry,
            clock,
            config,
            links: RwLock::new(HashMap::new()),
        }
    }

    pub fn phase(&self, device_id: &DeviceId) -> LinkPhase {
        self.links
            .read()
            .get(device_id)
            .map(|l| l.phase)
            .unwrap_or(LinkPhase::Idle)
    }

    /// MTU negotiated for a connected device
    pub fn negotiated_mtu(&self, device_id: &DeviceId) -> Option<usize> {
        self.links
            .read()
            .get(device_id)
            .filter(|l| l.phase == LinkPhase::Connected)
            .map(|l| l.mtu)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .links
            .read()
            .iter()
            .filter(|(_, l)| l.phase == LinkPhase::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Connect, verify the relay service and negotiate the MTU.
    ///
    /// `timeout` bounds each attempt. Returns the negotiated MTU; an already
    /// connected device returns its existing MTU.
    pub async fn connect_to_device(
        &self,
        device_id: &DeviceId,
        timeout: Duration,
    ) -> Result<usize, ConnectionError> {
        let (generation, mut cancelled) = {
            let mut links = self.links.write();
            let link = links.entry(device_id.clone()).or_insert_with(Link::idle);
            match link.phase {
                LinkPhase::Connecting => {
                    return Err(ConnectionError::AlreadyConnecting(device_id.clone()))
                }
                LinkPhase::Connected => return Ok(link.mtu),
                LinkPhase::Idle => {}
            }
            let (tx, rx) = oneshot::channel();
            link.phase = LinkPhase::Connecting;
            link.generation += 1;
            link.cancel = Some(tx);
            (link.generation, rx)
        };
        self.registry
            .set_connection_state(device_id, ConnectionState::Connecting, self.clock.now_ms());

        let result = tokio::select! {
            biased;
            _ = &mut cancelled => Err(ConnectionError::Cancelled(device_id.clone())),
            result = self.connect_with_retry(device_id, timeout) => result,
        };

        match result {
            Ok(mtu) => {
                let still_ours = {
                    let mut links = self.links.write();
                    match links.get_mut(device_id) {
                        Some(link)
                            if link.generation == generation
                                && link.phase == LinkPhase::Connecting =>
                        {
                            link.phase = LinkPhase::Connected;
                            link.mtu = mtu;
                            link.cancel = None;
                            true
                        }
                        _ => false,
                    }
                };
                if !still_ours {
                    // Disconnected while the last await was in flight
                    let _ = self.driver.disconnect(device_id).await;
                    return Err(ConnectionError::Cancelled(device_id.clone()));
                }
                self.registry.set_connection_state(
                    device_id,
                    ConnectionState::Connected,
                    self.clock.now_ms(),
                );
                info!("Connected to {} (MTU {})", device_id, mtu);
                Ok(mtu)
            }
            Err(ConnectionError::Cancelled(_)) => {
                // disconnect_device already reset the link
                let _ = self.driver.disconnect(device_id).await;
                info!("Connection to {} cancelled", device_id);
                Err(ConnectionError::Cancelled(device_id.clone()))
            }
            Err(e) => {
                {
                    let mut links = self.links.write();
                    if let Some(link) = links.get_mut(device_id) {
                        if link.generation == generation {
                            link.phase = LinkPhase::Idle;
                            link.cancel = None;
                        }
                    }
                }
                self.registry.set_connection_state(
                    device_id,
                    ConnectionState::Disconnected,
                    self.clock.now_ms(),
                );
                warn!("Connection to {} failed: {}", device_id, e);
                Err(e)
            }
        }
    }

    async fn connect_with_retry(
        &self,
        device_id: &DeviceId,
        timeout: Duration,
    ) -> Result<usize, ConnectionError> {
        let max_attempts = self.config.connection_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            debug!(
                "Connecting to {} (attempt {}/{})",
                device_id, attempt, max_attempts
            );
            let outcome = match tokio::time::timeout(timeout, self.establish(device_id)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ConnectionError::Timeout {
                    device_id: device_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(mtu) => return Ok(mtu),
                Err(e) => {
                    warn!(
                        "Attempt {}/{} to {} failed: {}",
                        attempt, max_attempts, device_id, e
                    );
                    last_error = e.to_string();
                    let _ = self.driver.disconnect(device_id).await;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.connection_retry_delay()).await;
            }
        }

        Err(ConnectionError::Exhausted {
            device_id: device_id.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// One attempt: link, verify the GATT layout, negotiate the MTU
    async fn establish(&self, device_id: &DeviceId) -> Result<usize, ConnectionError> {
        self.driver
            .connect(device_id)
            .await
            .map_err(|e| map_driver_error(device_id, e))?;

        let health = self.probe(device_id).await?;
        if !health.service_present {
            return Err(ConnectionError::ServiceMissing(device_id.clone()));
        }
        if !health.characteristic_present || !health.writable {
            return Err(ConnectionError::CharacteristicMissing(device_id.clone()));
        }

        self.driver
            .request_mtu(device_id, self.config.mtu)
            .await
            .map_err(|e| map_driver_error(device_id, e))
    }

    async fn probe(&self, device_id: &DeviceId) -> Result<ConnectionHealth, ConnectionError> {
        let services = self
            .driver
            .discover_services(device_id)
            .await
            .map_err(|e| map_driver_error(device_id, e))?;

        let mut health = ConnectionHealth {
            connected: true,
            ..ConnectionHealth::default()
        };
        if let Some(service) = services.iter().find(|s| s.uuid == RELAY_SERVICE_UUID) {
            health.service_present = true;
            if let Some(characteristic) = service
                .characteristics
                .iter()
                .find(|c| c.uuid == RELAY_CHARACTERISTIC_UUID)
            {
                health.characteristic_present = true;
                health.writable = characteristic.properties.write;
            }
        }
        Ok(health)
    }

    /// Tear down a link. Idempotent; always cancels a pending connect.
    pub async fn disconnect_device(&self, device_id: &DeviceId) {
        let (was_connected, cancel) = {
            let mut links = self.links.write();
            match links.get_mut(device_id) {
                Some(link) => {
                    let was_connected = link.phase == LinkPhase::Connected;
                    link.phase = LinkPhase::Idle;
                    (was_connected, link.cancel.take())
                }
                None => return,
            }
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send(());
            debug!("Pending connection to {} cancelled", device_id);
        }
        if was_connected {
            if let Err(e) = self.driver.disconnect(device_id).await {
                warn!("Driver disconnect of {} failed: {}", device_id, e);
            }
            info!("Disconnected from {}", device_id);
        }
        self.registry.set_connection_state(
            device_id,
            ConnectionState::Disconnected,
            self.clock.now_ms(),
        );
    }

    /// Link loss reported by the driver. Returns true if the device was connected.
    pub fn handle_disconnect_event(&self, device_id: &DeviceId) -> bool {
        let (was_connected, cancel) = {
            let mut links = self.links.write();
            match links.get_mut(device_id) {
                Some(link) if link.phase != LinkPhase::Idle => {
                    let was_connected = link.phase == LinkPhase::Connected;
                    link.phase = LinkPhase::Idle;
                    (was_connected, link.cancel.take())
                }
                _ => return false,
            }
        };
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        warn!("Link to {} lost", device_id);
        self.registry.set_connection_state(
            device_id,
            ConnectionState::Disconnected,
            self.clock.now_ms(),
        );
        was_connected
    }

    /// Probe link, service and characteristic without changing any state
    pub async fn check_connection_health(&self, device_id: &DeviceId) -> ConnectionHealth {
        let connected = self.driver.is_connected(device_id).await.unwrap_or(false);
        if !connected {
            return ConnectionHealth::default();
        }
        match tokio::time::timeout(self.config.connection_timeout(), self.probe(device_id)).await {
            Ok(Ok(health)) => health,
            Ok(Err(e)) => {
                debug!("Health probe of {} failed: {}", device_id, e);
                ConnectionHealth {
                    connected: true,
                    ..ConnectionHealth::default()
                }
            }
            Err(_) => ConnectionHealth {
                connected: true,
                ..ConnectionHealth::default()
            },
        }
    }
}
