/// In-memory BLE radio
///
/// Several `LoopbackDriver`s attached to one `LoopbackRadio` see each other's
/// advertisements, can connect, write and notify exactly like a platform
/// stack would, without hardware. Fault injection (dropped packets, failing
/// connects, adapter off) makes retry paths testable.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use super::driver::{
    BleDriver, CharacteristicProperties, DeviceId, DriverError, DriverEvent,
    GattCharacteristicInfo, GattServiceInfo,
};
use crate::config::MAX_MTU;

const EVENT_CAPACITY: usize = 1024;
const DEFAULT_RSSI: i16 = -60;

/// Decides whether a packet reaches its destination: `(from, to, bytes) -> deliver`
pub type PacketFilter = Box<dyn FnMut(&DeviceId, &DeviceId, &[u8]) -> bool + Send>;

struct Node {
    name: String,
    rssi: i16,
    mtu: usize,
    available: bool,
    events: broadcast::Sender<DriverEvent>,
    scanning: Option<Uuid>,
    advertising: Option<(Uuid, Uuid)>,
    links: HashSet<DeviceId>,
    fail_connects: u32,
    connect_attempts: u32,
}

#[derive(Default)]
struct RadioState {
    nodes: HashMap<DeviceId, Node>,
    filter: Option<PacketFilter>,
    dropped: u64,
}

impl RadioState {
    fn node(&self, id: &DeviceId) -> Result<&Node, DriverError> {
        self.nodes
            .get(id)
            .ok_or_else(|| DriverError::DeviceNotFound(id.clone()))
    }

    fn node_mut(&mut self, id: &DeviceId) -> Result<&mut Node, DriverError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| DriverError::DeviceNotFound(id.clone()))
    }

    fn ensure_available(&self, id: &DeviceId) -> Result<(), DriverError> {
        if self.node(id)?.available {
            Ok(())
        } else {
            Err(DriverError::Unavailable("adapter powered off".to_string()))
        }
    }

    fn ensure_linked(&self, from: &DeviceId, to: &DeviceId) -> Result<(), DriverError> {
        if self.node(from)?.links.contains(to) {
            Ok(())
        } else {
            Err(DriverError::NotConnected(to.clone()))
        }
    }

    /// Run the packet filter; true when the packet should be delivered
    fn admit(&mut self, from: &DeviceId, to: &DeviceId, data: &[u8]) -> bool {
        let deliver = match self.filter.as_mut() {
            Some(filter) => filter(from, to, data),
            None => true,
        };
        if !deliver {
            self.dropped += 1;
            trace!("Loopback dropped {} bytes {} -> {}", data.len(), from, to);
        }
        deliver
    }
}

/// Shared medium connecting loopback drivers
#[derive(Clone, Default)]
pub struct LoopbackRadio {
    state: Arc<Mutex<RadioState>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new device to the medium
    pub fn attach(&self, id: impl Into<DeviceId>, name: &str) -> LoopbackDriver {
        let id = id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.state.lock().nodes.insert(
            id.clone(),
            Node {
                name: name.to_string(),
                rssi: DEFAULT_RSSI,
                mtu: MAX_MTU,
                available: true,
                events: events.clone(),
                scanning: None,
                advertising: None,
                links: HashSet::new(),
                fail_connects: 0,
                connect_attempts: 0,
            },
        );
        LoopbackDriver {
            id,
            state: self.state.clone(),
            events,
        }
    }

    /// Install a packet filter for writes and notifications.
    ///
    /// The filter runs with the radio locked and must not call back into it.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&DeviceId, &DeviceId, &[u8]) -> bool + Send + 'static,
    {
        self.state.lock().filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        self.state.lock().filter = None;
    }

    /// Packets discarded by the filter so far
    pub fn dropped_packets(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Make the next `count` connection attempts to `device` fail
    pub fn fail_next_connects(&self, device: &DeviceId, count: u32) {
        if let Some(node) = self.state.lock().nodes.get_mut(device) {
            node.fail_connects = count;
        }
    }

    /// Connection attempts made to `device`
    pub fn connect_attempts(&self, device: &DeviceId) -> u32 {
        self.state
            .lock()
            .nodes
            .get(device)
            .map(|n| n.connect_attempts)
            .unwrap_or(0)
    }

    pub fn set_rssi(&self, device: &DeviceId, rssi: i16) {
        if let Some(node) = self.state.lock().nodes.get_mut(device) {
            node.rssi = rssi;
        }
    }

    /// Largest MTU `device` accepts
    pub fn set_mtu(&self, device: &DeviceId, mtu: usize) {
        if let Some(node) = self.state.lock().nodes.get_mut(device) {
            node.mtu = mtu;
        }
    }

    /// Simulate link loss between two devices; both sides are told
    pub fn drop_link(&self, a: &DeviceId, b: &DeviceId) {
        let mut state = self.state.lock();
        let mut notify = Vec::new();
        if let Some(node) = state.nodes.get_mut(a) {
            if node.links.remove(b) {
                notify.push((node.events.clone(), b.clone()));
            }
        }
        if let Some(node) = state.nodes.get_mut(b) {
            if node.links.remove(a) {
                notify.push((node.events.clone(), a.clone()));
            }
        }
        for (events, device_id) in notify {
            let _ = events.send(DriverEvent::Disconnected { device_id });
        }
    }
}

/// One device on a [`LoopbackRadio`]
pub struct LoopbackDriver {
    id: DeviceId,
    state: Arc<Mutex<RadioState>>,
    events: broadcast::Sender<DriverEvent>,
}

impl LoopbackDriver {
    pub fn device_id(&self) -> &DeviceId {
        &self.id
    }

    /// Power the simulated adapter on or off
    pub fn set_available(&self, available: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(&self.id) {
            node.available = available;
        }
    }
}

#[async_trait]
impl BleDriver for LoopbackDriver {
    async fn is_available(&self) -> Result<bool, DriverError> {
        Ok(self.state.lock().node(&self.id)?.available)
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.ensure_available(&self.id)?;
        state.node_mut(&self.id)?.scanning = Some(service);

        for (id, node) in state.nodes.iter() {
            if *id == self.id || !node.available {
                continue;
            }
            if let Some((advertised, _)) = node.advertising {
                if advertised == service {
                    let _ = self.events.send(DriverEvent::Advertisement {
                        device_id: id.clone(),
                        name: Some(node.name.clone()),
                        rssi: node.rssi,
                        service_uuids: vec![advertised],
                    });
                }
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), DriverError> {
        self.state.lock().node_mut(&self.id)?.scanning = None;
        Ok(())
    }

    async fn start_advertising(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.ensure_available(&self.id)?;
        let me = state.node_mut(&self.id)?;
        me.advertising = Some((service, characteristic));
        let advertisement = DriverEvent::Advertisement {
            device_id: self.id.clone(),
            name: Some(me.name.clone()),
            rssi: me.rssi,
            service_uuids: vec![service],
        };

        for (id, node) in state.nodes.iter() {
            if *id != self.id && node.scanning == Some(service) {
                let _ = node.events.send(advertisement.clone());
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), DriverError> {
        self.state.lock().node_mut(&self.id)?.advertising = None;
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.ensure_available(&self.id)?;

        let target = state.node_mut(device)?;
        target.connect_attempts += 1;
        if target.fail_connects > 0 {
            target.fail_connects -= 1;
            return Err(DriverError::OperationFailed(format!(
                "connection to {} refused",
                device
            )));
        }
        if !target.available || target.advertising.is_none() {
            return Err(DriverError::DeviceNotFound(device.clone()));
        }
        target.links.insert(self.id.clone());
        state.node_mut(&self.id)?.links.insert(device.clone());
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let was_linked = state.node_mut(&self.id)?.links.remove(device);
        if let Some(peer) = state.nodes.get_mut(device) {
            if peer.links.remove(&self.id) && was_linked {
                let _ = peer.events.send(DriverEvent::Disconnected {
                    device_id: self.id.clone(),
                });
            }
        }
        Ok(())
    }

    async fn is_connected(&self, device: &DeviceId) -> Result<bool, DriverError> {
        Ok(self.state.lock().node(&self.id)?.links.contains(device))
    }

    async fn discover_services(
        &self,
        device: &DeviceId,
    ) -> Result<Vec<GattServiceInfo>, DriverError> {
        let state = self.state.lock();
        state.ensure_linked(&self.id, device)?;
        let services = match state.node(device)?.advertising {
            Some((service, characteristic)) => vec![GattServiceInfo {
                uuid: service,
                characteristics: vec![GattCharacteristicInfo {
                    uuid: characteristic,
                    properties: CharacteristicProperties {
                        write: true,
                        notify: true,
                    },
                }],
            }],
            None => Vec::new(),
        };
        Ok(services)
    }

    async fn request_mtu(&self, device: &DeviceId, mtu: usize) -> Result<usize, DriverError> {
        let state = self.state.lock();
        state.ensure_linked(&self.id, device)?;
        let local = state.node(&self.id)?.mtu;
        let remote = state.node(device)?.mtu;
        Ok(mtu.min(local).min(remote))
    }

    async fn write_with_response(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.ensure_linked(&self.id, device)?;
        if state.node(device)?.advertising != Some((service, characteristic)) {
            return Err(DriverError::OperationFailed(format!(
                "characteristic {} not hosted by {}",
                characteristic, device
            )));
        }
        if state.admit(&self.id, device, data) {
            let _ = state.node(device)?.events.send(DriverEvent::CharacteristicWritten {
                device_id: self.id.clone(),
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    async fn notify(
        &self,
        device: &DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.ensure_linked(&self.id, device)?;
        if state.admit(&self.id, device, data) {
            let _ = state.node(device)?.events.send(DriverEvent::Notification {
                device_id: self.id.clone(),
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}
