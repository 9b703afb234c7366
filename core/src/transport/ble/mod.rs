/// BLE transport
///
/// Protocol-level BLE logic for the relay. Radio access goes through the
/// `BleDriver` trait, implemented by the host platform (or by the in-memory
/// loopback radio in tests and simulations):
///
/// - **driver**: platform trait, GATT identifiers, driver events
/// - **discovery**: timed scanning, advertising, shared device registry
/// - **connection**: per-device connection state machine with retry
/// - **wire**: binary frame format carried over the relay characteristic
/// - **session**: per-transfer bookkeeping
/// - **transfer**: ACK-driven frame delivery and reassembly
/// - **loopback**: in-memory radio with fault injection

pub mod connection;
pub mod discovery;
pub mod driver;
pub mod loopback;
pub mod session;
pub mod transfer;
pub mod wire;

pub use connection::{ConnectionHealth, ConnectionManager, LinkPhase};
pub use discovery::{BleDiscovery, ConnectionState, DeviceRecord, DeviceRegistry, OnDeviceFound};
pub use driver::{
    BleDriver, CharacteristicProperties, DeviceId, DriverError, DriverEvent,
    GattCharacteristicInfo, GattServiceInfo, RELAY_CHARACTERISTIC_UUID, RELAY_SERVICE_UUID,
};
pub use loopback::{LoopbackDriver, LoopbackRadio};
pub use session::{SessionDirection, SessionStatus, TransferSession};
pub use transfer::{
    FrameTransferEngine, InboundOutcome, OutboundTransfer, SessionSecurity, TransferReport,
};
pub use wire::{Frame, FrameType, WireError, DATA_FRAME_OVERHEAD, HANDSHAKE_ACK_INDEX};
