//! Error taxonomy shared by every layer of the relay.
//!
//! Each concern has its own enum so callers can match on the failure they
//! care about; [`RelayError`] wraps them all for the orchestrator surface.

use crate::codec::SessionId;
use crate::transport::ble::DeviceId;
use thiserror::Error;

/// Key agreement and chunk cipher failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Chunk {index} failed authentication")]
    Authentication { index: u32 },
    #[error("Chunk {index} is encrypted but no session key is available")]
    MissingKey { index: u32 },
    #[error("Cipher failure: {0}")]
    Cipher(String),
}

/// Connection lifecycle failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("BLE driver unavailable: {0}")]
    DriverUnavailable(String),
    #[error("Device {0} does not expose the relay service")]
    ServiceMissing(DeviceId),
    #[error("Device {0} does not expose a writable relay characteristic")]
    CharacteristicMissing(DeviceId),
    #[error("Connection attempt to {0} already in flight")]
    AlreadyConnecting(DeviceId),
    #[error("Connection to {device_id} timed out after {timeout_ms}ms")]
    Timeout { device_id: DeviceId, timeout_ms: u64 },
    #[error("Connection to {device_id} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        device_id: DeviceId,
        attempts: u32,
        last_error: String,
    },
    #[error("Connection attempt to {0} was cancelled")]
    Cancelled(DeviceId),
    #[error("Device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("Device {0} is unknown")]
    UnknownDevice(DeviceId),
}

/// Chunking, reassembly and frame delivery failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Session {session_id}: frame {index} not acknowledged after {attempts} attempts")]
    FrameDeliveryFailed {
        session_id: SessionId,
        index: u32,
        attempts: u32,
    },
    #[error("Session {session_id}: missing chunks {missing:?}")]
    Incomplete {
        session_id: SessionId,
        missing: Vec<u32>,
    },
    #[error("Inconsistent chunk set: {0}")]
    Inconsistent(String),
    #[error("Session {session_id}: checksum mismatch on chunk {index}")]
    ChecksumMismatch { session_id: SessionId, index: u32 },
    #[error("Session {session_id}: conflicting copies of chunk {index}")]
    DuplicateChunk { session_id: SessionId, index: u32 },
    #[error("Payload of {size} bytes needs more than {max_chunks} chunks")]
    PayloadTooLarge { size: usize, max_chunks: u32 },
    #[error("Frame of {size} bytes exceeds negotiated MTU {mtu}")]
    FrameTooLarge { size: usize, mtu: usize },
    #[error("Session {session_id}: chunk {index} is not encrypted")]
    PlaintextChunk { session_id: SessionId, index: u32 },
    #[error("Session {session_id} belongs to {owner}, frame came from {sender}")]
    ForeignSender {
        session_id: SessionId,
        owner: DeviceId,
        sender: DeviceId,
    },
    #[error("Session {0} was not opened with a handshake")]
    HandshakeRequired(SessionId),
    #[error("Session {0} was cancelled")]
    Cancelled(SessionId),
    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// Session bookkeeping failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unknown session {0}")]
    Unknown(SessionId),
    #[error("Session {0} expired")]
    Expired(SessionId),
}

/// Umbrella error for the public relay API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Wire(#[from] crate::transport::ble::wire::WireError),
    #[error(transparent)]
    Qr(#[from] crate::transport::qr::QrError),
    #[error("Peer {0} has no known public key")]
    PeerKeyNotFound(DeviceId),
    #[error("Envelope encoding failed: {0}")]
    Encoding(String),
}
