// Disconnected transaction relay
#![allow(clippy::empty_line_after_doc_comments)]
//
// Moves a signed transaction from a wallet to a merchant device with no
// network in between: BLE GATT frames when both sides have radios, a
// sequence of QR pages when they don't.

pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod relay;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Chunk, ChunkCodec, SessionId};
pub use config::RelayConfig;
pub use crypto::{SharedKey, StaticKeyPair};
pub use error::{ConnectionError, CryptoError, RelayError, SessionError, TransferError};
pub use relay::{
    EnvelopeCallback, EnvelopeMetadata, PeerIdentityResolver, Progress, ProgressCallback,
    ReceivedEnvelope, RelayStatus, SendOutcome, StaticIdentityResolver, TransactionEnvelope,
    TransactionRelay,
};
pub use transport::ble::{BleDriver, DeviceId, LoopbackDriver, LoopbackRadio};
pub use transport::qr::{build_qr_pages, parse_qr_pages, QrScanCollector};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honouring `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
