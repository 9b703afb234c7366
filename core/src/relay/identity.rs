// Peer identity resolution
//
// Maps a BLE device id to the peer's static X25519 public key. Hosts back this
// with their contact book or a remote lookup.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::crypto::PUBLIC_KEY_LEN;
use crate::transport::ble::DeviceId;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerIdentityResolver: Send + Sync {
    /// Raw public key for `peer`, or None when unknown
    async fn resolve(&self, peer: &DeviceId) -> Option<[u8; PUBLIC_KEY_LEN]>;
}

/// In-memory resolver for configured peers
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    keys: RwLock<HashMap<DeviceId, [u8; PUBLIC_KEY_LEN]>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(self, peer: impl Into<DeviceId>, public_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        self.insert(peer.into(), public_key);
        self
    }

    pub fn insert(&self, peer: DeviceId, public_key: [u8; PUBLIC_KEY_LEN]) {
        self.keys.write().insert(peer, public_key);
    }

    pub fn remove(&self, peer: &DeviceId) -> bool {
        self.keys.write().remove(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl PeerIdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, peer: &DeviceId) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.keys.read().get(peer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticIdentityResolver::new().with_peer("merchant", [7u8; 32]);
        assert_eq!(resolver.resolve(&"merchant".into()).await, Some([7u8; 32]));
        assert_eq!(resolver.resolve(&"stranger".into()).await, None);

        assert!(resolver.remove(&"merchant".into()));
        assert!(resolver.is_empty());
    }
}
