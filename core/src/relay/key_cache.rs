//! Per-peer key exchange cache.
//!
//! One record per peer. A record is reused until `expires_at`; after that the
//! next send performs a fresh exchange and the old record is replaced whole.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::identity::PeerIdentityResolver;
use crate::clock::Clock;
use crate::crypto::{generate_ephemeral_key_pair, SharedKey, PUBLIC_KEY_LEN};
use crate::error::RelayError;
use crate::transport::ble::DeviceId;

#[derive(Debug, Clone)]
pub struct KeyExchangeRecord {
    pub peer_id: DeviceId,
    pub shared_key: SharedKey,
    /// Ephemeral public key announced in each session handshake
    pub local_public: [u8; PUBLIC_KEY_LEN],
    pub expires_at: u64,
}

impl KeyExchangeRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

pub struct KeyExchangeCache {
    records: RwLock<HashMap<DeviceId, KeyExchangeRecord>>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
    derivations: AtomicU64,
}

impl KeyExchangeCache {
    pub fn new(ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl_ms,
            clock,
            derivations: AtomicU64::new(0),
        }
    }

    /// Unexpired record for `peer`
    pub fn get(&self, peer: &DeviceId) -> Option<KeyExchangeRecord> {
        let now = self.clock.now_ms();
        self.records
            .read()
            .get(peer)
            .filter(|r| !r.is_expired(now))
            .cloned()
    }

    fn new_record(
        &self,
        peer: &DeviceId,
        shared_key: SharedKey,
        local_public: [u8; PUBLIC_KEY_LEN],
    ) -> KeyExchangeRecord {
        KeyExchangeRecord {
            peer_id: peer.clone(),
            shared_key,
            local_public,
            expires_at: self.clock.now_ms().saturating_add(self.ttl_ms),
        }
    }

    /// Store a fresh record, replacing any previous one
    pub fn insert(
        &self,
        peer: &DeviceId,
        shared_key: SharedKey,
        local_public: [u8; PUBLIC_KEY_LEN],
    ) -> KeyExchangeRecord {
        let record = self.new_record(peer, shared_key, local_public);
        self.records.write().insert(peer.clone(), record.clone());
        record
    }

    /// Cached record, or a new exchange against the resolved peer key
    pub async fn resolve_or_derive(
        &self,
        peer: &DeviceId,
        resolver: &dyn PeerIdentityResolver,
    ) -> Result<KeyExchangeRecord, RelayError> {
        if let Some(record) = self.get(peer) {
            debug!("Reusing key {} for {}", record.shared_key.fingerprint(), peer);
            return Ok(record);
        }

        let peer_public = resolver
            .resolve(peer)
            .await
            .ok_or_else(|| RelayError::PeerKeyNotFound(peer.clone()))?;

        let ephemeral = generate_ephemeral_key_pair();
        let local_public = ephemeral.public_key_raw();
        let shared_key = ephemeral.derive_shared_key(&peer_public)?;

        // A concurrent send may have stored a record while we were resolving
        let mut records = self.records.write();
        let now = self.clock.now_ms();
        if let Some(existing) = records.get(peer).filter(|r| !r.is_expired(now)) {
            debug!("Key for {} stored concurrently, discarding ours", peer);
            return Ok(existing.clone());
        }
        let record = self.new_record(peer, shared_key, local_public);
        records.insert(peer.clone(), record.clone());
        drop(records);

        self.derivations.fetch_add(1, Ordering::SeqCst);
        info!("Key exchange with {} ({})", peer, record.shared_key.fingerprint());
        Ok(record)
    }

    pub fn invalidate(&self, peer: &DeviceId) -> bool {
        self.records.write().remove(peer).is_some()
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        before - records.len()
    }

    /// Unexpired records
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.records
            .read()
            .values()
            .filter(|r| !r.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key derivations performed since creation
    pub fn derivations(&self) -> u64 {
        self.derivations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::StaticKeyPair;
    use crate::relay::identity::MockPeerIdentityResolver;

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = KeyExchangeCache::new(1_000, clock.clone());
        let merchant = StaticKeyPair::generate().public_key_raw();

        let mut resolver = MockPeerIdentityResolver::new();
        resolver
            .expect_resolve()
            .times(2)
            .returning(move |_| Some(merchant));

        let peer = DeviceId::from("merchant");
        let first = cache.resolve_or_derive(&peer, &resolver).await.unwrap();
        clock.advance_ms(999);
        let second = cache.resolve_or_derive(&peer, &resolver).await.unwrap();
        assert_eq!(first.shared_key, second.shared_key);
        assert_eq!(cache.derivations(), 1);

        clock.advance_ms(1);
        let third = cache.resolve_or_derive(&peer, &resolver).await.unwrap();
        assert_ne!(first.shared_key, third.shared_key);
        assert_eq!(cache.derivations(), 2);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let cache = KeyExchangeCache::new(1_000, Arc::new(ManualClock::new(0)));
        let mut resolver = MockPeerIdentityResolver::new();
        resolver.expect_resolve().returning(|_| None);

        let peer = DeviceId::from("stranger");
        assert_eq!(
            cache.resolve_or_derive(&peer, &resolver).await.unwrap_err(),
            RelayError::PeerKeyNotFound(peer)
        );
        assert_eq!(cache.derivations(), 0);
    }

    /// Holds every caller inside `resolve` until `callers` of them have arrived
    struct RendezvousResolver {
        barrier: tokio::sync::Barrier,
        public_key: [u8; PUBLIC_KEY_LEN],
    }

    #[async_trait::async_trait]
    impl PeerIdentityResolver for RendezvousResolver {
        async fn resolve(&self, _peer: &DeviceId) -> Option<[u8; PUBLIC_KEY_LEN]> {
            self.barrier.wait().await;
            Some(self.public_key)
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_record() {
        let cache = KeyExchangeCache::new(1_000, Arc::new(ManualClock::new(0)));
        let resolver = RendezvousResolver {
            barrier: tokio::sync::Barrier::new(2),
            public_key: StaticKeyPair::generate().public_key_raw(),
        };
        let peer = DeviceId::from("merchant");

        let (a, b) = tokio::join!(
            cache.resolve_or_derive(&peer, &resolver),
            cache.resolve_or_derive(&peer, &resolver)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.shared_key, b.shared_key);
        assert_eq!(a.local_public, b.local_public);
        assert_eq!(cache.derivations(), 1);
        assert_eq!(cache.get(&peer).unwrap().shared_key, a.shared_key);
    }

    #[test]
    fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = KeyExchangeCache::new(100, clock.clone());
        cache.insert(&"a".into(), SharedKey::from_bytes([1; 32]), [0; 32]);
        clock.advance_ms(50);
        cache.insert(&"b".into(), SharedKey::from_bytes([2; 32]), [0; 32]);
        clock.advance_ms(60);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get(&"b".into()).is_some());
        assert!(cache.invalidate(&"b".into()));
        assert!(cache.is_empty());
    }
}
