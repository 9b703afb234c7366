//! Transaction relay: the public send/receive surface
//!
//! Composes discovery, connection management, key exchange and the frame
//! transfer engine. A wallet calls `send_envelope`; a merchant enters
//! receiving mode and registers an `on_envelope_received` callback.

pub mod envelope;
pub mod identity;
pub mod key_cache;

pub use envelope::{EnvelopeMetadata, TransactionEnvelope};
pub use identity::{PeerIdentityResolver, StaticIdentityResolver};
pub use key_cache::{KeyExchangeCache, KeyExchangeRecord};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec::SessionId;
use crate::config::RelayConfig;
use crate::crypto::{default_cipher, StaticKeyPair};
use crate::error::RelayError;
use crate::transport::ble::{
    BleDiscovery, BleDriver, ConnectionManager, DeviceId, DeviceRecord, DeviceRegistry,
    FrameTransferEngine, InboundOutcome, OnDeviceFound, OutboundTransfer, SessionSecurity,
    TransferReport,
};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Transfer progress sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
    pub percentage: f64,
}

impl Progress {
    pub fn new(completed: u32, total: u32) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            f64::from(completed) * 100.0 / f64::from(total)
        };
        Self {
            completed,
            total,
            percentage,
        }
    }
}

/// Definitive result of `send_envelope`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    /// Receiver returned a matching receipt
    pub peer_confirmation: bool,
    /// Human readable failure reason
    pub reason: Option<String>,
    pub session_id: Option<SessionId>,
}

impl SendOutcome {
    fn delivered(report: &TransferReport) -> Self {
        Self {
            success: true,
            peer_confirmation: report.peer_confirmed,
            reason: None,
            session_id: Some(report.session_id),
        }
    }

    fn failed(session_id: Option<SessionId>, error: &RelayError) -> Self {
        Self {
            success: false,
            peer_confirmation: false,
            reason: Some(error.to_string()),
            session_id,
        }
    }
}

/// An inbound envelope, or the reason its session failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEnvelope {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub result: Result<TransactionEnvelope, String>,
}

impl ReceivedEnvelope {
    fn from_outcome(outcome: InboundOutcome) -> Self {
        match outcome {
            InboundOutcome::Delivered {
                session_id,
                device_id,
                payload,
            } => Self {
                session_id,
                device_id,
                result: TransactionEnvelope::from_bytes(&payload).map_err(|e| e.to_string()),
            },
            InboundOutcome::Failed {
                session_id,
                device_id,
                reason,
            } => Self {
                session_id,
                device_id,
                result: Err(reason),
            },
        }
    }
}

/// Snapshot for UI and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub scanning: bool,
    pub advertising: bool,
    pub receiving_mode: bool,
    pub discovered_devices: usize,
    pub connected_devices: Vec<DeviceId>,
    pub active_sessions: usize,
    pub cached_keys: usize,
    pub key_derivations: u64,
}

pub type EnvelopeCallback = Arc<dyn Fn(ReceivedEnvelope) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

// ============================================================================
// RELAY
// ============================================================================

pub struct TransactionRelay {
    config: RelayConfig,
    discovery: BleDiscovery,
    connections: Arc<ConnectionManager>,
    engine: Arc<FrameTransferEngine>,
    key_cache: KeyExchangeCache,
    resolver: Arc<dyn PeerIdentityResolver>,
    identity_public: [u8; 32],
    receiving: AtomicBool,
    callbacks: Arc<RwLock<Vec<EnvelopeCallback>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionRelay {
    /// Build a relay around a platform driver. `identity` answers inbound handshakes.
    pub fn new(
        config: RelayConfig,
        driver: Arc<dyn BleDriver>,
        resolver: Arc<dyn PeerIdentityResolver>,
        identity: StaticKeyPair,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let registry = DeviceRegistry::new();
        let discovery = BleDiscovery::new(driver.clone(), registry.clone(), clock.clone());
        let connections = Arc::new(ConnectionManager::new(
            driver.clone(),
            registry,
            clock.clone(),
            config.clone(),
        ));
        let identity_public = identity.public_key_raw();
        // Every send from a relay is encrypted, so plaintext sessions are refused
        let engine = Arc::new(
            FrameTransferEngine::new(
                driver,
                connections.clone(),
                default_cipher(),
                Some(identity),
                clock.clone(),
                config.clone(),
            )
            .with_handshake_required(true),
        );
        let key_cache = KeyExchangeCache::new(config.key_cache_ttl_ms, clock);

        Ok(Self {
            config,
            discovery,
            connections,
            engine,
            key_cache,
            resolver,
            identity_public,
            receiving: AtomicBool::new(false),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the inbound event pump, the callback dispatcher and the stale-session sweeper
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        tasks.push(self.engine.spawn_inbound_pump(tx));
        tasks.push(self.engine.spawn_sweeper());

        let callbacks = self.callbacks.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                let received = ReceivedEnvelope::from_outcome(outcome);
                match &received.result {
                    Ok(_) => info!(
                        "Envelope received from {} (session {})",
                        received.device_id,
                        received.session_id.short()
                    ),
                    Err(reason) => warn!(
                        "Inbound session {} from {} failed: {}",
                        received.session_id.short(),
                        received.device_id,
                        reason
                    ),
                }
                let listeners: Vec<EnvelopeCallback> = callbacks.read().clone();
                for listener in listeners {
                    listener(received.clone());
                }
            }
        }));
        info!("Transaction relay started");
    }

    /// Stop background tasks, scanning, advertising and every link
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.discovery.stop_scanning().await;
        if let Err(e) = self.exit_receiving_mode().await {
            warn!("Failed to stop advertising: {}", e);
        }
        for device_id in self.connections.connected_devices() {
            self.connections.disconnect_device(&device_id).await;
        }
        info!("Transaction relay stopped");
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Public key peers need to encrypt to this device
    pub fn identity_public_key(&self) -> [u8; 32] {
        self.identity_public
    }

    pub fn engine(&self) -> &Arc<FrameTransferEngine> {
        &self.engine
    }

    pub fn key_cache(&self) -> &KeyExchangeCache {
        &self.key_cache
    }

    pub fn discovered_peers(&self) -> Vec<DeviceRecord> {
        self.discovery.registry().all()
    }

    // ------------------------------------------------------------------------
    // Discovery & connection
    // ------------------------------------------------------------------------

    pub async fn scan_for_peers(
        &self,
        on_found: OnDeviceFound,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        self.discovery.start_scanning(on_found, timeout).await?;
        Ok(())
    }

    pub async fn stop_scanning(&self) {
        self.discovery.stop_scanning().await;
    }

    /// Advertise the relay service and accept inbound transfers
    pub async fn enter_receiving_mode(&self) -> Result<(), RelayError> {
        self.discovery.start_advertising().await?;
        if !self.receiving.swap(true, Ordering::SeqCst) {
            info!("Receiving mode on");
        }
        Ok(())
    }

    pub async fn exit_receiving_mode(&self) -> Result<(), RelayError> {
        self.discovery.stop_advertising().await?;
        if self.receiving.swap(false, Ordering::SeqCst) {
            info!("Receiving mode off");
        }
        Ok(())
    }

    /// Connect with the configured timeout. Returns the negotiated MTU.
    pub async fn connect_to_peer(&self, peer_id: &DeviceId) -> Result<usize, RelayError> {
        let mtu = self
            .connections
            .connect_to_device(peer_id, self.config.connection_timeout())
            .await?;
        Ok(mtu)
    }

    pub async fn disconnect_peer(&self, peer_id: &DeviceId) {
        self.connections.disconnect_device(peer_id).await;
    }

    // ------------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------------

    /// Deliver `envelope` to `peer_id`, connecting and exchanging keys as needed
    pub async fn send_envelope(
        &self,
        peer_id: &DeviceId,
        envelope: &TransactionEnvelope,
        on_progress: Option<ProgressCallback>,
    ) -> SendOutcome {
        let transfer = match self.prepare_envelope(peer_id, envelope).await {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!("Send to {} not started: {}", peer_id, e);
                return SendOutcome::failed(None, &e);
            }
        };
        let session_id = transfer.session_id();

        let result = match on_progress {
            Some(on_progress) => self.deliver_with_progress(transfer, on_progress).await,
            None => self.engine.deliver(transfer).await,
        };

        match result {
            Ok(report) => SendOutcome::delivered(&report),
            Err(e) => SendOutcome::failed(Some(session_id), &e),
        }
    }

    async fn prepare_envelope(
        &self,
        peer_id: &DeviceId,
        envelope: &TransactionEnvelope,
    ) -> Result<OutboundTransfer, RelayError> {
        let bytes = envelope.to_bytes()?;
        if self.connections.negotiated_mtu(peer_id).is_none() {
            self.connect_to_peer(peer_id).await?;
        }
        let record = self
            .key_cache
            .resolve_or_derive(peer_id, self.resolver.as_ref())
            .await?;
        self.engine.prepare_send(
            peer_id,
            &bytes,
            Some(SessionSecurity {
                shared_key: record.shared_key,
                local_public: record.local_public,
            }),
        )
    }

    /// Deliver while sampling progress every `progress_interval`
    async fn deliver_with_progress(
        &self,
        transfer: OutboundTransfer,
        on_progress: ProgressCallback,
    ) -> Result<TransferReport, RelayError> {
        let session_id = transfer.session_id();
        let total = self
            .engine
            .progress(&session_id)
            .map(|(_, total)| total)
            .unwrap_or(0);

        let delivery = self.engine.deliver(transfer);
        tokio::pin!(delivery);
        let mut ticker = tokio::time::interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut delivery => {
                    if result.is_ok() {
                        on_progress(Progress::new(total, total));
                    }
                    debug!("Progress sampling for {} stopped", session_id.short());
                    return result;
                }
                _ = ticker.tick() => {
                    if let Some((completed, total)) = self.engine.progress(&session_id) {
                        on_progress(Progress::new(completed, total));
                    }
                }
            }
        }
    }

    pub fn on_envelope_received(&self, callback: EnvelopeCallback) {
        self.callbacks.write().push(callback);
    }

    pub async fn cancel_transfer(&self, session_id: &SessionId) -> Result<(), RelayError> {
        self.engine.cancel(session_id).await
    }

    pub fn get_status(&self) -> RelayStatus {
        RelayStatus {
            scanning: self.discovery.is_scanning(),
            advertising: self.discovery.is_advertising(),
            receiving_mode: self.receiving.load(Ordering::SeqCst),
            discovered_devices: self.discovery.registry().len(),
            connected_devices: self.connections.connected_devices(),
            active_sessions: self.engine.active_sessions(),
            cached_keys: self.key_cache.len(),
            key_derivations: self.key_cache.derivations(),
        }
    }
}

impl Drop for TransactionRelay {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
