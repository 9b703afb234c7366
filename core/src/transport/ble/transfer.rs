/// BLE frame transfer engine
///
/// Sender (central): handshake (encrypted sessions only), then data frames one
/// at a time, each acknowledged before the next goes out. A frame whose ACK
/// does not arrive in time is retransmitted up to `frame_max_attempts` times.
/// After the final ACK the sender waits briefly for the receiver's receipt.
///
/// Receiver (peripheral): stores chunks idempotently, ACKs every data frame
/// (duplicates included), reassembles once the declared total is present and
/// surfaces the payload, or the failure, exactly once. Only the device that
/// opened a session may add to it or cancel it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::ConnectionManager;
use super::driver::{
    BleDriver, DeviceId, DriverEvent, RELAY_CHARACTERISTIC_UUID, RELAY_SERVICE_UUID,
};
use super::session::{ChunkInsert, SessionStatus, TransferSession};
use super::wire::{Frame, DATA_FRAME_OVERHEAD, HANDSHAKE_ACK_INDEX};
use crate::clock::Clock;
use crate::codec::{Chunk, ChunkCodec, SessionId, MAX_CHUNKS};
use crate::config::RelayConfig;
use crate::crypto::{ChunkCipher, SharedKey, StaticKeyPair, PUBLIC_KEY_LEN};
use crate::error::{ConnectionError, CryptoError, RelayError, SessionError, TransferError};

/// Key material for an encrypted outbound session
pub struct SessionSecurity {
    pub shared_key: SharedKey,
    /// Ephemeral public key the receiver combines with its static key
    pub local_public: [u8; PUBLIC_KEY_LEN],
}

/// Summary of a completed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub session_id: SessionId,
    pub frames_sent: u32,
    pub retransmissions: u32,
    /// Receiver returned a receipt matching the payload digest
    pub peer_confirmed: bool,
}

/// What a receiver surfaces for each inbound session, exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Delivered {
        session_id: SessionId,
        device_id: DeviceId,
        payload: Vec<u8>,
    },
    Failed {
        session_id: SessionId,
        device_id: DeviceId,
        reason: String,
    },
}

impl InboundOutcome {
    pub fn session_id(&self) -> SessionId {
        match self {
            InboundOutcome::Delivered { session_id, .. }
            | InboundOutcome::Failed { session_id, .. } => *session_id,
        }
    }
}

/// Frames of one outbound session, encoded and ready to deliver
pub struct OutboundTransfer {
    session_id: SessionId,
    device_id: DeviceId,
    frames: Vec<(u32, Vec<u8>)>,
    digest: [u8; 32],
}

impl OutboundTransfer {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Frames including the handshake, if any
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckSignal {
    Acked,
    Cancelled,
    Expired,
}

type AckKey = (SessionId, u32);

enum InboundStep {
    Ack,
    Complete(TransferSession),
    Reject(TransferError),
    /// Frame dropped unanswered; the session is left alone
    Ignore(TransferError),
}

pub struct FrameTransferEngine {
    driver: Arc<dyn BleDriver>,
    connections: Arc<ConnectionManager>,
    cipher: Arc<dyn ChunkCipher>,
    identity: Option<StaticKeyPair>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    outbound: RwLock<HashMap<SessionId, TransferSession>>,
    inbound: RwLock<HashMap<SessionId, TransferSession>>,
    /// Finished inbound sessions -> finish time; late frames are ACKed, never redelivered
    finished: RwLock<HashMap<SessionId, u64>>,
    ack_waiters: Mutex<HashMap<AckKey, oneshot::Sender<AckSignal>>>,
    receipt_waiters: Mutex<HashMap<SessionId, oneshot::Sender<[u8; 32]>>>,
    /// Refuse inbound sessions that skip the key handshake
    require_handshake: bool,
    /// Outcome channel of the inbound pump, for failures raised by the sweeper
    outcomes: Mutex<Option<mpsc::UnboundedSender<InboundOutcome>>>,
}

impl FrameTransferEngine {
    /// `identity` is the static key used to answer handshakes; senders may pass None
    pub fn new(
        driver: Arc<dyn BleDriver>,
        connections: Arc<ConnectionManager>,
        cipher: Arc<dyn ChunkCipher>,
        identity: Option<StaticKeyPair>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            driver,
            connections,
            cipher,
            identity,
            clock,
            config,
            outbound: RwLock::new(HashMap::new()),
            inbound: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            ack_waiters: Mutex::new(HashMap::new()),
            receipt_waiters: Mutex::new(HashMap::new()),
            require_handshake: false,
            outcomes: Mutex::new(None),
        }
    }

    /// Only accept inbound sessions opened by a handshake, so every payload
    /// this engine surfaces was encrypted under a derived key
    pub fn with_handshake_required(mut self, required: bool) -> Self {
        self.require_handshake = required;
        self
    }

    pub fn requires_handshake(&self) -> bool {
        self.require_handshake
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn active_sessions(&self) -> usize {
        self.outbound.read().len() + self.inbound.read().len()
    }

    /// `(completed, total)` for a live session
    pub fn progress(&self, session_id: &SessionId) -> Option<(u32, u32)> {
        if let Some(session) = self.outbound.read().get(session_id) {
            return Some(session.progress());
        }
        self.inbound.read().get(session_id).map(|s| s.progress())
    }

    pub fn session_status(&self, session_id: &SessionId) -> Option<SessionStatus> {
        if let Some(session) = self.outbound.read().get(session_id) {
            return Some(session.status());
        }
        self.inbound.read().get(session_id).map(|s| s.status())
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// Chunk, encrypt and encode `payload` for `device_id`, registering the
    /// outbound session. Nothing is transmitted until [`Self::deliver`].
    pub fn prepare_send(
        &self,
        device_id: &DeviceId,
        payload: &[u8],
        security: Option<SessionSecurity>,
    ) -> Result<OutboundTransfer, RelayError> {
        let mtu = self
            .connections
            .negotiated_mtu(device_id)
            .ok_or_else(|| ConnectionError::NotConnected(device_id.clone()))?;

        let tag = if security.is_some() {
            self.cipher.overhead()
        } else {
            0
        };
        let budget = mtu.saturating_sub(DATA_FRAME_OVERHEAD + tag);
        if budget == 0 {
            return Err(TransferError::FrameTooLarge {
                size: DATA_FRAME_OVERHEAD + tag + 1,
                mtu,
            }
            .into());
        }
        let codec = ChunkCodec::new(self.config.frame_payload_size.min(budget), self.cipher.clone());

        let session_id = SessionId::new_random();
        let chunks = codec.build_chunks(
            session_id,
            payload,
            security.as_ref().map(|s| &s.shared_key),
        )?;
        let total = chunks.len() as u32;

        let mut frames = Vec::with_capacity(chunks.len() + 1);
        if let Some(security) = &security {
            let handshake = Frame::Handshake {
                session_id,
                total,
                sender_public: security.local_public,
            };
            frames.push((HANDSHAKE_ACK_INDEX, handshake.encode()?));
        }
        for chunk in chunks {
            let index = chunk.index();
            frames.push((index, Frame::Data(chunk).encode()?));
        }
        if let Some((_, oversized)) = frames.iter().find(|(_, bytes)| bytes.len() > mtu) {
            return Err(TransferError::FrameTooLarge {
                size: oversized.len(),
                mtu,
            }
            .into());
        }

        let session = TransferSession::new_outbound(
            session_id,
            device_id.clone(),
            total,
            security.map(|s| s.shared_key),
            self.clock.now_ms(),
        );
        self.outbound.write().insert(session_id, session);
        debug!(
            "Prepared session {} for {}: {} bytes in {} frames",
            session_id.short(),
            device_id,
            payload.len(),
            frames.len()
        );

        Ok(OutboundTransfer {
            session_id,
            device_id: device_id.clone(),
            frames,
            digest: *blake3::hash(payload).as_bytes(),
        })
    }

    /// Transmit a prepared session frame by frame
    pub async fn deliver(&self, transfer: OutboundTransfer) -> Result<TransferReport, RelayError> {
        let OutboundTransfer {
            session_id,
            device_id,
            frames,
            digest,
        } = transfer;

        // Registered up front: the receipt may arrive right behind the last ACK
        let (receipt_tx, receipt_rx) = oneshot::channel();
        self.receipt_waiters.lock().insert(session_id, receipt_tx);
        if let Some(session) = self.outbound.write().get_mut(&session_id) {
            if session.status() == SessionStatus::Pending {
                session.set_status(SessionStatus::Sending);
            }
        }

        let result = self.send_frames(session_id, &device_id, &frames).await;

        match result {
            Ok(retransmissions) => {
                let peer_confirmed =
                    match tokio::time::timeout(self.config.receipt_timeout(), receipt_rx).await {
                        Ok(Ok(received)) if received == digest => true,
                        Ok(Ok(_)) => {
                            warn!("Session {}: receipt digest mismatch", session_id.short());
                            false
                        }
                        Ok(Err(_)) => false,
                        Err(_) => {
                            debug!("Session {}: no receipt", session_id.short());
                            false
                        }
                    };
                self.receipt_waiters.lock().remove(&session_id);
                self.finish_outbound(session_id, SessionStatus::Complete);
                info!(
                    "Session {} delivered to {} ({} frames, {} retransmissions, confirmed: {})",
                    session_id.short(),
                    device_id,
                    frames.len(),
                    retransmissions,
                    peer_confirmed
                );
                Ok(TransferReport {
                    session_id,
                    frames_sent: frames.len() as u32,
                    retransmissions,
                    peer_confirmed,
                })
            }
            Err(e) => {
                self.receipt_waiters.lock().remove(&session_id);
                let status = if matches!(e, RelayError::Transfer(TransferError::Cancelled(_))) {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::Failed
                };
                self.finish_outbound(session_id, status);
                warn!("Session {} to {} failed: {}", session_id.short(), device_id, e);
                Err(e)
            }
        }
    }

    /// Prepare and deliver in one step
    pub async fn send_payload(
        &self,
        device_id: &DeviceId,
        payload: &[u8],
        security: Option<SessionSecurity>,
    ) -> Result<TransferReport, RelayError> {
        let transfer = self.prepare_send(device_id, payload, security)?;
        self.deliver(transfer).await
    }

    async fn send_frames(
        &self,
        session_id: SessionId,
        device_id: &DeviceId,
        frames: &[(u32, Vec<u8>)],
    ) -> Result<u32, RelayError> {
        let mut retransmissions = 0;
        for (index, bytes) in frames {
            let attempts = self
                .send_frame_reliably(session_id, device_id, *index, bytes)
                .await?;
            retransmissions += attempts - 1;
            if *index != HANDSHAKE_ACK_INDEX {
                if let Some(session) = self.outbound.write().get_mut(&session_id) {
                    session.mark_acked(self.clock.now_ms());
                }
            }
        }
        Ok(retransmissions)
    }

    /// Write one frame until it is ACKed. Returns the attempts used.
    async fn send_frame_reliably(
        &self,
        session_id: SessionId,
        device_id: &DeviceId,
        index: u32,
        bytes: &[u8],
    ) -> Result<u32, RelayError> {
        let max_attempts = self.config.frame_max_attempts.max(1);
        let key = (session_id, index);

        for attempt in 1..=max_attempts {
            self.check_outbound_live(session_id)?;

            let (tx, rx) = oneshot::channel();
            self.ack_waiters.lock().insert(key, tx);

            if let Err(e) = self
                .driver
                .write_with_response(
                    device_id,
                    RELAY_SERVICE_UUID,
                    RELAY_CHARACTERISTIC_UUID,
                    bytes,
                )
                .await
            {
                self.ack_waiters.lock().remove(&key);
                warn!(
                    "Session {}: write of frame {} failed (attempt {}/{}): {}",
                    session_id.short(),
                    index,
                    attempt,
                    max_attempts,
                    e
                );
                continue;
            }

            match tokio::time::timeout(self.config.ack_timeout(), rx).await {
                Ok(Ok(AckSignal::Acked)) => return Ok(attempt),
                Ok(Ok(AckSignal::Expired)) => {
                    return Err(SessionError::Expired(session_id).into())
                }
                Ok(Ok(AckSignal::Cancelled)) | Ok(Err(_)) => {
                    return Err(TransferError::Cancelled(session_id).into())
                }
                Err(_) => {
                    self.ack_waiters.lock().remove(&key);
                    warn!(
                        "Session {}: no ACK for frame {} (attempt {}/{})",
                        session_id.short(),
                        index,
                        attempt,
                        max_attempts
                    );
                }
            }
        }

        Err(TransferError::FrameDeliveryFailed {
            session_id,
            index,
            attempts: max_attempts,
        }
        .into())
    }

    fn check_outbound_live(&self, session_id: SessionId) -> Result<(), RelayError> {
        match self.outbound.read().get(&session_id).map(|s| s.status()) {
            Some(SessionStatus::Failed) => Err(SessionError::Expired(session_id).into()),
            Some(SessionStatus::Cancelled) | None => {
                Err(TransferError::Cancelled(session_id).into())
            }
            Some(_) => Ok(()),
        }
    }

    fn finish_outbound(&self, session_id: SessionId, status: SessionStatus) {
        if let Some(mut session) = self.outbound.write().remove(&session_id) {
            session.set_status(status);
            debug!("Session {} closed as {:?}", session_id.short(), status);
        }
    }

    fn reject_waiters(&self, session_id: SessionId, signal: AckSignal) -> usize {
        let mut waiters = self.ack_waiters.lock();
        let keys: Vec<AckKey> = waiters
            .keys()
            .filter(|(id, _)| *id == session_id)
            .copied()
            .collect();
        for key in &keys {
            if let Some(tx) = waiters.remove(key) {
                let _ = tx.send(signal);
            }
        }
        drop(waiters);
        self.receipt_waiters.lock().remove(&session_id);
        keys.len()
    }

    // ========================================================================
    // RECEIVING
    // ========================================================================

    /// Process one frame from `device_id`. Returns an outcome when an inbound
    /// session finishes.
    pub async fn handle_inbound(&self, device_id: &DeviceId, data: &[u8]) -> Option<InboundOutcome> {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", device_id, e);
                return None;
            }
        };

        match frame {
            Frame::Ack { session_id, index } => {
                match self.ack_waiters.lock().remove(&(session_id, index)) {
                    Some(tx) => {
                        let _ = tx.send(AckSignal::Acked);
                    }
                    None => debug!(
                        "Late ACK for frame {} of session {}",
                        index,
                        session_id.short()
                    ),
                }
                None
            }
            Frame::Receipt { session_id, digest } => {
                if let Some(tx) = self.receipt_waiters.lock().remove(&session_id) {
                    let _ = tx.send(digest);
                }
                None
            }
            Frame::Cancel { session_id } => self.on_peer_cancel(device_id, session_id),
            Frame::Handshake {
                session_id,
                total,
                sender_public,
            } => {
                self.on_handshake(device_id, session_id, total, sender_public)
                    .await
            }
            Frame::Data(chunk) => self.on_data(device_id, chunk).await,
        }
    }

    fn on_peer_cancel(&self, device_id: &DeviceId, session_id: SessionId) -> Option<InboundOutcome> {
        let outbound = {
            let mut outbound = self.outbound.write();
            match outbound.get_mut(&session_id) {
                Some(session) if session.device_id() == device_id => {
                    session.set_status(SessionStatus::Cancelled);
                    Some(true)
                }
                Some(_) => Some(false),
                None => None,
            }
        };
        match outbound {
            Some(true) => {
                info!("Session {} cancelled by {}", session_id.short(), device_id);
                self.reject_waiters(session_id, AckSignal::Cancelled);
                return None;
            }
            Some(false) => {
                warn!("Ignoring cancel of session {} from {}", session_id.short(), device_id);
                return None;
            }
            None => {}
        }

        let removed = {
            let mut inbound = self.inbound.write();
            match inbound.get(&session_id) {
                Some(session) if session.device_id() == device_id => inbound.remove(&session_id),
                Some(_) => {
                    warn!("Ignoring cancel of session {} from {}", session_id.short(), device_id);
                    None
                }
                None => None,
            }
        };
        removed.map(|_| {
            self.mark_finished(session_id);
            info!("Inbound session {} cancelled by {}", session_id.short(), device_id);
            InboundOutcome::Failed {
                session_id,
                device_id: device_id.clone(),
                reason: TransferError::Cancelled(session_id).to_string(),
            }
        })
    }

    async fn on_handshake(
        &self,
        device_id: &DeviceId,
        session_id: SessionId,
        total: u32,
        sender_public: [u8; PUBLIC_KEY_LEN],
    ) -> Option<InboundOutcome> {
        let known =
            self.is_finished(&session_id) || self.inbound.read().contains_key(&session_id);
        if known {
            self.notify_peer(device_id, Frame::Ack { session_id, index: HANDSHAKE_ACK_INDEX })
                .await;
            return None;
        }

        let key = if total == 0 || total > MAX_CHUNKS {
            Err(RelayError::from(TransferError::Inconsistent(format!(
                "handshake declares total {}",
                total
            ))))
        } else {
            match &self.identity {
                Some(identity) => identity
                    .derive_shared_key(&sender_public)
                    .map_err(RelayError::from),
                None => Err(CryptoError::KeyDerivation(
                    "no local identity key for encrypted session".to_string(),
                )
                .into()),
            }
        };

        match key {
            Ok(key) => {
                debug!(
                    "Session {} from {}: key {} for {} chunks",
                    session_id.short(),
                    device_id,
                    key.fingerprint(),
                    total
                );
                let session = TransferSession::new_inbound(
                    session_id,
                    device_id.clone(),
                    total,
                    Some(key),
                    self.clock.now_ms(),
                );
                self.inbound.write().insert(session_id, session);
                self.notify_peer(device_id, Frame::Ack { session_id, index: HANDSHAKE_ACK_INDEX })
                    .await;
                None
            }
            Err(e) => {
                warn!("Rejecting handshake {} from {}: {}", session_id.short(), device_id, e);
                self.mark_finished(session_id);
                self.notify_peer(device_id, Frame::Cancel { session_id }).await;
                Some(InboundOutcome::Failed {
                    session_id,
                    device_id: device_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn on_data(&self, device_id: &DeviceId, chunk: Chunk) -> Option<InboundOutcome> {
        let session_id = chunk.session_id();
        let index = chunk.index();

        if self.is_finished(&session_id) {
            self.notify_peer(device_id, Frame::Ack { session_id, index }).await;
            return None;
        }

        let now = self.clock.now_ms();
        let step = {
            let mut inbound = self.inbound.write();
            if self.require_handshake && !inbound.contains_key(&session_id) {
                InboundStep::Reject(TransferError::HandshakeRequired(session_id))
            } else {
                let inserted = {
                    let session = inbound.entry(session_id).or_insert_with(|| {
                        debug!(
                            "New inbound session {} from {} ({} chunks)",
                            session_id.short(),
                            device_id,
                            chunk.total()
                        );
                        TransferSession::new_inbound(
                            session_id,
                            device_id.clone(),
                            chunk.total(),
                            None,
                            now,
                        )
                    });
                    session
                        .insert_chunk(device_id, chunk, now)
                        .map(|insert| (insert, session.is_complete()))
                };
                match inserted {
                    Ok((ChunkInsert::Stored, true)) => match inbound.remove(&session_id) {
                        Some(session) => InboundStep::Complete(session),
                        None => InboundStep::Ack,
                    },
                    Ok(_) => InboundStep::Ack,
                    Err(e @ TransferError::ForeignSender { .. }) => InboundStep::Ignore(e),
                    Err(e) => {
                        inbound.remove(&session_id);
                        InboundStep::Reject(e)
                    }
                }
            }
        };

        match step {
            InboundStep::Ack => {
                self.notify_peer(device_id, Frame::Ack { session_id, index }).await;
                None
            }
            InboundStep::Complete(session) => {
                self.mark_finished(session_id);
                let codec = ChunkCodec::new(self.config.frame_payload_size, self.cipher.clone());
                match codec.parse_chunks(&session.ordered_chunks(), session.shared_key()) {
                    Ok(payload) => {
                        self.notify_peer(device_id, Frame::Ack { session_id, index }).await;
                        let digest = *blake3::hash(&payload).as_bytes();
                        self.notify_peer(device_id, Frame::Receipt { session_id, digest })
                            .await;
                        info!(
                            "Session {} from {}: received {} bytes",
                            session_id.short(),
                            device_id,
                            payload.len()
                        );
                        Some(InboundOutcome::Delivered {
                            session_id,
                            device_id: device_id.clone(),
                            payload,
                        })
                    }
                    Err(e) => {
                        warn!("Session {} reassembly failed: {}", session_id.short(), e);
                        self.notify_peer(device_id, Frame::Cancel { session_id }).await;
                        Some(InboundOutcome::Failed {
                            session_id,
                            device_id: device_id.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            InboundStep::Ignore(e) => {
                warn!("Dropping chunk {}: {}", index, e);
                None
            }
            InboundStep::Reject(e) => {
                warn!("Session {} rejected chunk {}: {}", session_id.short(), index, e);
                self.mark_finished(session_id);
                self.notify_peer(device_id, Frame::Cancel { session_id }).await;
                Some(InboundOutcome::Failed {
                    session_id,
                    device_id: device_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn is_finished(&self, session_id: &SessionId) -> bool {
        self.finished.read().contains_key(session_id)
    }

    fn mark_finished(&self, session_id: SessionId) {
        self.finished.write().insert(session_id, self.clock.now_ms());
    }

    /// Receiver -> sender control frame (peripheral notification)
    async fn notify_peer(&self, device_id: &DeviceId, frame: Frame) {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {:?} frame: {}", frame.frame_type(), e);
                return;
            }
        };
        if let Err(e) = self
            .driver
            .notify(device_id, RELAY_SERVICE_UUID, RELAY_CHARACTERISTIC_UUID, &bytes)
            .await
        {
            warn!("Notify to {} failed: {}", device_id, e);
        }
    }

    // ========================================================================
    // CANCELLATION & CLEANUP
    // ========================================================================

    /// Cancel a live session and tell the peer
    pub async fn cancel(&self, session_id: &SessionId) -> Result<(), RelayError> {
        let session_id = *session_id;
        let outbound_device = {
            let mut outbound = self.outbound.write();
            outbound.get_mut(&session_id).map(|session| {
                session.set_status(SessionStatus::Cancelled);
                session.device_id().clone()
            })
        };

        if let Some(device_id) = outbound_device {
            self.reject_waiters(session_id, AckSignal::Cancelled);
            let notice = Frame::Cancel { session_id };
            match notice.encode() {
                Ok(bytes) => {
                    if let Err(e) = self
                        .driver
                        .write_with_response(
                            &device_id,
                            RELAY_SERVICE_UUID,
                            RELAY_CHARACTERISTIC_UUID,
                            &bytes,
                        )
                        .await
                    {
                        debug!("Cancel notice to {} not delivered: {}", device_id, e);
                    }
                }
                Err(e) => warn!("Failed to encode cancel frame: {}", e),
            }
            info!("Session {} cancelled", session_id.short());
            return Ok(());
        }

        let removed = self.inbound.write().remove(&session_id);
        match removed {
            Some(session) => {
                self.mark_finished(session_id);
                self.notify_peer(session.device_id(), Frame::Cancel { session_id })
                    .await;
                info!("Inbound session {} cancelled", session_id.short());
                Ok(())
            }
            None => Err(SessionError::Unknown(session_id).into()),
        }
    }

    /// Drop sessions idle past the staleness threshold. Returns how many were swept.
    pub fn sweep_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let threshold = self.config.session_stale_after_ms;
        let mut expired = Vec::new();
        let mut swept = 0;

        {
            let mut outbound = self.outbound.write();
            outbound.retain(|session_id, session| {
                if !session.is_stale(now, threshold) {
                    return true;
                }
                swept += 1;
                if session.status() == SessionStatus::Sending {
                    // The delivering task removes it once its waiter is rejected
                    session.set_status(SessionStatus::Failed);
                    expired.push(*session_id);
                    true
                } else {
                    false
                }
            });
        }
        for session_id in &expired {
            self.reject_waiters(*session_id, AckSignal::Expired);
        }

        let stale_inbound: Vec<TransferSession> = {
            let mut inbound = self.inbound.write();
            let stale: Vec<SessionId> = inbound
                .iter()
                .filter(|(_, session)| session.is_stale(now, threshold))
                .map(|(session_id, _)| *session_id)
                .collect();
            stale
                .iter()
                .filter_map(|session_id| inbound.remove(session_id))
                .collect()
        };
        swept += stale_inbound.len();

        self.finished
            .write()
            .retain(|_, finished_at| now.saturating_sub(*finished_at) <= threshold);

        // Each swept receive still gets its one definitive outcome
        let outcomes = self.outcomes.lock().clone();
        for session in stale_inbound {
            let session_id = session.session_id();
            self.mark_finished(session_id);
            let outcome = InboundOutcome::Failed {
                session_id,
                device_id: session.device_id().clone(),
                reason: SessionError::Expired(session_id).to_string(),
            };
            match &outcomes {
                Some(tx) => {
                    if tx.send(outcome).is_err() {
                        debug!("Inbound outcome receiver dropped");
                    }
                }
                None => debug!("Session {} expired with no outcome listener", session_id.short()),
            }
        }

        if swept > 0 {
            info!("Swept {} stale sessions", swept);
        }
        swept
    }

    /// Run [`Self::sweep_stale`] every `sweep_interval` until the engine is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.upgrade() {
                    Some(engine) => {
                        engine.sweep_stale();
                    }
                    None => break,
                }
            }
        })
    }

    /// Feed driver events into the engine. Finished inbound sessions go to `outcomes`.
    pub fn spawn_inbound_pump(
        self: &Arc<Self>,
        outcomes: mpsc::UnboundedSender<InboundOutcome>,
    ) -> JoinHandle<()> {
        *self.outcomes.lock() = Some(outcomes.clone());
        let mut events = self.driver.subscribe();
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Inbound pump lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match event {
                    DriverEvent::CharacteristicWritten { device_id, data }
                    | DriverEvent::Notification { device_id, data } => {
                        if let Some(outcome) = engine.handle_inbound(&device_id, &data).await {
                            if outcomes.send(outcome).is_err() {
                                debug!("Inbound outcome receiver dropped");
                            }
                        }
                    }
                    DriverEvent::Disconnected { device_id } => {
                        engine.connections.handle_disconnect_event(&device_id);
                    }
                    DriverEvent::Advertisement { .. } => {}
                }
            }
        })
    }
}
