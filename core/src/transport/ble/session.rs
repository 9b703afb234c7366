/// Transfer session bookkeeping
///
/// A session lives from the first send (or the first inbound frame for an
/// unknown id) until completion, cancellation or the stale sweep. Chunk
/// storage is keyed by index so replays are idempotent.

use std::collections::HashMap;

use super::driver::DeviceId;
use crate::codec::{Chunk, SessionId};
use crate::crypto::SharedKey;
use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Sending,
    Receiving,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Outbound,
    Inbound,
}

/// Outcome of storing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    Stored,
    /// Identical copy already held (retransmission)
    Duplicate,
}

pub struct TransferSession {
    session_id: SessionId,
    device_id: DeviceId,
    direction: SessionDirection,
    total_chunks: u32,
    chunks: HashMap<u32, Chunk>,
    shared_key: Option<SharedKey>,
    status: SessionStatus,
    acked: u32,
    created_at: u64,
    last_activity_at: u64,
}

impl TransferSession {
    pub fn new_outbound(
        session_id: SessionId,
        device_id: DeviceId,
        total_chunks: u32,
        shared_key: Option<SharedKey>,
        now: u64,
    ) -> Self {
        Self::new(
            session_id,
            device_id,
            SessionDirection::Outbound,
            total_chunks,
            shared_key,
            SessionStatus::Pending,
            now,
        )
    }

    pub fn new_inbound(
        session_id: SessionId,
        device_id: DeviceId,
        total_chunks: u32,
        shared_key: Option<SharedKey>,
        now: u64,
    ) -> Self {
        Self::new(
            session_id,
            device_id,
            SessionDirection::Inbound,
            total_chunks,
            shared_key,
            SessionStatus::Receiving,
            now,
        )
    }

    fn new(
        session_id: SessionId,
        device_id: DeviceId,
        direction: SessionDirection,
        total_chunks: u32,
        shared_key: Option<SharedKey>,
        status: SessionStatus,
        now: u64,
    ) -> Self {
        Self {
            session_id,
            device_id,
            direction,
            total_chunks,
            chunks: HashMap::new(),
            shared_key,
            status,
            acked: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    pub fn shared_key(&self) -> Option<&SharedKey> {
        self.shared_key.as_ref()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_activity_at(&self) -> u64 {
        self.last_activity_at
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity_at = self.last_activity_at.max(now);
    }

    /// Store a chunk received from `sender`. Every accepted chunk refreshes activity.
    ///
    /// Only the owning device may add chunks, and a keyed session only takes
    /// chunks marked encrypted.
    pub fn insert_chunk(
        &mut self,
        sender: &DeviceId,
        chunk: Chunk,
        now: u64,
    ) -> Result<ChunkInsert, TransferError> {
        if *sender != self.device_id {
            return Err(TransferError::ForeignSender {
                session_id: self.session_id,
                owner: self.device_id.clone(),
                sender: sender.clone(),
            });
        }
        if chunk.session_id() != self.session_id {
            return Err(TransferError::Inconsistent(format!(
                "chunk for session {} stored in session {}",
                chunk.session_id(),
                self.session_id
            )));
        }
        if chunk.total() != self.total_chunks {
            return Err(TransferError::Inconsistent(format!(
                "session {}: chunk {} declares total {}, expected {}",
                self.session_id,
                chunk.index(),
                chunk.total(),
                self.total_chunks
            )));
        }
        if chunk.index() >= self.total_chunks {
            return Err(TransferError::Inconsistent(format!(
                "session {}: index {} outside total {}",
                self.session_id,
                chunk.index(),
                self.total_chunks
            )));
        }

        if self.shared_key.is_some() && !chunk.is_encrypted() {
            return Err(TransferError::PlaintextChunk {
                session_id: self.session_id,
                index: chunk.index(),
            });
        }

        let result = match self.chunks.get(&chunk.index()) {
            Some(existing) if *existing == chunk => ChunkInsert::Duplicate,
            Some(_) => {
                return Err(TransferError::DuplicateChunk {
                    session_id: self.session_id,
                    index: chunk.index(),
                })
            }
            None => {
                self.chunks.insert(chunk.index(), chunk);
                ChunkInsert::Stored
            }
        };
        self.touch(now);
        Ok(result)
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// All declared chunks present
    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.received() == self.total_chunks
    }

    /// Chunks ordered by index
    pub fn ordered_chunks(&self) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self.chunks.values().cloned().collect();
        chunks.sort_by_key(|c| c.index());
        chunks
    }

    /// Record an acknowledged data frame (outbound)
    pub fn mark_acked(&mut self, now: u64) {
        self.acked = (self.acked + 1).min(self.total_chunks);
        self.touch(now);
    }

    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// `(completed, total)` for progress reporting
    pub fn progress(&self) -> (u32, u32) {
        match self.direction {
            SessionDirection::Outbound => (self.acked, self.total_chunks),
            SessionDirection::Inbound => (self.received(), self.total_chunks),
        }
    }

    /// Idle for strictly longer than `threshold_ms`
    pub fn is_stale(&self, now: u64, threshold_ms: u64) -> bool {
        now.saturating_sub(self.last_activity_at) > threshold_ms
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("direction", &self.direction)
            .field("status", &self.status)
            .field("progress", &self.progress())
            .field("encrypted", &self.shared_key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> DeviceId {
        DeviceId::from("sender")
    }

    fn inbound(total: u32) -> (SessionId, TransferSession) {
        let session_id = SessionId::new_random();
        (
            session_id,
            TransferSession::new_inbound(session_id, sender(), total, None, 1_000),
        )
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (session_id, mut session) = inbound(2);
        let chunk = Chunk::new(session_id, 0, 2, false, b"ab".to_vec());

        assert_eq!(session.insert_chunk(&sender(), chunk.clone(), 1_100), Ok(ChunkInsert::Stored));
        assert_eq!(session.insert_chunk(&sender(), chunk, 1_200), Ok(ChunkInsert::Duplicate));
        assert_eq!(session.received(), 1);
        assert!(!session.is_complete());
        assert_eq!(session.last_activity_at(), 1_200);
    }

    #[test]
    fn test_conflicting_copy_rejected() {
        let (session_id, mut session) = inbound(2);
        session
            .insert_chunk(&sender(), Chunk::new(session_id, 1, 2, false, b"one".to_vec()), 1_000)
            .unwrap();

        assert_eq!(
            session.insert_chunk(
                &sender(),
                Chunk::new(session_id, 1, 2, false, b"two".to_vec()),
                1_000
            ),
            Err(TransferError::DuplicateChunk {
                session_id,
                index: 1
            })
        );
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let (session_id, mut session) = inbound(2);
        let result =
            session.insert_chunk(&sender(), Chunk::new(session_id, 0, 3, false, vec![]), 1_000);
        assert!(matches!(result, Err(TransferError::Inconsistent(_))));
    }

    #[test]
    fn test_complete_and_ordered() {
        let (session_id, mut session) = inbound(3);
        for index in [2u32, 0, 1] {
            session
                .insert_chunk(
                    &sender(),
                    Chunk::new(session_id, index, 3, false, vec![index as u8]),
                    1_000,
                )
                .unwrap();
        }
        assert!(session.is_complete());
        let indices: Vec<u32> = session.ordered_chunks().iter().map(|c| c.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(session.progress(), (3, 3));
    }

    #[test]
    fn test_keyed_session_rejects_plaintext_chunk() {
        let session_id = SessionId::new_random();
        let mut session = TransferSession::new_inbound(
            session_id,
            sender(),
            2,
            Some(SharedKey::from_bytes([7; 32])),
            0,
        );

        assert_eq!(
            session.insert_chunk(&sender(), Chunk::new(session_id, 0, 2, false, b"EVIL".to_vec()), 0),
            Err(TransferError::PlaintextChunk {
                session_id,
                index: 0
            })
        );
        assert_eq!(
            session.insert_chunk(&sender(), Chunk::new(session_id, 0, 2, true, vec![0; 20]), 0),
            Ok(ChunkInsert::Stored)
        );
    }

    #[test]
    fn test_other_device_cannot_add_chunks() {
        let (session_id, mut session) = inbound(2);
        let intruder = DeviceId::from("intruder");

        assert_eq!(
            session.insert_chunk(&intruder, Chunk::new(session_id, 0, 2, false, vec![1]), 1_000),
            Err(TransferError::ForeignSender {
                session_id,
                owner: sender(),
                sender: intruder,
            })
        );
        assert_eq!(session.received(), 0);
    }

    #[test]
    fn test_staleness_threshold_is_strict() {
        let (_, session) = inbound(1);
        assert!(!session.is_stale(1_000 + 600_000, 600_000));
        assert!(session.is_stale(1_000 + 600_001, 600_000));
    }

    #[test]
    fn test_outbound_progress_counts_acks() {
        let session_id = SessionId::new_random();
        let mut session =
            TransferSession::new_outbound(session_id, "merchant".into(), 2, None, 0);
        assert_eq!(session.status(), SessionStatus::Pending);
        session.mark_acked(5);
        assert_eq!(session.progress(), (1, 2));
        session.mark_acked(6);
        session.mark_acked(7);
        assert_eq!(session.progress(), (2, 2));
    }
}
