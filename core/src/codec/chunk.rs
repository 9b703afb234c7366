//! Chunk construction and reassembly.
//!
//! A payload of N bytes with a chunk size of S becomes `ceil(N / S)` chunks
//! (one empty chunk for an empty payload). Each chunk carries its session,
//! index, total and a CRC32 over the bytes actually transmitted, so integrity
//! can be checked before any decryption is attempted.

use std::sync::Arc;

use super::SessionId;
use crate::crypto::{ChunkCipher, SharedKey};
use crate::error::{CryptoError, RelayError, TransferError};

/// Upper bound on chunks per payload (index and total must fit in u16 range)
pub const MAX_CHUNKS: u32 = u16::MAX as u32;

/// CRC32 over a chunk's transmitted payload
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// One piece of a payload. Index and total are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    session_id: SessionId,
    index: u32,
    total: u32,
    encrypted: bool,
    payload: Vec<u8>,
    checksum: u32,
}

impl Chunk {
    /// Build a chunk, computing its checksum
    pub fn new(
        session_id: SessionId,
        index: u32,
        total: u32,
        encrypted: bool,
        payload: Vec<u8>,
    ) -> Self {
        let checksum = checksum(&payload);
        Self {
            session_id,
            index,
            total,
            encrypted,
            payload,
            checksum,
        }
    }

    /// Rebuild a chunk decoded from the wire, keeping the transmitted checksum
    pub fn from_parts(
        session_id: SessionId,
        index: u32,
        total: u32,
        encrypted: bool,
        payload: Vec<u8>,
        checksum: u32,
    ) -> Self {
        Self {
            session_id,
            index,
            total,
            encrypted,
            payload,
            checksum,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Whether the carried checksum matches the payload
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

/// Splits payloads into chunks and reassembles them
#[derive(Clone)]
pub struct ChunkCodec {
    chunk_size: usize,
    cipher: Arc<dyn ChunkCipher>,
}

impl ChunkCodec {
    /// `chunk_size` is the plaintext slice per chunk; a zero size is clamped to 1
    pub fn new(chunk_size: usize, cipher: Arc<dyn ChunkCipher>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            cipher,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn cipher(&self) -> &Arc<dyn ChunkCipher> {
        &self.cipher
    }

    /// Number of chunks a payload of `len` bytes splits into
    pub fn chunk_count(&self, len: usize) -> usize {
        if len == 0 {
            1
        } else {
            (len + self.chunk_size - 1) / self.chunk_size
        }
    }

    /// Split `payload` into chunks, encrypting each one when a key is given
    pub fn build_chunks(
        &self,
        session_id: SessionId,
        payload: &[u8],
        key: Option<&SharedKey>,
    ) -> Result<Vec<Chunk>, RelayError> {
        let count = self.chunk_count(payload.len());
        if count > MAX_CHUNKS as usize {
            return Err(TransferError::PayloadTooLarge {
                size: payload.len(),
                max_chunks: MAX_CHUNKS,
            }
            .into());
        }
        let total = count as u32;

        let pieces: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(self.chunk_size).collect()
        };

        let mut chunks = Vec::with_capacity(count);
        for (index, piece) in pieces.into_iter().enumerate() {
            let index = index as u32;
            let body = match key {
                Some(key) => self.cipher.encrypt_chunk(key, &session_id, index, piece)?,
                None => piece.to_vec(),
            };
            chunks.push(Chunk::new(session_id, index, total, key.is_some(), body));
        }

        Ok(chunks)
    }

    /// Validate and reassemble a complete chunk set, in any order.
    ///
    /// Checks, in order: one session and one `total` across the set, every
    /// index present exactly once, every checksum, then decryption. When `key`
    /// is given, a chunk not marked encrypted fails authentication.
    pub fn parse_chunks(
        &self,
        chunks: &[Chunk],
        key: Option<&SharedKey>,
    ) -> Result<Vec<u8>, RelayError> {
        let first = chunks
            .first()
            .ok_or_else(|| TransferError::Inconsistent("empty chunk set".to_string()))?;
        let session_id = first.session_id;
        let total = first.total;

        for chunk in chunks {
            if chunk.session_id != session_id {
                return Err(TransferError::Inconsistent(format!(
                    "chunks from sessions {} and {}",
                    session_id, chunk.session_id
                ))
                .into());
            }
            if chunk.total != total {
                return Err(TransferError::Inconsistent(format!(
                    "session {}: chunk {} declares total {}, expected {}",
                    session_id, chunk.index, chunk.total, total
                ))
                .into());
            }
        }
        if total == 0 || total > MAX_CHUNKS {
            return Err(TransferError::Inconsistent(format!(
                "session {}: invalid total {}",
                session_id, total
            ))
            .into());
        }

        let mut slots: Vec<Option<&Chunk>> = vec![None; total as usize];
        for chunk in chunks {
            let slot = slots.get_mut(chunk.index as usize).ok_or_else(|| {
                TransferError::Inconsistent(format!(
                    "session {}: index {} outside total {}",
                    session_id, chunk.index, total
                ))
            })?;
            match *slot {
                None => *slot = Some(chunk),
                Some(existing) if existing == chunk => {}
                Some(_) => {
                    return Err(TransferError::DuplicateChunk {
                        session_id,
                        index: chunk.index,
                    }
                    .into())
                }
            }
        }

        let missing: Vec<u32> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::Incomplete {
                session_id,
                missing,
            }
            .into());
        }

        let ordered: Vec<&Chunk> = slots.into_iter().flatten().collect();
        for chunk in &ordered {
            if !chunk.verify_checksum() {
                return Err(TransferError::ChecksumMismatch {
                    session_id,
                    index: chunk.index,
                }
                .into());
            }
        }

        // With a session key every chunk must authenticate; the flag itself is unprotected
        let mut payload = Vec::with_capacity(ordered.len() * self.chunk_size);
        for chunk in ordered {
            match (key, chunk.encrypted) {
                (Some(key), true) => {
                    let plain =
                        self.cipher
                            .decrypt_chunk(key, &session_id, chunk.index, &chunk.payload)?;
                    payload.extend_from_slice(&plain);
                }
                (Some(_), false) => {
                    return Err(CryptoError::Authentication { index: chunk.index }.into())
                }
                (None, true) => return Err(CryptoError::MissingKey { index: chunk.index }.into()),
                (None, false) => payload.extend_from_slice(&chunk.payload),
            }
        }

        Ok(payload)
    }
}

impl std::fmt::Debug for ChunkCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCodec")
            .field("chunk_size", &self.chunk_size)
            .field("cipher", &self.cipher.name())
            .finish()
    }
}
