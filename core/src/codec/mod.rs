//! Chunk codec: transport-agnostic split/reassemble of opaque payloads
//!
//! Both transports carry the same [`Chunk`] shape: BLE as binary frames, QR
//! as text pages. Only the outer encoding differs.

pub mod chunk;

pub use chunk::{checksum, Chunk, ChunkCodec, MAX_CHUNKS};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one logical transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse the 32-character hex form produced by `Display`
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::try_parse(value).ok().map(Self)
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display_parse() {
        let id = SessionId::new_random();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(SessionId::parse(&text), Some(id));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_session_id_bytes() {
        let id = SessionId::from_bytes([9u8; 16]);
        assert_eq!(id.as_bytes(), &[9u8; 16]);
        assert!(SessionId::parse("not-a-session").is_none());
    }
}
