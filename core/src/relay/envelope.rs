//! Transaction envelope carried by the relay.
//!
//! The payload is opaque signed-transaction bytes; metadata is display-only.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Display fields shown to the user while a transfer runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub amount: Option<String>,
    pub recipient: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    pub payload: Vec<u8>,
    pub metadata: EnvelopeMetadata,
}

impl TransactionEnvelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: EnvelopeMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EnvelopeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serialize(self).map_err(|e| RelayError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        bincode::deserialize(bytes).map_err(|e| RelayError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_bytes_preserved() {
        let envelope = TransactionEnvelope::new(vec![0xde, 0xad, 0xbe, 0xef]).with_metadata(
            EnvelopeMetadata {
                amount: Some("0.015 BTC".to_string()),
                recipient: Some("bc1qmerchant".to_string()),
                memo: None,
            },
        );
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(TransactionEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            TransactionEnvelope::from_bytes(&[0xff; 3]),
            Err(RelayError::Encoding(_))
        ));
    }
}
