// Per-chunk authenticated encryption: ChaCha20-Poly1305
//
// Nonce = Blake3(NONCE_CONTEXT || session_id || index)[..12]
// AAD   = session_id || index
//
// The nonce is a pure function of (session, index) so a retransmitted chunk
// encrypts to exactly the same bytes. Cached keys are reused across sessions,
// which is why the session id is part of the nonce input.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use std::sync::Arc;

use super::keys::SharedKey;
use crate::codec::SessionId;
use crate::error::CryptoError;

/// Poly1305 tag appended to every encrypted chunk
pub const TAG_LEN: usize = 16;

const NONCE_CONTEXT: &[u8] = b"txrelay chunk nonce v1";

/// Capability interface for chunk encryption.
///
/// Exactly one implementation is wired into a codec; see [`default_cipher`].
pub trait ChunkCipher: Send + Sync {
    /// Human readable name for logs and status
    fn name(&self) -> &'static str;

    /// Bytes added to each chunk by encryption
    fn overhead(&self) -> usize;

    fn encrypt_chunk(
        &self,
        key: &SharedKey,
        session_id: &SessionId,
        index: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of `encrypt_chunk`. Never returns partial plaintext.
    fn decrypt_chunk(
        &self,
        key: &SharedKey,
        session_id: &SessionId,
        index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Production cipher
#[derive(Debug, Default, Clone, Copy)]
pub struct AeadChunkCipher;

impl AeadChunkCipher {
    fn nonce_for(session_id: &SessionId, index: u32) -> [u8; 12] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NONCE_CONTEXT);
        hasher.update(session_id.as_bytes());
        hasher.update(&index.to_le_bytes());
        let digest = hasher.finalize();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest.as_bytes()[..12]);
        nonce
    }

    fn aad_for(session_id: &SessionId, index: u32) -> [u8; 20] {
        let mut aad = [0u8; 20];
        aad[..16].copy_from_slice(session_id.as_bytes());
        aad[16..].copy_from_slice(&index.to_le_bytes());
        aad
    }
}

impl ChunkCipher for AeadChunkCipher {
    fn name(&self) -> &'static str {
        "chacha20poly1305"
    }

    fn overhead(&self) -> usize {
        TAG_LEN
    }

    fn encrypt_chunk(
        &self,
        key: &SharedKey,
        session_id: &SessionId,
        index: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = Self::nonce_for(session_id, index);
        let aad = Self::aad_for(session_id, index);
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::Cipher(format!("chunk {} encryption failed: {}", index, e)))
    }

    fn decrypt_chunk(
        &self,
        key: &SharedKey,
        session_id: &SessionId,
        index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Authentication { index });
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = Self::nonce_for(session_id, index);
        let aad = Self::aad_for(session_id, index);
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Authentication { index })
    }
}

/// Development cipher: copies bytes through untouched.
///
/// Provides no confidentiality and no authentication. Only compiled with the
/// `insecure-dev-crypto` feature, for bring-up on hosts without a working
/// AEAD backend.
#[cfg(feature = "insecure-dev-crypto")]
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextChunkCipher;

#[cfg(feature = "insecure-dev-crypto")]
impl ChunkCipher for PlaintextChunkCipher {
    fn name(&self) -> &'static str {
        "plaintext-insecure"
    }

    fn overhead(&self) -> usize {
        0
    }

    fn encrypt_chunk(
        &self,
        _key: &SharedKey,
        _session_id: &SessionId,
        _index: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt_chunk(
        &self,
        _key: &SharedKey,
        _session_id: &SessionId,
        _index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}

/// The cipher selected for this build
#[cfg(not(feature = "insecure-dev-crypto"))]
pub fn default_cipher() -> Arc<dyn ChunkCipher> {
    Arc::new(AeadChunkCipher)
}

/// The cipher selected for this build
#[cfg(feature = "insecure-dev-crypto")]
pub fn default_cipher() -> Arc<dyn ChunkCipher> {
    tracing::warn!("insecure-dev-crypto enabled: chunks travel unencrypted");
    Arc::new(PlaintextChunkCipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SharedKey {
        SharedKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = AeadChunkCipher;
        let session = SessionId::new_random();
        let ciphertext = cipher
            .encrypt_chunk(&key(1), &session, 3, b"signed tx bytes")
            .expect("Encrypt");

        assert_eq!(ciphertext.len(), b"signed tx bytes".len() + TAG_LEN);

        let plaintext = cipher
            .decrypt_chunk(&key(1), &session, 3, &ciphertext)
            .expect("Decrypt");
        assert_eq!(plaintext, b"signed tx bytes");
    }

    #[test]
    fn test_encryption_is_deterministic_per_index() {
        let cipher = AeadChunkCipher;
        let session = SessionId::new_random();

        let first = cipher.encrypt_chunk(&key(2), &session, 7, b"frame").unwrap();
        let second = cipher.encrypt_chunk(&key(2), &session, 7, b"frame").unwrap();
        assert_eq!(first, second);

        let other_index = cipher.encrypt_chunk(&key(2), &session, 8, b"frame").unwrap();
        assert_ne!(first, other_index);

        let other_session = cipher
            .encrypt_chunk(&key(2), &SessionId::new_random(), 7, b"frame")
            .unwrap();
        assert_ne!(first, other_session);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let cipher = AeadChunkCipher;
        let session = SessionId::new_random();
        let ciphertext = cipher.encrypt_chunk(&key(3), &session, 0, b"payload").unwrap();

        let result = cipher.decrypt_chunk(&key(4), &session, 0, &ciphertext);
        assert_eq!(result, Err(CryptoError::Authentication { index: 0 }));
    }

    #[test]
    fn test_index_is_authenticated() {
        let cipher = AeadChunkCipher;
        let session = SessionId::new_random();
        let ciphertext = cipher.encrypt_chunk(&key(5), &session, 1, b"payload").unwrap();

        let result = cipher.decrypt_chunk(&key(5), &session, 2, &ciphertext);
        assert_eq!(result, Err(CryptoError::Authentication { index: 2 }));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = AeadChunkCipher;
        let session = SessionId::new_random();
        let mut ciphertext = cipher.encrypt_chunk(&key(6), &session, 0, b"payload").unwrap();
        ciphertext[0] ^= 0x01;

        assert!(cipher.decrypt_chunk(&key(6), &session, 0, &ciphertext).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let cipher = AeadChunkCipher;
        let session = SessionId::new_random();
        let result = cipher.decrypt_chunk(&key(6), &session, 4, &[0u8; 5]);
        assert_eq!(result, Err(CryptoError::Authentication { index: 4 }));
    }

    #[cfg(not(feature = "insecure-dev-crypto"))]
    #[test]
    fn test_default_cipher_is_aead() {
        assert_eq!(default_cipher().name(), "chacha20poly1305");
        assert_eq!(default_cipher().overhead(), TAG_LEN);
    }

    #[cfg(feature = "insecure-dev-crypto")]
    #[test]
    fn test_plaintext_cipher_passthrough() {
        let cipher = PlaintextChunkCipher;
        let session = SessionId::new_random();
        let out = cipher.encrypt_chunk(&key(0), &session, 0, b"abc").unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(default_cipher().name(), "plaintext-insecure");
    }
}
