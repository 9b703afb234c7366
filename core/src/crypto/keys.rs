// Key agreement: X25519 ECDH + Blake3 KDF
//
// Flow (sender):
// 1. Generate ephemeral X25519 keypair
// 2. ECDH: ephemeral_secret × peer_static_public → shared_secret
// 3. KDF: Blake3::derive_key(shared_secret) → session key
// 4. Announce ephemeral_public in the transfer handshake
//
// Receiver reverses:
// 1. ECDH: local_static_secret × ephemeral_public → shared_secret
// 2. KDF: same derivation → session key

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// KDF context string for deriving chunk keys from ECDH shared secrets.
/// Changing this breaks compatibility with every deployed peer.
const KDF_CONTEXT: &str = "txrelay v1 chunk encryption 2026-03-01";

/// Raw X25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Symmetric key shared by both ends of a transfer. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Wrap raw key bytes (used by hosts that provision keys out of band)
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short non-secret fingerprint for logs
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..4])
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}

/// Single-use key pair for one key exchange
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Raw public key to hand to the peer
    pub fn public_key_raw(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Consume the private half against the peer's public key
    pub fn derive_shared_key(self, peer_public_raw: &[u8]) -> Result<SharedKey, CryptoError> {
        let peer = parse_public_key(peer_public_raw)?;
        finish_agreement(self.secret.diffie_hellman(&peer))
    }
}

/// Long-lived key pair identifying a receiving device
#[derive(Clone)]
pub struct StaticKeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl StaticKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Import from a 64-character hex secret
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(secret_hex.trim())
            .map_err(|e| CryptoError::InvalidPublicKey(format!("secret is not hex: {}", e)))?;
        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::InvalidPublicKey(format!(
                "secret must be 32 bytes, got {}",
                len
            )));
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&bytes);
        bytes.zeroize();
        let pair = Self::from_secret_bytes(raw);
        raw.zeroize();
        Ok(pair)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn public_key_raw(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.to_bytes())
    }

    /// ECDH against a peer's (usually ephemeral) public key
    pub fn derive_shared_key(&self, peer_public_raw: &[u8]) -> Result<SharedKey, CryptoError> {
        let peer = parse_public_key(peer_public_raw)?;
        finish_agreement(self.secret.diffie_hellman(&peer))
    }
}

impl std::fmt::Debug for StaticKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyPair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh ephemeral key pair. Nothing is persisted.
pub fn generate_ephemeral_key_pair() -> EphemeralKeyPair {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    EphemeralKeyPair { secret, public }
}

/// ECDH between an ephemeral private key and a peer's raw public key
pub fn derive_shared_key(
    private: EphemeralKeyPair,
    peer_public_raw: &[u8],
) -> Result<SharedKey, CryptoError> {
    private.derive_shared_key(peer_public_raw)
}

/// Validate the shape of a raw X25519 public key
pub fn parse_public_key(raw: &[u8]) -> Result<X25519PublicKey, CryptoError> {
    let bytes: [u8; PUBLIC_KEY_LEN] = raw.try_into().map_err(|_| {
        CryptoError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LEN,
            raw.len()
        ))
    })?;
    Ok(X25519PublicKey::from(bytes))
}

fn finish_agreement(shared: SharedSecret) -> Result<SharedKey, CryptoError> {
    // Low-order peer points collapse the shared secret to a known value
    if !shared.was_contributory() {
        return Err(CryptoError::KeyDerivation(
            "peer public key is a low-order point".to_string(),
        ));
    }
    Ok(SharedKey(blake3::derive_key(KDF_CONTEXT, shared.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_static_agreement_matches() {
        let receiver = StaticKeyPair::generate();
        let ephemeral = generate_ephemeral_key_pair();
        let ephemeral_public = ephemeral.public_key_raw();

        let sender_key = derive_shared_key(ephemeral, &receiver.public_key_raw())
            .expect("Sender derivation");
        let receiver_key = receiver
            .derive_shared_key(&ephemeral_public)
            .expect("Receiver derivation");

        assert_eq!(sender_key, receiver_key);
    }

    #[test]
    fn test_different_peers_yield_different_keys() {
        let alice = StaticKeyPair::generate();
        let bob = StaticKeyPair::generate();
        let ephemeral = generate_ephemeral_key_pair();
        let public = ephemeral.public_key_raw();

        let alice_key = alice.derive_shared_key(&public).unwrap();
        let bob_key = bob.derive_shared_key(&public).unwrap();

        assert_ne!(alice_key, bob_key);
    }

    #[test]
    fn test_malformed_peer_key_rejected() {
        let ephemeral = generate_ephemeral_key_pair();
        let result = ephemeral.derive_shared_key(&[0u8; 31]);
        assert!(matches!(result, Err(CryptoError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let receiver = StaticKeyPair::generate();
        let result = receiver.derive_shared_key(&[0u8; 32]);
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn test_static_key_hex_roundtrip() {
        let original = StaticKeyPair::generate();
        let restored = StaticKeyPair::from_secret_hex(&original.secret_hex()).unwrap();
        assert_eq!(original.public_key_raw(), restored.public_key_raw());
    }

    #[test]
    fn test_static_key_hex_wrong_length() {
        assert!(StaticKeyPair::from_secret_hex("abcd").is_err());
        assert!(StaticKeyPair::from_secret_hex("zz").is_err());
    }

    #[test]
    fn test_shared_key_debug_is_redacted() {
        let key = SharedKey::from_bytes([7u8; 32]);
        let rendered = format!("{:?}", key);
        assert!(rendered.starts_with("SharedKey("));
        assert!(!rendered.contains("0707"));
    }
}
