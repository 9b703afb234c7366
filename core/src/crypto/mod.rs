// Transport crypto: key agreement and per-chunk authenticated encryption

pub mod cipher;
pub mod keys;

pub use cipher::{default_cipher, AeadChunkCipher, ChunkCipher, TAG_LEN};
#[cfg(feature = "insecure-dev-crypto")]
pub use cipher::PlaintextChunkCipher;
pub use keys::{
    derive_shared_key, generate_ephemeral_key_pair, parse_public_key, EphemeralKeyPair,
    SharedKey, StaticKeyPair, PUBLIC_KEY_LEN,
};
