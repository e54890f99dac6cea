//! Utility functions for working with X25519 keys

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
pub use boringtun::x25519::{PublicKey, StaticSecret};
use rand::rngs::OsRng;

/// Length in bytes of every WireGuard key
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("invalid key length {0} (expected 32 bytes)")]
    InvalidLength(usize),
}

/// Generate a random keypair
pub fn keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Decode a base64 rendered key into its raw bytes
pub fn decode(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64
        .decode(s.trim())
        .map_err(|_| KeyError::InvalidBase64)?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// Render raw key bytes the way configuration files carry them
pub fn encode(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}
