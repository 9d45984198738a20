//! WireGuard key handling

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Raw Curve25519 key length
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid base64 key encoding: {0}")]
    Encoding(String),
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// A WireGuard keypair, base64-encoded.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let private = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
        let public = x25519_dalek::PublicKey::from(&private);
        Self {
            private_key: BASE64.encode(private.as_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }

    /// Rebuild a keypair from a stored private key.
    pub fn from_private(private_key: &str) -> Result<Self, KeyError> {
        Ok(Self {
            private_key: private_key.to_string(),
            public_key: derive_public(private_key)?,
        })
    }
}

/// Decode a base64 key, enforcing the 32-byte length.
pub fn decode_key(key: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64
        .decode(key.trim())
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::Length(len))
}

pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Derive the public key for a base64-encoded private key.
pub fn derive_public(private_key: &str) -> Result<String, KeyError> {
    let secret = x25519_dalek::StaticSecret::from(decode_key(private_key)?);
    let public = x25519_dalek::PublicKey::from(&secret);
    Ok(BASE64.encode(public.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_round_trip() {
        let pair = KeyPair::generate();
        assert_eq!(decode_key(&pair.private_key).unwrap().len(), KEY_LEN);
        assert_eq!(derive_public(&pair.private_key).unwrap(), pair.public_key);
    }

    #[test]
    fn from_private_rederives_public() {
        let pair = KeyPair::generate();
        let rebuilt = KeyPair::from_private(&pair.private_key).unwrap();
        assert_eq!(rebuilt.public_key, pair.public_key);
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(decode_key("not base64!!"), Err(KeyError::Encoding(_))));
        assert!(matches!(
            decode_key(&BASE64.encode([0u8; 16])),
            Err(KeyError::Length(16))
        ));
    }
}
