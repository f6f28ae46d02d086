use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::error::LuckError;
use crate::types::ContentHash;

/// SHA-256 hash of arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Canonical bincode encoding shared by hashing, storage, and the enclave boundary.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LuckError> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LuckError> {
    let (value, read) =
        bincode::serde::decode_from_slice::<T, _>(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(LuckError::Serialization(format!(
            "{} trailing bytes after object",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Content address of a value: SHA-256 of its canonical encoding.
pub fn content_hash<T: Serialize>(value: &T) -> Result<ContentHash, LuckError> {
    Ok(ContentHash(hash_bytes(&encode(value)?)))
}

/// Measurement that attestation quotes must carry for this build of the enclave.
#[must_use]
pub fn enclave_measurement() -> [u8; 32] {
    hash_bytes(concat!("poluck-enclave/", env!("CARGO_PKG_VERSION")).as_bytes())
}

#[must_use]
pub fn random_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Parse a 32-byte ed25519 secret given as hex.
pub fn signing_key_from_hex(s: &str) -> Result<SigningKey, LuckError> {
    let mut secret = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut secret)
        .map_err(|e| LuckError::InvalidKey(e.to_string()))?;
    Ok(SigningKey::from_bytes(&secret))
}
