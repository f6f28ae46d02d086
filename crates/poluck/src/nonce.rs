//! Fixed-layout nonce carried inside every enclave report.
//!
//! ```text
//! byte 0        version (1)
//! bytes 1..9    luck, little-endian f64 in [0, 1)
//! byte 9        hash length L (<= 54)
//! bytes 10..10+L  hash of the mined payload
//! ```
//! Remaining bytes are zero.

use crate::error::LuckError;
use crate::types::ObjectRef;

pub const NONCE_SIZE: usize = 64;
pub const NONCE_VERSION: u8 = 1;
const HASH_OFFSET: usize = 10;
pub const MAX_HASH_LEN: usize = NONCE_SIZE - HASH_OFFSET;

#[derive(Clone, Debug, PartialEq)]
pub struct Nonce {
    pub version: u8,
    pub luck: f64,
    pub hash: Vec<u8>,
}

impl Nonce {
    /// The payload the nonce was mined over.
    pub fn payload_ref(&self) -> Result<ObjectRef, LuckError> {
        ObjectRef::from_nonce_bytes(&self.hash)
    }
}

pub fn encode(version: u8, luck: f64, hash: &[u8]) -> Result<[u8; NONCE_SIZE], LuckError> {
    let len = u8::try_from(hash.len())
        .ok()
        .filter(|len| usize::from(*len) <= MAX_HASH_LEN)
        .ok_or_else(|| {
            LuckError::MalformedNonce(format!(
                "hash of {} bytes exceeds {MAX_HASH_LEN}",
                hash.len()
            ))
        })?;

    let mut out = [0u8; NONCE_SIZE];
    out[0] = version;
    out[1..9].copy_from_slice(&luck.to_le_bytes());
    out[9] = len;
    out[HASH_OFFSET..HASH_OFFSET + hash.len()].copy_from_slice(hash);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Nonce, LuckError> {
    if bytes.len() != NONCE_SIZE {
        return Err(LuckError::MalformedNonce(format!(
            "expected {NONCE_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[0] != NONCE_VERSION {
        return Err(LuckError::UnsupportedNonceVersion(bytes[0]));
    }

    let mut luck = [0u8; 8];
    luck.copy_from_slice(&bytes[1..9]);

    let len = usize::from(bytes[9]);
    let hash = bytes
        .get(HASH_OFFSET..HASH_OFFSET + len)
        .ok_or_else(|| {
            LuckError::MalformedNonce(format!(
                "declared hash length {len} exceeds {MAX_HASH_LEN}"
            ))
        })?
        .to_vec();

    Ok(Nonce {
        version: bytes[0],
        luck: f64::from_le_bytes(luck),
        hash,
    })
}
