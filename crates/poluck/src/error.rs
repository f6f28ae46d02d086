use serde::{Deserialize, Serialize};

use crate::enclave::RoundPhase;
use crate::types::ObjectRef;

/// Errors raised by the enclave, the validator, and the collaborators around them.
///
/// The type is serializable so that failures inside the trusted boundary reach the
/// host with their message intact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum LuckError {
    #[error("{operation} is not allowed while the enclave is {phase}")]
    InvalidState {
        operation: String,
        phase: RoundPhase,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("round has not elapsed, {remaining_ms}ms remaining")]
    RoundNotElapsed { remaining_ms: u64 },
    #[error("monotonic counter mismatch: expected {expected}, got {got}")]
    CounterMismatch { expected: u64, got: u64 },
    #[error("unsupported nonce version {0}")]
    UnsupportedNonceVersion(u8),
    #[error("malformed nonce: {0}")]
    MalformedNonce(String),
    #[error("chain validation failed: {0}")]
    ChainValidationFailure(String),
    #[error("invalid attestation: {0}")]
    InvalidAttestation(String),
    #[error("object {0} not found")]
    NotFound(ObjectRef),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl LuckError {
    pub(crate) fn invalid_state(operation: &str, phase: RoundPhase) -> Self {
        Self::InvalidState {
            operation: operation.to_owned(),
            phase,
        }
    }

    /// Whether the caller may retry the same operation later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RoundNotElapsed { .. } | Self::Storage(_) | Self::Transport(_)
        )
    }
}

impl From<bincode::error::EncodeError> for LuckError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for LuckError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for LuckError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
