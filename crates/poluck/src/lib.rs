#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

mod assembler;
mod attestation;
mod chain;
mod config;
mod consensus;
pub mod crypto;
mod enclave;
mod error;
mod fork_choice;
pub mod http;
mod mempool;
pub mod node;
pub mod nonce;
mod persist;
mod platform;
mod store;
pub mod transport;
mod types;

pub use assembler::{PendingCommit, begin_commit, finish_commit, load_prior};
pub use attestation::{
    Attestation, AttestationVerifier, Attestor, Quote, Report, SignedReport, TrustedServices,
    sign_report, verify_report,
};
pub use chain::{chain_of, is_valid_chain, luck, valid_block, valid_chain, validate_payload};
pub use config::ConsensusConfig;
pub use consensus::Consensus;
pub use enclave::{
    Boundary, BoundaryClient, DEFAULT_ROUND_TIME, Enclave, EnclaveCall, EnclaveReply,
    ResumeToken, RoundPhase, RoundStateMachine, RoundStatus, Sleep,
};
pub use error::LuckError;
pub use fork_choice::{Adoption, Decision, ForkChoice, Origin};
pub use mempool::Mempool;
pub use persist::{JsonFileState, MemoryState, Snapshot, StateStore};
pub use platform::{ManualPlatform, Platform, SystemPlatform};
pub use store::{FileStore, MemoryStore, ObjectStore, get_object, put_object};
pub use types::{
    Block, ChainBlock, ContentHash, GENESIS, Link, LinkName, ObjectRef, Payload, PriorBlock,
    PriorPayload, Transaction,
};

#[cfg(test)]
mod tests;
