//! Block production, split around the host-side wait.

use crate::attestation::Attestor;
use crate::chain;
use crate::enclave::{RoundStateMachine, Sleep};
use crate::error::LuckError;
use crate::store::{self, ObjectStore};
use crate::types::{Block, ContentHash, ObjectRef, Payload, PriorBlock, PriorPayload};

/// A payload the enclave has mined and is sleeping on.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingCommit {
    pub sleep: Sleep,
    pub parent: ObjectRef,
    pub payload_hash: ContentHash,
    pub transactions: Vec<ContentHash>,
}

/// Load the block at `head` and its payload, or the genesis sentinels.
pub fn load_prior(
    store: &dyn ObjectStore,
    head: ObjectRef,
) -> Result<(PriorBlock, PriorPayload), LuckError> {
    match head {
        ObjectRef::Genesis => Ok((PriorBlock::Genesis, PriorPayload::Genesis)),
        ObjectRef::Content(hash) => {
            let block: Block = store::get_object(store, &hash)?;
            let payload: Payload = store::get_object(store, &block.payload_hash())?;
            Ok((PriorBlock::Block(block), PriorPayload::Payload(payload)))
        }
    }
}

/// Build and store a payload extending `head`, then ask the enclave to mine it.
pub fn begin_commit(
    enclave: &mut dyn RoundStateMachine,
    store: &dyn ObjectStore,
    head: ObjectRef,
    transactions: Vec<ContentHash>,
    allow_empty: bool,
) -> Result<PendingCommit, LuckError> {
    let payload = Payload::new(head, transactions.iter().copied());
    if !allow_empty && !chain::validate_payload(&payload) {
        return Err(LuckError::InvalidPayload(
            "no pending transactions and empty blocks are disabled".into(),
        ));
    }

    let payload_hash = store::put_object(store, &payload)?;
    let (previous_block, previous_payload) = load_prior(store, head)?;
    let sleep = enclave.mine(&payload, &previous_block, &previous_payload)?;

    Ok(PendingCommit {
        sleep,
        parent: head,
        payload_hash,
        transactions,
    })
}

/// Resume the enclave once the wait is over, attest its report, and store the block.
pub fn finish_commit(
    enclave: &mut dyn RoundStateMachine,
    attestor: &Attestor,
    store: &dyn ObjectStore,
    pending: &PendingCommit,
) -> Result<ContentHash, LuckError> {
    let signed = enclave.resume_from_sleep(pending.sleep.token)?;
    let attestation = attestor.attest(&signed)?;

    let block = Block::new(signed.report.luck, attestation, pending.payload_hash);
    chain::valid_block(&block)?;
    store::put_object(store, &block)
}
