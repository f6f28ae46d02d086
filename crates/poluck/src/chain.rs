use std::collections::HashSet;

use crate::attestation::{AttestationVerifier, Report};
use crate::error::LuckError;
use crate::store::{self, ObjectStore};
use crate::types::{Block, ChainBlock, LinkName, ObjectRef, Payload};

/// Strict payload check: a parent link and at least one transaction.
///
/// Parent-only payloads are still well-formed; whether they may be mined is the
/// assembler's call.
#[must_use]
pub fn validate_payload(payload: &Payload) -> bool {
    let parents = payload
        .links()
        .iter()
        .filter(|l| l.name == LinkName::Parent)
        .count();
    parents == 1 && payload.links().len() >= 2
}

/// The block's luck must be a `[0, 1)` draw and agree with its report and nonce.
#[allow(clippy::float_cmp)]
fn check_luck(luck: f64, report: &Report) -> Result<(), String> {
    if !(0.0..1.0).contains(&luck) {
        return Err(format!("luck {luck} outside [0, 1)"));
    }
    let nonce = report.decode_nonce().map_err(|e| e.to_string())?;
    if report.luck != luck || nonce.luck != luck {
        return Err(format!(
            "luck {luck} does not match report {} / nonce {}",
            report.luck, nonce.luck
        ));
    }
    Ok(())
}

pub fn valid_block(block: &Block) -> Result<(), LuckError> {
    check_luck(block.luck(), &block.attestation().report).map_err(LuckError::InvalidBlock)
}

/// Walk a chain oldest first, checking linkage, attestations, and that every
/// attestation was mined over the payload that extends the previous block.
pub fn valid_chain(
    chain: &[ChainBlock],
    verifier: &dyn AttestationVerifier,
) -> Result<(), LuckError> {
    let fail = |msg: String| LuckError::ChainValidationFailure(msg);

    match chain.first() {
        Some(first) if *first == ChainBlock::genesis() => {}
        Some(_) => return Err(fail("chain does not start at genesis".into())),
        None => return Err(fail("empty chain".into())),
    }

    let mut expected = ObjectRef::Genesis;
    for (i, block) in chain.iter().enumerate() {
        if block.parent_hash != expected {
            return Err(fail(format!(
                "block {i} extends {}, expected {expected}",
                block.parent_hash
            )));
        }

        if block.is_genesis() {
            if i != 0 {
                return Err(fail(format!("genesis at position {i}")));
            }
            continue;
        }

        let attestation = block
            .attestation
            .as_ref()
            .ok_or_else(|| fail(format!("block {i} has no attestation")))?;
        verifier
            .verify(attestation)
            .map_err(|e| fail(format!("block {i}: {e}")))?;
        check_luck(block.luck, &attestation.report).map_err(|e| fail(format!("block {i}: {e}")))?;

        let mined = attestation
            .report
            .decode_nonce()
            .and_then(|n| n.payload_ref())
            .map_err(|e| fail(format!("block {i}: {e}")))?;
        if mined != block.payload_hash {
            return Err(fail(format!(
                "block {i} was attested over payload {mined}, not {}",
                block.payload_hash
            )));
        }

        expected = block.hash;
    }

    Ok(())
}

#[must_use]
pub fn is_valid_chain(chain: &[ChainBlock], verifier: &dyn AttestationVerifier) -> bool {
    valid_chain(chain, verifier).is_ok()
}

/// Fork-choice weight: the sum of decoded luck over non-genesis blocks at or
/// above `min_luck`.
#[must_use]
pub fn luck(chain: &[ChainBlock], min_luck: f64) -> f64 {
    chain
        .iter()
        .filter(|b| !b.is_genesis())
        .filter_map(|b| b.attestation.as_ref()?.report.decode_nonce().ok())
        .map(|n| n.luck)
        .filter(|l| *l >= min_luck)
        .sum()
}

/// Rebuild the chain ending at `head` by following parent links back to
/// genesis. Any missing or malformed object fails the whole walk.
pub fn chain_of(head: ObjectRef, store: &dyn ObjectStore) -> Result<Vec<ChainBlock>, LuckError> {
    let mut blocks = Vec::new();
    let mut visited = HashSet::new();
    let mut cursor = head;

    while let ObjectRef::Content(hash) = cursor {
        if !visited.insert(hash) {
            return Err(LuckError::ChainValidationFailure(format!(
                "cycle through {hash}"
            )));
        }

        let block: Block = store::get_object(store, &hash)?;
        let payload: Payload = store::get_object(store, &block.payload_hash())?;
        let parent = payload.parent();

        blocks.push(ChainBlock {
            luck: block.luck(),
            attestation: Some(block.attestation().clone()),
            hash: cursor,
            payload_hash: ObjectRef::Content(block.payload_hash()),
            parent_hash: parent,
            transactions: payload.transactions().collect(),
        });
        cursor = parent;
    }

    blocks.push(ChainBlock::genesis());
    blocks.reverse();
    Ok(blocks)
}
