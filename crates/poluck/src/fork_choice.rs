use std::collections::HashSet;

use crate::attestation::AttestationVerifier;
use crate::chain;
use crate::error::LuckError;
use crate::store::ObjectStore;
use crate::types::{ChainBlock, ContentHash, ObjectRef};

const SEEN_CAPACITY: usize = 65_536;

/// Where a candidate head came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Peer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Adoption {
    pub previous_head: ObjectRef,
    pub head: ObjectRef,
    pub luck: f64,
    pub height: usize,
    /// Every transaction included anywhere in the adopted chain.
    pub transactions: HashSet<ContentHash>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Already seen, or the current head itself.
    Ignored,
    /// Valid, but not strictly luckier than the current chain.
    Kept { candidate_luck: f64, current_luck: f64 },
    Adopted(Adoption),
}

/// Tracks the canonical chain and decides whether candidate heads replace it.
pub struct ForkChoice {
    chain: Vec<ChainBlock>,
    luck: f64,
    min_luck: f64,
    seen: HashSet<ObjectRef>,
}

impl ForkChoice {
    #[must_use]
    pub fn new(min_luck: f64) -> Self {
        Self {
            chain: vec![ChainBlock::genesis()],
            luck: 0.0,
            min_luck,
            seen: HashSet::new(),
        }
    }

    /// Start from an already validated chain.
    #[must_use]
    pub fn with_chain(chain: Vec<ChainBlock>, min_luck: f64) -> Self {
        let luck = chain::luck(&chain, min_luck);
        Self {
            chain,
            luck,
            min_luck,
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub fn head(&self) -> ObjectRef {
        self.chain.last().map_or(ObjectRef::Genesis, |b| b.hash)
    }

    /// The block the head extends; `None` while the head is genesis.
    #[must_use]
    pub fn head_lineage(&self) -> Option<ObjectRef> {
        self.chain
            .last()
            .filter(|b| !b.is_genesis())
            .map(|b| b.parent_hash)
    }

    #[must_use]
    pub fn chain(&self) -> &[ChainBlock] {
        &self.chain
    }

    #[must_use]
    pub const fn luck(&self) -> f64 {
        self.luck
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.chain.len() - 1
    }

    #[must_use]
    pub fn contains_transaction(&self, tx: &ContentHash) -> bool {
        self.chain.iter().any(|b| b.transactions.contains(tx))
    }

    /// Adopt `candidate` iff its chain is valid and strictly luckier than ours.
    ///
    /// A candidate whose chain reconstructs is considered at most once; a
    /// rejected chain is not retried. One that fails to reconstruct, because
    /// some object is not available yet, may be announced again.
    pub fn consider(
        &mut self,
        candidate: ObjectRef,
        store: &dyn ObjectStore,
        verifier: &dyn AttestationVerifier,
    ) -> Result<Decision, LuckError> {
        if candidate == self.head() || self.seen.contains(&candidate) {
            return Ok(Decision::Ignored);
        }

        let chain = chain::chain_of(candidate, store)?;
        if self.seen.len() >= SEEN_CAPACITY {
            self.seen.clear();
        }
        self.seen.insert(candidate);
        chain::valid_chain(&chain, verifier)?;

        let candidate_luck = chain::luck(&chain, self.min_luck);
        if candidate_luck <= self.luck {
            return Ok(Decision::Kept {
                candidate_luck,
                current_luck: self.luck,
            });
        }

        let transactions = chain
            .iter()
            .flat_map(|b| b.transactions.iter().copied())
            .collect();
        let previous_head = self.head();
        self.chain = chain;
        self.luck = candidate_luck;

        Ok(Decision::Adopted(Adoption {
            previous_head,
            head: candidate,
            luck: candidate_luck,
            height: self.height(),
            transactions,
        }))
    }
}
