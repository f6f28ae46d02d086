use std::collections::BTreeSet;

use crate::types::ContentHash;

/// Pending transaction links, deduplicated and kept in hash order so payloads
/// built from the same pool are identical.
#[derive(Clone, Debug)]
pub struct Mempool {
    pending: BTreeSet<ContentHash>,
    capacity: usize,
}

impl Mempool {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeSet::new(),
            capacity,
        }
    }

    /// Returns `false` for duplicates and when the pool is full.
    pub fn insert(&mut self, tx: ContentHash) -> bool {
        if self.pending.len() >= self.capacity && !self.pending.contains(&tx) {
            tracing::warn!(capacity = self.capacity, %tx, "mempool full, dropping transaction");
            return false;
        }
        self.pending.insert(tx)
    }

    /// Drop every transaction in `txs`, returning how many were pending.
    pub fn remove_all<'a>(&mut self, txs: impl IntoIterator<Item = &'a ContentHash>) -> usize {
        txs.into_iter().filter(|tx| self.pending.remove(tx)).count()
    }

    #[must_use]
    pub fn contains(&self, tx: &ContentHash) -> bool {
        self.pending.contains(tx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ContentHash> {
        self.pending.iter().copied().collect()
    }
}
