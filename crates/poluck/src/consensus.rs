use std::sync::Arc;

use crate::assembler::{self, PendingCommit};
use crate::attestation::{AttestationVerifier, Attestor};
use crate::chain;
use crate::config::ConsensusConfig;
use crate::enclave::{RoundStateMachine, RoundStatus};
use crate::error::LuckError;
use crate::fork_choice::{Decision, ForkChoice, Origin};
use crate::mempool::Mempool;
use crate::persist::{Snapshot, StateStore};
use crate::store::{self, ObjectStore};
use crate::types::{ChainBlock, ContentHash, ObjectRef, Transaction};

/// The consensus engine: enclave, fork choice, and mempool driven from one
/// logical thread. Every method takes `&mut self`, so an adoption can never
/// interleave with a round tick.
pub struct Consensus {
    config: ConsensusConfig,
    enclave: Box<dyn RoundStateMachine>,
    attestor: Attestor,
    verifier: Box<dyn AttestationVerifier>,
    store: Arc<dyn ObjectStore>,
    state: Box<dyn StateStore>,
    fork_choice: ForkChoice,
    mempool: Mempool,
    peer_block_this_slot: bool,
    mining: bool,
}

impl Consensus {
    #[must_use]
    pub fn new(
        config: ConsensusConfig,
        enclave: Box<dyn RoundStateMachine>,
        attestor: Attestor,
        verifier: Box<dyn AttestationVerifier>,
        store: Arc<dyn ObjectStore>,
        state: Box<dyn StateStore>,
    ) -> Self {
        Self {
            fork_choice: ForkChoice::new(config.min_luck),
            mempool: Mempool::new(config.max_mempool),
            config,
            enclave,
            attestor,
            verifier,
            store,
            state,
            peer_block_this_slot: false,
            mining: false,
        }
    }

    /// Restore the persisted head and mempool, then start the first round.
    ///
    /// A persisted head that no longer reconstructs or validates is dropped in
    /// favour of genesis.
    pub fn bootstrap(&mut self) -> Result<(), LuckError> {
        if let Some(snapshot) = self.state.load()? {
            match chain::chain_of(snapshot.head, self.store.as_ref()).and_then(|c| {
                chain::valid_chain(&c, self.verifier.as_ref())?;
                Ok(c)
            }) {
                Ok(restored) => {
                    self.fork_choice = ForkChoice::with_chain(restored, self.config.min_luck);
                    tracing::info!(
                        head = %self.head(),
                        height = self.fork_choice.height(),
                        "restored chain head"
                    );
                }
                Err(e) => {
                    tracing::warn!(head = %snapshot.head, "persisted head unusable, starting from genesis: {e}");
                }
            }
            for tx in snapshot.mempool {
                if !self.fork_choice.contains_transaction(&tx) {
                    self.mempool.insert(tx);
                }
            }
        }
        self.ensure_round();
        Ok(())
    }

    #[must_use]
    pub fn head(&self) -> ObjectRef {
        self.fork_choice.head()
    }

    #[must_use]
    pub fn chain(&self) -> &[ChainBlock] {
        self.fork_choice.chain()
    }

    #[must_use]
    pub const fn luck(&self) -> f64 {
        self.fork_choice.luck()
    }

    #[must_use]
    pub const fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub const fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn round_status(&mut self) -> Result<RoundStatus, LuckError> {
        self.enclave.status()
    }

    /// Store a locally submitted transaction and queue it. Returns its hash if
    /// it was new.
    pub fn submit_transaction(&mut self, tx: &Transaction) -> Result<Option<ContentHash>, LuckError> {
        let hash = store::put_object(self.store.as_ref(), tx)?;
        Ok(self.on_transaction(hash).then_some(hash))
    }

    /// Queue a transaction link heard from a peer. Returns `true` if it was new.
    pub fn on_transaction(&mut self, tx: ContentHash) -> bool {
        if self.fork_choice.contains_transaction(&tx) {
            return false;
        }
        let added = self.mempool.insert(tx);
        if added {
            tracing::debug!(%tx, pending = self.mempool.len(), "transaction queued");
            self.persist();
        }
        added
    }

    /// Run fork choice on a candidate head. Returns the new head when it is
    /// adopted, for the caller to rebroadcast.
    pub fn on_block(&mut self, candidate: ObjectRef, origin: Origin) -> Option<ObjectRef> {
        let decision =
            self.fork_choice
                .consider(candidate, self.store.as_ref(), self.verifier.as_ref());

        match decision {
            Ok(Decision::Adopted(adoption)) => {
                let cleared = self.mempool.remove_all(&adoption.transactions);
                if origin == Origin::Peer {
                    self.peer_block_this_slot = true;
                }
                tracing::info!(
                    head = %adoption.head,
                    previous = %adoption.previous_head,
                    luck = adoption.luck,
                    height = adoption.height,
                    cleared,
                    ?origin,
                    "adopted new head"
                );
                self.persist();
                self.ensure_round();
                Some(adoption.head)
            }
            Ok(Decision::Kept {
                candidate_luck,
                current_luck,
            }) => {
                tracing::debug!(%candidate, candidate_luck, current_luck, "kept current head");
                None
            }
            Ok(Decision::Ignored) => None,
            Err(e) => {
                tracing::warn!(%candidate, ?origin, "rejected candidate head: {e}");
                None
            }
        }
    }

    /// Round keepalive, fired every round time.
    ///
    /// Returns a pending commit when the enclave accepted a payload; the caller
    /// waits out its sleep and hands it back to [`Self::finish_commit`].
    pub fn on_tick(&mut self) -> Option<PendingCommit> {
        if std::mem::take(&mut self.peer_block_this_slot) {
            tracing::debug!("a peer block already filled this slot");
            return None;
        }
        if self.mining {
            return None;
        }

        match self.enclave.status() {
            Ok(RoundStatus::Idle) => {
                self.ensure_round();
                None
            }
            Ok(RoundStatus::RoundStarted { .. })
                if !self.config.allow_empty_blocks && self.mempool.is_empty() =>
            {
                tracing::debug!("nothing to mine");
                None
            }
            Ok(RoundStatus::RoundStarted { .. }) => match self.begin_commit() {
                Ok(pending) => Some(pending),
                Err(e) if e.is_retryable() => {
                    tracing::debug!("round not ready: {e}");
                    None
                }
                Err(e) => {
                    tracing::warn!("could not mine this round: {e}");
                    // A stale round cannot be mined; race the current head instead.
                    self.ensure_round();
                    None
                }
            },
            Ok(RoundStatus::Sleeping) => {
                tracing::error!("enclave is stuck sleeping, an operator reset is required");
                None
            }
            Err(e) => {
                tracing::error!("enclave status unavailable: {e}");
                None
            }
        }
    }

    /// Mine the mempool on top of the current head.
    pub fn begin_commit(&mut self) -> Result<PendingCommit, LuckError> {
        let head = self.head();
        let pending = assembler::begin_commit(
            self.enclave.as_mut(),
            self.store.as_ref(),
            head,
            self.mempool.snapshot(),
            self.config.allow_empty_blocks,
        )?;
        self.mining = true;
        tracing::info!(
            parent = %pending.parent,
            txs = pending.transactions.len(),
            sleep_ms = u64::try_from(pending.sleep.duration.as_millis()).unwrap_or(u64::MAX),
            "mined payload, waiting out the luck delay"
        );
        Ok(pending)
    }

    /// Complete a commit after its sleep. Returns the new head if our block won.
    pub fn finish_commit(&mut self, pending: &PendingCommit) -> Result<Option<ObjectRef>, LuckError> {
        let hash = match assembler::finish_commit(
            self.enclave.as_mut(),
            &self.attestor,
            self.store.as_ref(),
            pending,
        ) {
            Ok(hash) => hash,
            Err(e) => {
                if !e.is_retryable() {
                    self.mining = false;
                }
                return Err(e);
            }
        };
        self.mining = false;
        tracing::info!(block = %hash, parent = %pending.parent, "committed block");

        // Adoption clears the block's transactions from the mempool; a losing
        // block leaves them queued for the next round.
        let adopted = self.on_block(ObjectRef::Content(hash), Origin::Local);
        if adopted.is_none() {
            let mut requeued = 0usize;
            for tx in &pending.transactions {
                if !self.fork_choice.contains_transaction(tx) && self.mempool.insert(*tx) {
                    requeued += 1;
                }
            }
            tracing::debug!(requeued, "local block not adopted");
            self.persist();
        }
        self.ensure_round();
        Ok(adopted)
    }

    /// Give up on a pending commit without resuming. The enclave stays asleep
    /// until [`Self::reset_enclave`].
    pub fn cancel_commit(&mut self, pending: &PendingCommit) {
        tracing::warn!(payload = %pending.payload_hash, "pending commit cancelled");
        self.mining = false;
    }

    /// Operator-level reset of a stuck enclave.
    pub fn reset_enclave(&mut self) -> Result<(), LuckError> {
        self.enclave.reset()?;
        self.mining = false;
        self.ensure_round();
        Ok(())
    }

    /// Make sure the enclave races the current head's lineage.
    fn ensure_round(&mut self) {
        let lineage = self.fork_choice.head_lineage();
        match self.enclave.status() {
            Ok(RoundStatus::Idle) => {}
            Ok(RoundStatus::RoundStarted { lineage: current }) if current == lineage => return,
            Ok(RoundStatus::RoundStarted { .. }) => {
                if let Err(e) = self.enclave.abandon_round() {
                    tracing::error!("could not abandon stale round: {e}");
                    return;
                }
            }
            Ok(RoundStatus::Sleeping) => return,
            Err(e) => {
                tracing::error!("enclave status unavailable: {e}");
                return;
            }
        }

        let head = self.head();
        let started = assembler::load_prior(self.store.as_ref(), head)
            .and_then(|(_, payload)| self.enclave.start_round(&payload));
        match started {
            Ok(()) => tracing::debug!(%head, "round started"),
            Err(e) => tracing::error!(%head, "could not start round: {e}"),
        }
    }

    fn persist(&self) {
        let snapshot = Snapshot {
            head: self.head(),
            mempool: self.mempool.snapshot(),
        };
        if let Err(e) = self.state.save(&snapshot) {
            tracing::error!("failed to persist node state: {e}");
        }
    }
}
