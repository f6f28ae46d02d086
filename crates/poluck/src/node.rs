use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, Sleep};

use crate::assembler::PendingCommit;
use crate::consensus::Consensus;
use crate::enclave::RoundStatus;
use crate::error::LuckError;
use crate::fork_choice::Origin;
use crate::transport::{Gossip, Topic, Transport};
use crate::types::{ChainBlock, ContentHash, ObjectRef, Transaction};

type Pending = Option<(Pin<Box<Sleep>>, PendingCommit)>;

/// What the outside world sees of a node's chain.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainView {
    pub head: ObjectRef,
    pub luck: f64,
    pub height: usize,
    pub pending: usize,
    pub chain: Vec<ChainBlock>,
}

impl ChainView {
    fn of(consensus: &Consensus) -> Self {
        Self {
            head: consensus.head(),
            luck: consensus.luck(),
            height: consensus.chain().len().saturating_sub(1),
            pending: consensus.mempool().len(),
            chain: consensus.chain().to_vec(),
        }
    }
}

type ResetReply = oneshot::Sender<Result<RoundStatus, LuckError>>;

/// Channels into a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    pub transactions: mpsc::Sender<Transaction>,
    pub view: watch::Receiver<ChainView>,
    resets: mpsc::Sender<ResetReply>,
}

impl NodeHandle {
    /// Operator reset of a stuck enclave. Any pending commit is abandoned.
    /// Returns the round status once the node has restarted its round.
    pub async fn reset_enclave(&self) -> Result<RoundStatus, LuckError> {
        let (reply, response) = oneshot::channel();
        self.resets
            .send(reply)
            .await
            .map_err(|_| LuckError::Transport("node stopped".into()))?;
        response
            .await
            .map_err(|_| LuckError::Transport("node stopped".into()))?
    }
}

/// A consensus participant: drives [`Consensus`] from the round timer, peer
/// gossip, and locally submitted transactions on a single task.
pub struct Node<T: Transport> {
    consensus: Consensus,
    transport: T,
    tx_receiver: mpsc::Receiver<Transaction>,
    resets: mpsc::Receiver<ResetReply>,
    view: watch::Sender<ChainView>,
}

impl<T: Transport> Node<T> {
    /// Wrap a bootstrapped consensus engine.
    ///
    /// Returns the node and a handle for submitting transactions and watching
    /// the head.
    pub fn new(consensus: Consensus, transport: T) -> (Self, NodeHandle) {
        let (tx_sender, tx_receiver) = mpsc::channel(256);
        let (reset_sender, resets) = mpsc::channel(4);
        let (view, view_receiver) = watch::channel(ChainView::of(&consensus));
        (
            Self {
                consensus,
                transport,
                tx_receiver,
                resets,
                view,
            },
            NodeHandle {
                transactions: tx_sender,
                view: view_receiver,
                resets: reset_sender,
            },
        )
    }

    #[must_use]
    pub const fn consensus(&self) -> &Consensus {
        &self.consensus
    }

    /// Run the node event loop until the transport closes.
    pub async fn run(&mut self) {
        let mut round_timer = tokio::time::interval(self.consensus.config().round_time);
        round_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Pending = None;

        loop {
            tokio::select! {
                _ = round_timer.tick() => {
                    if pending.is_none()
                        && let Some(commit) = self.consensus.on_tick()
                    {
                        pending = Some(sleep_on(commit.sleep.duration, commit));
                    }
                }
                () = wake(&mut pending) => {
                    if let Some((_, commit)) = pending.take() {
                        pending = self.finish(commit);
                    }
                }
                gossip = self.transport.next() => {
                    let Some(gossip) = gossip else {
                        tracing::warn!("transport closed, stopping node");
                        if let Some((_, commit)) = pending.take() {
                            self.consensus.cancel_commit(&commit);
                        }
                        break;
                    };
                    self.handle_gossip(gossip);
                }
                Some(tx) = self.tx_receiver.recv() => {
                    self.submit(&tx);
                }
                Some(reply) = self.resets.recv() => {
                    if let Some((_, commit)) = pending.take() {
                        self.consensus.cancel_commit(&commit);
                    }
                    let _ = reply.send(self.reset());
                }
            }
            self.refresh_view();
        }
    }

    fn finish(&mut self, commit: PendingCommit) -> Pending {
        match self.consensus.finish_commit(&commit) {
            Ok(Some(head)) => {
                self.announce(head);
                None
            }
            Ok(None) => None,
            Err(LuckError::RoundNotElapsed { remaining_ms }) => {
                Some(sleep_on(Duration::from_millis(remaining_ms), commit))
            }
            Err(e) => {
                tracing::error!(payload = %commit.payload_hash, "failed to finish commit: {e}");
                None
            }
        }
    }

    fn reset(&mut self) -> Result<RoundStatus, LuckError> {
        tracing::warn!("operator reset of the enclave");
        self.consensus.reset_enclave()?;
        self.consensus.round_status()
    }

    fn handle_gossip(&mut self, gossip: Gossip) {
        match gossip.topic {
            Topic::Block => {
                let Some(candidate) = std::str::from_utf8(&gossip.data)
                    .ok()
                    .and_then(|s| s.parse::<ObjectRef>().ok())
                else {
                    tracing::warn!("undecodable block announcement");
                    return;
                };
                if let Some(head) = self.consensus.on_block(candidate, Origin::Peer) {
                    self.announce(head);
                }
            }
            Topic::Transaction => {
                let Some(hash) = std::str::from_utf8(&gossip.data)
                    .ok()
                    .and_then(|s| ContentHash::from_hex(s).ok())
                else {
                    tracing::warn!("undecodable transaction announcement");
                    return;
                };
                self.consensus.on_transaction(hash);
            }
        }
    }

    fn submit(&mut self, tx: &Transaction) {
        match self.consensus.submit_transaction(tx) {
            Ok(Some(hash)) => {
                if let Err(e) = self
                    .transport
                    .publish(Topic::Transaction, hash.to_hex().into_bytes())
                {
                    tracing::debug!(%hash, "could not gossip transaction: {e}");
                }
            }
            Ok(None) => tracing::debug!("duplicate or rejected transaction"),
            Err(e) => tracing::warn!("failed to store submitted transaction: {e}"),
        }
    }

    fn announce(&mut self, head: ObjectRef) {
        if let Err(e) = self
            .transport
            .publish(Topic::Block, head.to_string().into_bytes())
        {
            tracing::debug!(%head, "could not gossip head: {e}");
        }
    }

    fn refresh_view(&self) {
        let consensus = &self.consensus;
        self.view.send_if_modified(|view| {
            let head = consensus.head();
            let pending = consensus.mempool().len();
            if view.head == head && view.pending == pending {
                return false;
            }
            *view = ChainView::of(consensus);
            true
        });
    }
}

fn sleep_on(duration: Duration, commit: PendingCommit) -> (Pin<Box<Sleep>>, PendingCommit) {
    (Box::pin(tokio::time::sleep(duration)), commit)
}

async fn wake(pending: &mut Pending) {
    match pending {
        Some((sleep, _)) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
