use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use libp2p::futures::StreamExt;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm, SwarmBuilder, gossipsub, mdns, swarm::NetworkBehaviour};
use tokio::sync::broadcast;

use crate::error::LuckError;

const BLOCK_TOPIC: &str = "poluck/block/1.0.0";
const TRANSACTION_TOPIC: &str = "poluck/transaction/1.0.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topic {
    /// Carries a head hash in text form.
    Block,
    /// Carries a transaction hash in hex.
    Transaction,
}

impl Topic {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Block => BLOCK_TOPIC,
            Self::Transaction => TRANSACTION_TOPIC,
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            BLOCK_TOPIC => Some(Self::Block),
            TRANSACTION_TOPIC => Some(Self::Transaction),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gossip {
    pub topic: Topic,
    pub data: Vec<u8>,
}

/// Peer broadcast as seen by a node. Implementations never echo a node's own
/// messages back to it.
#[async_trait]
pub trait Transport: Send {
    fn publish(&mut self, topic: Topic, data: Vec<u8>) -> Result<(), LuckError>;

    /// The next message from a peer, or `None` once the transport is closed.
    async fn next(&mut self) -> Option<Gossip>;
}

#[derive(Clone, Debug)]
struct Envelope {
    from: u64,
    gossip: Gossip,
}

/// In-process broadcast bus connecting nodes that run in the same process.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Envelope>,
    next_id: Arc<AtomicU64>,
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach a new participant.
    #[must_use]
    pub fn join(&self) -> LocalTransport {
        LocalTransport {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender: self.sender.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct LocalTransport {
    id: u64,
    sender: broadcast::Sender<Envelope>,
    receiver: broadcast::Receiver<Envelope>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn publish(&mut self, topic: Topic, data: Vec<u8>) -> Result<(), LuckError> {
        // Sending only fails when nobody else is listening.
        let _ = self.sender.send(Envelope {
            from: self.id,
            gossip: Gossip { topic, data },
        });
        Ok(())
    }

    async fn next(&mut self) -> Option<Gossip> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.from == self.id => {}
                Ok(envelope) => return Some(envelope.gossip),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "local bus lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(NetworkBehaviour)]
struct LuckBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
}

/// libp2p gossipsub over TCP with mDNS peer discovery.
pub struct GossipTransport {
    swarm: Swarm<LuckBehaviour>,
}

impl GossipTransport {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_behaviour(|key| {
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .build()?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                let mdns =
                    mdns::tokio::Behaviour::new(mdns::Config::default(), key.public().to_peer_id())?;

                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(LuckBehaviour { gossipsub, mdns })
            })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        Ok(Self { swarm })
    }

    /// Start listening on the given address and subscribe to both topics.
    pub fn listen(&mut self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let multiaddr: Multiaddr = addr.parse()?;
        self.swarm.listen_on(multiaddr)?;

        let gossipsub = &mut self.swarm.behaviour_mut().gossipsub;
        for topic in [Topic::Block, Topic::Transaction] {
            gossipsub.subscribe(&gossipsub::IdentTopic::new(topic.name()))?;
        }
        Ok(())
    }

    pub fn dial(&mut self, addr: Multiaddr) -> Result<(), Box<dyn std::error::Error>> {
        self.swarm.dial(addr)?;
        Ok(())
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }
}

#[async_trait]
impl Transport for GossipTransport {
    fn publish(&mut self, topic: Topic, data: Vec<u8>) -> Result<(), LuckError> {
        self.swarm
            .behaviour_mut()
            .gossipsub
            .publish(gossipsub::IdentTopic::new(topic.name()), data)
            .map(|_| ())
            .map_err(|e| LuckError::Transport(e.to_string()))
    }

    async fn next(&mut self) -> Option<Gossip> {
        loop {
            match self.swarm.select_next_some().await {
                SwarmEvent::Behaviour(LuckBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                    message,
                    ..
                })) => {
                    if let Some(topic) = Topic::from_name(message.topic.as_str()) {
                        return Some(Gossip {
                            topic,
                            data: message.data,
                        });
                    }
                }
                SwarmEvent::Behaviour(LuckBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                    for (peer_id, addr) in peers {
                        self.swarm.add_peer_address(peer_id, addr);
                        self.swarm
                            .behaviour_mut()
                            .gossipsub
                            .add_explicit_peer(&peer_id);
                        tracing::info!(%peer_id, "discovered peer via mDNS");
                    }
                }
                SwarmEvent::Behaviour(LuckBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                    for (peer_id, _addr) in peers {
                        self.swarm
                            .behaviour_mut()
                            .gossipsub
                            .remove_explicit_peer(&peer_id);
                        tracing::info!(%peer_id, "peer expired from mDNS");
                    }
                }
                SwarmEvent::NewListenAddr { address, .. } => {
                    tracing::info!(%address, "listening on");
                }
                _ => {}
            }
        }
    }
}
