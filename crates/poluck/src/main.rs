use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use poluck::http::NodeApi;
use poluck::node::Node;
use poluck::transport::{GossipTransport, LocalBus};
use poluck::{
    Attestor, BoundaryClient, Consensus, ConsensusConfig, Enclave, FileStore, JsonFileState,
    LuckError, MemoryState, MemoryStore, ObjectStore, StateStore, SystemPlatform,
    TrustedServices, crypto,
};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "poluck", about = "Proof of Luck consensus node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node on the gossip network. Gossip announces only hashes, so
    /// every node must point `--objects` at the same store (e.g. a network mount)
    Run(RunArgs),
    /// Run several nodes in one process over an in-memory bus
    Simulate(SimulateArgs),
    /// Generate an attestation service key
    Keygen,
}

#[derive(Args)]
struct ConsensusArgs {
    /// Minimum round time in seconds
    #[arg(long, env = "POLUCK_ROUND_TIME", default_value_t = 10)]
    round_time: u64,

    /// Blocks below this luck do not count towards chain weight
    #[arg(long, env = "POLUCK_MIN_LUCK", default_value_t = 0.0)]
    min_luck: f64,

    #[arg(long, env = "POLUCK_MAX_MEMPOOL", default_value_t = 10_000)]
    max_mempool: usize,

    /// Do not mine blocks without transactions
    #[arg(long, env = "POLUCK_NO_EMPTY_BLOCKS")]
    no_empty_blocks: bool,

    /// Hex ed25519 secret of the attestation service
    #[arg(long, env = "POLUCK_ATTESTATION_KEY")]
    attestation_key: Option<String>,
}

impl ConsensusArgs {
    fn config(&self) -> ConsensusConfig {
        ConsensusConfig {
            round_time: Duration::from_secs(self.round_time.max(1)),
            min_luck: self.min_luck,
            allow_empty_blocks: !self.no_empty_blocks,
            max_mempool: self.max_mempool,
        }
    }

    fn attestation_key(&self) -> Result<SigningKey, LuckError> {
        if let Some(hex) = &self.attestation_key {
            return crypto::signing_key_from_hex(hex);
        }
        tracing::warn!("no attestation key configured, using the shared development key");
        Ok(SigningKey::from_bytes(&crypto::hash_bytes(
            b"poluck-dev-attestation-service",
        )))
    }
}

#[derive(Args)]
struct RunArgs {
    /// Address to listen on (e.g. /ip4/0.0.0.0/tcp/0)
    #[arg(short, long, env = "POLUCK_LISTEN", default_value = "/ip4/0.0.0.0/tcp/0")]
    listen: String,

    /// Peers to dial on startup
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// HTTP API address
    #[arg(long, env = "POLUCK_HTTP", default_value = "127.0.0.1:8080")]
    http: SocketAddr,

    /// Directory for node state
    #[arg(long, env = "POLUCK_DATA_DIR", default_value = ".poluck")]
    data_dir: PathBuf,

    /// Object store directory. Must be the same store for every node on the
    /// network; defaults to `poluck-objects` in the system temp directory
    #[arg(long, env = "POLUCK_OBJECTS")]
    objects: Option<PathBuf>,

    #[command(flatten)]
    consensus: ConsensusArgs,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,

    #[command(flatten)]
    consensus: ConsensusArgs,
}

fn build_consensus(
    config: ConsensusConfig,
    store: Arc<dyn ObjectStore>,
    state: Box<dyn StateStore>,
    attestation_key: SigningKey,
) -> Result<Consensus, LuckError> {
    let enclave = BoundaryClient::new(Enclave::new(SystemPlatform::new(), config.round_time));
    let attestor = Attestor::new(attestation_key);
    let verifier = TrustedServices::for_attestor(&attestor);

    let mut consensus = Consensus::new(
        config,
        Box::new(enclave),
        attestor,
        Box::new(verifier),
        store,
        state,
    );
    consensus.bootstrap()?;
    Ok(consensus)
}

fn default_objects_dir() -> PathBuf {
    std::env::temp_dir().join("poluck-objects")
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let objects = args.objects.clone().unwrap_or_else(default_objects_dir);
    if args.objects.is_none() {
        tracing::warn!(
            path = %objects.display(),
            "no --objects given, using the host-wide default; nodes on other hosts cannot see these objects"
        );
    }
    let store: Arc<dyn ObjectStore> = Arc::new(FileStore::open(objects)?);
    let state = JsonFileState::new(args.data_dir.join("state.json"));

    let consensus = build_consensus(
        args.consensus.config(),
        store,
        Box::new(state),
        args.consensus.attestation_key()?,
    )?;
    tracing::info!(head = %consensus.head(), luck = consensus.luck(), "consensus ready");

    let mut transport = GossipTransport::new()?;
    transport.listen(&args.listen)?;
    for peer in &args.peers {
        transport.dial(peer.parse()?)?;
    }
    tracing::info!(peer_id = %transport.peer_id(), "gossip transport started");

    let (mut node, handle) = Node::new(consensus, transport);

    let listener = TcpListener::bind(args.http).await?;
    tracing::info!(addr = %args.http, "HTTP API listening");
    tokio::spawn(async move {
        if let Err(e) = NodeApi::new(handle).run(listener).await {
            tracing::error!("HTTP API stopped: {e}");
        }
    });

    tracing::info!("node started, entering event loop");
    node.run().await;
    Ok(())
}

async fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let bus = LocalBus::new(1024);
    let key = args.consensus.attestation_key()?;

    let mut handles = Vec::with_capacity(args.nodes);
    let mut tasks = Vec::with_capacity(args.nodes);
    for id in 0..args.nodes {
        let consensus = build_consensus(
            args.consensus.config(),
            Arc::clone(&store),
            Box::new(MemoryState::new()),
            key.clone(),
        )?;
        let (mut node, handle) = Node::new(consensus, bus.join());
        handles.push(handle);
        tasks.push(tokio::spawn(async move {
            node.run().await;
            tracing::info!(node = id, "node stopped");
        }));
    }

    tracing::info!(nodes = args.nodes, seconds = args.duration, "simulation running");
    tokio::time::sleep(Duration::from_secs(args.duration)).await;
    for task in &tasks {
        task.abort();
    }

    for (id, handle) in handles.iter().enumerate() {
        let view = handle.view.borrow();
        println!(
            "node {id}: head {} height {} luck {:.4}",
            view.head, view.height, view.luck
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await?,
        Command::Simulate(args) => simulate(args).await?,
        Command::Keygen => {
            let key = crypto::random_signing_key();
            println!("Attestation service key (secret): {}", hex::encode(key.to_bytes()));
            println!(
                "Attestation service key (public): {}",
                hex::encode(key.verifying_key().to_bytes())
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_to_a_host_wide_object_store() {
        let cli = Cli::try_parse_from(["poluck", "run", "--data-dir", "/tmp/node-a"]).expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.objects, None);

        let other = Cli::try_parse_from(["poluck", "run", "--data-dir", "/tmp/node-b"]).expect("parse");
        let Command::Run(other) = other.command else {
            panic!("expected run");
        };
        // Nodes with different data directories still share one object store.
        assert_ne!(args.data_dir, other.data_dir);
        assert!(default_objects_dir().ends_with("poluck-objects"));
        assert!(!default_objects_dir().starts_with(&args.data_dir));
    }
}
