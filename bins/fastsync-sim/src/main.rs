//! Fast-sync simulation binary.
//!
//! Builds a signed chain, starts serving nodes (some of them optionally
//! serving forged blocks) and one lagging node on an in-memory network, and
//! runs the lagging node's fast sync until it switches to consensus.

use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use fastsync_core::traits::BlockStore;
use fastsync_core::types::PeerId;
use fastsync_network::{drive, MemoryNetwork, SyncConfig, SyncReactor};
use fastsync_node::{
    ChainBuilder, CommitVerifier, LogFormat, MemoryBlockStore, NodeConfig, SignedBlock,
    StoreExecutor, Validators,
};
use tracing::{error, info, warn};

/// Simulate a lagging node catching up from its peers.
#[derive(Parser, Debug)]
#[command(
    name = "fastsync-sim",
    version,
    about = "Run fast sync for a lagging node against in-memory peers"
)]
struct Args {
    /// Length of the chain the serving peers hold
    #[arg(long, default_value_t = 500)]
    blocks: u64,

    /// Number of honest serving peers
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// Number of peers serving forged blocks
    #[arg(long, default_value_t = 0)]
    faulty_peers: usize,

    /// Size of the validator set signing the chain
    #[arg(long, default_value_t = 4)]
    validators: usize,

    /// Height the lagging node already has
    #[arg(long, default_value_t = 0)]
    start_height: u64,

    /// Transactions per block
    #[arg(long, default_value_t = 16)]
    txs_per_block: usize,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Chain id the validators sign over
    #[arg(long, default_value = "fastsync-sim")]
    chain_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

impl Args {
    /// Convert CLI args into a NodeConfig.
    fn node_config(&self) -> NodeConfig {
        let log_format = if self.log_format == "json" {
            LogFormat::Json
        } else {
            LogFormat::Text
        };
        NodeConfig {
            chain_id: self.chain_id.clone(),
            log_level: self.log_level.clone(),
            log_format,
            sync: SyncConfig::testing(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.validators == 0 {
            bail!("--validators must be at least 1");
        }
        if self.peers + self.faulty_peers == 0 {
            bail!("need at least one serving peer");
        }
        if self.start_height >= self.blocks {
            bail!(
                "--start-height ({}) must be below --blocks ({})",
                self.start_height,
                self.blocks
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = args.node_config();
    init_logging(&config.log_level, config.log_format);

    info!("fastsync-sim v{}", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        result = run(&args, config) => {
            if let Err(e) = result {
                error!("simulation failed: {e:#}");
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("received Ctrl+C, aborting simulation");
            process::exit(130);
        }
    }
}

async fn run(args: &Args, config: NodeConfig) -> Result<()> {
    args.validate()?;

    let validators = Validators::deterministic(args.validators);
    let part_size = config.sync.block_part_size;
    let started = Instant::now();
    let chain = ChainBuilder::new(&config.chain_id, &validators, part_size)
        .txs_per_block(args.txs_per_block)
        .build(args.blocks)
        .context("failed to build chain")?;
    let forged = chain
        .iter()
        .map(|signed| signed.forge(part_size))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to forge chain")?;
    info!(
        blocks = args.blocks,
        validators = args.validators,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "chain built"
    );

    let net = MemoryNetwork::new();
    let serving = SyncConfig {
        fast_sync: false,
        ..config.sync.clone()
    };

    let mut servers = Vec::new();
    for i in 0..args.peers {
        let id = format!("peer-{i}");
        let store = seeded_store(&chain, args.blocks)?;
        spawn_node(&net, &id, store, serving.clone(), &config.chain_id, &validators);
        servers.push(PeerId::new(id));
    }
    for i in 0..args.faulty_peers {
        let id = format!("faulty-{i}");
        let store = seeded_store(&forged, args.blocks)?;
        spawn_node(&net, &id, store, serving.clone(), &config.chain_id, &validators);
        servers.push(PeerId::new(id));
    }

    let lagging = PeerId::from("lagging");
    let store = seeded_store(&chain, args.start_height)?;
    let (reactor, switch_rx) = spawn_node(
        &net,
        lagging.as_str(),
        Arc::clone(&store),
        config.sync.clone(),
        &config.chain_id,
        &validators,
    );
    for server in &servers {
        net.connect(&lagging, server);
    }
    info!(
        peers = args.peers,
        faulty_peers = args.faulty_peers,
        start_height = args.start_height,
        "lagging node connected"
    );

    let sync_started = Instant::now();
    let sync = {
        let reactor = Arc::clone(&reactor);
        tokio::spawn(async move { reactor.run().await })
    };
    let limit = Duration::from_secs(args.timeout_secs);
    let outcome = match tokio::time::timeout(limit, sync).await {
        Ok(joined) => joined.context("sync task panicked")?,
        Err(_) => {
            reactor.stop();
            bail!(
                "no catch-up within {}s (store height {})",
                args.timeout_secs,
                store.height()
            );
        }
    };
    outcome.context("fast sync failed")?;

    let mut switch_rx = switch_rx;
    let switch = switch_rx
        .try_recv()
        .context("sync ended without switching to consensus")?;
    let elapsed = sync_started.elapsed();
    let synced = store.height() - args.start_height;
    let linked = net.peers_of(&lagging);
    let evicted: Vec<&PeerId> = servers.iter().filter(|p| !linked.contains(p)).collect();

    info!(
        synced,
        elapsed_ms = elapsed.as_millis() as u64,
        blocks_per_sec = synced as f64 / elapsed.as_secs_f64().max(1e-3),
        evicted = ?evicted,
        "fast sync complete"
    );
    println!(
        "caught up: store height {}, consensus starts at {}, {} blocks in {:.2?}, {} peer(s) evicted",
        store.height(),
        switch.height,
        synced,
        elapsed,
        evicted.len()
    );
    Ok(())
}

/// A store holding the first `height` blocks of `chain`.
fn seeded_store(chain: &[SignedBlock], height: u64) -> Result<Arc<MemoryBlockStore>> {
    let store = MemoryBlockStore::new();
    for signed in chain.iter().take(height as usize) {
        store
            .save_block(&signed.block, &signed.parts, &signed.seen_commit)
            .with_context(|| format!("failed to seed block {}", signed.height()))?;
    }
    Ok(Arc::new(store))
}

/// Join `net` as `id`, wire a reactor over `store`, and dispatch its events
/// in the background.
fn spawn_node(
    net: &MemoryNetwork,
    id: &str,
    store: Arc<MemoryBlockStore>,
    sync: SyncConfig,
    chain_id: &str,
    validators: &Validators,
) -> (
    Arc<SyncReactor>,
    tokio::sync::oneshot::Receiver<fastsync_network::SwitchToConsensus>,
) {
    let (transport, events) = net.join(id);
    let verifier = CommitVerifier::new(chain_id, validators.validator_set());
    let executor = StoreExecutor::new(Arc::clone(&store));
    let (reactor, switch_rx) = SyncReactor::new(
        sync,
        store,
        Arc::new(transport),
        Arc::new(verifier),
        Arc::new(executor),
    );
    tokio::spawn(drive(Arc::clone(&reactor), events));
    (reactor, switch_rx)
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` overrides the level when set.
fn init_logging(level_str: &str, format: LogFormat) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("fastsync-sim").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let args = parse(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.node_config().log_format, LogFormat::Text);
    }

    #[test]
    fn start_height_must_be_below_chain_length() {
        let args = parse(&["--blocks", "10", "--start-height", "10"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn json_format_selected() {
        let args = parse(&["--log-format", "json", "--chain-id", "x"]);
        let config = args.node_config();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.chain_id, "x");
    }

    #[test]
    fn unknown_log_format_rejected() {
        let argv = ["fastsync-sim", "--log-format", "xml"];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn small_simulation_with_a_faulty_peer_completes() {
        let args = parse(&[
            "--blocks",
            "40",
            "--peers",
            "2",
            "--faulty-peers",
            "1",
            "--start-height",
            "5",
            "--timeout-secs",
            "60",
        ]);
        let config = args.node_config();
        run(&args, config).await.unwrap();
    }
}
