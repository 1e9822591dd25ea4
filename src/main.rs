use anyhow::anyhow;
use clap::Parser;
use forkgossip::{
    config,
    debug::{DebugDataDumper, FileDumper, NoopDumper},
    metrics::{self, GossipMetrics},
    network::{self, load_or_create_peer_identity},
    GossipContext, GossipForkSubscriptions, MessageClass, OperationProcessor, OperationProcessors,
    ForkSchedule, ValidationResult,
};
use futures::future::{self, BoxFuture, FutureExt};
use libp2p::identity;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Fork-scoped beacon gossip node")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine network gossip logs
    #[arg(long, default_value_t = false)]
    quiet_net: bool,

    /// Start as if the head were optimistic
    #[arg(long, default_value_t = false)]
    optimistic: bool,

    /// Attestation subnets to join at startup
    #[arg(long = "subnet")]
    subnets: Vec<u64>,
}

/// Logs inbound messages without forwarding them. No verification backend
/// is wired into the standalone node.
struct LogOnly(MessageClass);

impl<T: Debug + Send + 'static> OperationProcessor<T> for LogOnly {
    fn process(&self, message: T) -> BoxFuture<'static, ValidationResult> {
        info!(class = %self.0, ?message, "Gossip message");
        future::ready(ValidationResult::Ignore).boxed()
    }
}

fn log_only_processors() -> OperationProcessors {
    OperationProcessors {
        block: Arc::new(LogOnly(MessageClass::Block)),
        attestation: Arc::new(LogOnly(MessageClass::Attestation)),
        aggregate: Arc::new(LogOnly(MessageClass::Aggregate)),
        attester_slashing: Arc::new(LogOnly(MessageClass::AttesterSlashing)),
        proposer_slashing: Arc::new(LogOnly(MessageClass::ProposerSlashing)),
        voluntary_exit: Arc::new(LogOnly(MessageClass::VoluntaryExit)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.quiet_net {
        "info,forkgossip::network=warn,forkgossip::channel=warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let cfg = config::load(&cli.config)?;
    let genesis_validators_root = cfg.chain.genesis_validators_root()?;
    let schedule = Arc::new(ForkSchedule::new(cfg.chain.forks()?, genesis_validators_root));
    let fork = schedule.fork_at_epoch(cfg.chain.current_epoch)?;
    let genesis_validators_root =
        genesis_validators_root.ok_or_else(|| anyhow!("chain.genesis_validators_root is required to gossip"))?;

    let gossip_metrics = GossipMetrics::new()?;
    metrics::serve(cfg.metrics.clone(), gossip_metrics.registry().clone())?;

    let keypair = match &cfg.net.identity_path {
        Some(path) => load_or_create_peer_identity(path)?,
        None => identity::Keypair::generate_ed25519(),
    };
    let net = network::spawn(cfg.net.clone(), cfg.gossip.clone(), keypair).await?;

    let debug_dumper: Arc<dyn DebugDataDumper> = match &cfg.gossip.debug_dump_dir {
        Some(dir) => Arc::new(FileDumper::spawn(dir)),
        None => Arc::new(NoopDumper),
    };
    let ctx = GossipContext {
        runtime: tokio::runtime::Handle::current(),
        network: net,
        metrics: gossip_metrics,
        debug_dumper,
        settings: cfg.gossip.clone(),
    };

    let controller = GossipForkSubscriptions::new(fork, schedule.clone(), ctx, log_only_processors());
    controller.start_gossip(genesis_validators_root, cli.optimistic)?;
    for id in &cli.subnets {
        controller.subscribe_to_attestation_subnet_id(*id)?;
    }
    controller.settled().await;
    info!(?controller, next_fork_epoch = ?schedule.next_fork_epoch(cfg.chain.current_epoch), "Gossip running");

    signal::ctrl_c().await?;
    controller.stop_gossip();
    controller.settled().await;
    info!("Gossip stopped");
    Ok(())
}
