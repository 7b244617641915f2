use clap::{Parser, Subcommand};

use strata_store::transport::InProcessTransport;
use strata_store::{NodeArgs, NodeHooks, ShardNode};

#[derive(Parser, Debug)]
#[command(name = "strata-store-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a shard node.
    Node(NodeArgs),
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

/// Initialize storage and the shard node, then run until ctrl-c.
async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let cfg = args.to_config()?;
    let transport = InProcessTransport::without_faults();
    let node = ShardNode::open(cfg, transport.clone(), NodeHooks::default())?;
    transport.register(node.clone());

    tracing::info!(
        shard_id = node.shard(),
        ledger_ready = node.ledger().is_ready(),
        "strata node running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
