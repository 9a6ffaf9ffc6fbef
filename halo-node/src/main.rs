#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod shutdown;

use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::{error, info};

use hlo_agent::{AgentConfig, Termination};
use hlo_core::{EvictionPolicy, NodeAddr};

#[derive(Parser, Debug)]
#[command(name = "halo-node")]
#[command(about = "HALO node daemon - one cache node of a HALO cluster")]
#[command(version)]
struct Args {
    /// Address this node is reachable at from the rest of the cluster
    #[arg(long)]
    ip: Ipv4Addr,

    /// Main service port; admin and gossip ports are derived from it
    #[arg(long)]
    port: u16,

    /// Capacity of the local cache, in entries
    #[arg(long, default_value = "1000")]
    cache_capacity: usize,

    /// Eviction policy: "fifo", "lru" or "lfu"
    #[arg(long, default_value = "fifo")]
    policy: String,

    /// Coordinator address for failure reports
    #[arg(long)]
    report_addr: SocketAddr,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_tracing();

    let policy = match args.policy.parse::<EvictionPolicy>() {
        Ok(policy) => policy,
        Err(e) => {
            error!(target: "halo::node", error = %e, "Bad --policy value");
            std::process::exit(1);
        },
    };
    let addr = NodeAddr::new(args.ip, args.port);

    info!(
        target: "halo::node",
        addr = %addr,
        admin_port = addr.admin_port(),
        gossip_port = addr.gossip_port(),
        cache_capacity = args.cache_capacity,
        policy = %policy,
        report_addr = %args.report_addr,
        "Starting HALO node"
    );

    let config = AgentConfig::new(addr, args.cache_capacity, policy, args.report_addr);
    let handle = match hlo_agent::spawn(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(target: "halo::node", error = %e, "Failed to start the agent");
            std::process::exit(1);
        },
    };
    let mut term_rx = handle.subscribe_termination();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let shutdown_signal = shutdown::install_signal_handlers(shutdown_tx.clone());

    tokio::select! {
        _ = shutdown_signal => {
            info!(target: "halo::node", "Shutdown signal received");
            handle.shutdown().await;
        }
        termination = term_rx.recv() => {
            match termination {
                Ok(Termination::ShutDown) => {
                    info!(target: "halo::node", "Shut down by the coordinator");
                    handle.shutdown().await;
                },
                Ok(Termination::Crash) => {
                    // Simulated hard failure: die without any cleanup.
                    error!(target: "halo::node", "Crash ordered, terminating immediately");
                    std::process::exit(1);
                },
                Err(e) => {
                    error!(target: "halo::node", error = %e, "Agent tasks ended unexpectedly");
                    handle.shutdown().await;
                },
            }
        }
    }

    info!(target: "halo::node", "HALO node shutdown complete");
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,halo=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
