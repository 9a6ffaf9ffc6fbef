#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod shutdown;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use hlo_coord::{
    run_crash_handler, run_failure_listener, Coordinator, CoordinatorConfig, ReportQueue,
    SshLauncher,
};

#[derive(Parser, Debug)]
#[command(name = "halo")]
#[command(about = "HALO - Hash-ring Allocation and Liveness Orchestrator")]
#[command(version)]
struct Args {
    /// Coordinator configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {e}");
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let Some(config_path) = args.config else {
        error!(
            target: "halo",
            "No config file given; run with --config, or --gen-config to create one"
        );
        std::process::exit(1);
    };
    let config = match CoordinatorConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                target: "halo",
                error = %e,
                path = %config_path.display(),
                "Failed to load config file"
            );
            std::process::exit(1);
        },
    };
    if config.slots.is_empty() {
        error!(target: "halo", "Config lists no node slots");
        std::process::exit(1);
    }

    info!(
        target: "halo",
        report_addr = %config.report_addr,
        slots = config.slots.len(),
        initial_nodes = config.initial_nodes,
        "Starting HALO coordinator"
    );

    let launcher = Arc::new(SshLauncher::new(
        config.launch.remote_bin.clone(),
        config.launch.remote_dir.clone(),
    ));
    let coordinator = match Coordinator::new(&config, launcher) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(target: "halo", error = %e, "Invalid slot inventory");
            std::process::exit(1);
        },
    };

    let report_listener = match tokio::net::TcpListener::bind(config.report_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                target: "halo",
                error = %e,
                addr = %config.report_addr,
                "Failed to bind the failure-report port"
            );
            std::process::exit(1);
        },
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let shutdown_signal = shutdown::install_signal_handlers(shutdown_tx.clone());

    let queue = Arc::new(ReportQueue::new());
    tokio::spawn(run_failure_listener(
        report_listener,
        Arc::clone(&queue),
        config.channel_config(),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(run_crash_handler(
        Arc::clone(&coordinator),
        Arc::clone(&queue),
        config.crash_check_interval(),
        shutdown_tx.subscribe(),
    ));

    if let Err(e) = coordinator
        .bootstrap(
            config.initial_nodes,
            config.cache_capacity,
            config.eviction_policy(),
        )
        .await
    {
        error!(target: "halo", error = %e, "Bootstrap failed");
        std::process::exit(1);
    }
    if let Err(e) = coordinator.start_all().await {
        error!(target: "halo", error = %e, "Could not start the service");
        std::process::exit(1);
    }
    info!(
        target: "halo",
        nodes = config.initial_nodes,
        "Service is up and serving"
    );

    shutdown_signal.await;

    match coordinator.shut_down().await {
        Ok(()) => info!(target: "halo", "Service shut down"),
        Err(e) => warn!(target: "halo", error = %e, "Service shutdown incomplete"),
    }
    info!(target: "halo", "HALO shutdown complete");
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

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = CoordinatorConfig::default();

    let content = format!(
        r#"# HALO Coordinator Configuration File
# Generated by: halo --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# Address nodes use to report dead neighbors. Must be reachable from
# every slot host, so bind a concrete interface, not 0.0.0.0.
report_addr = "{}"

# Number of nodes provisioned when the coordinator starts.
initial_nodes = {}

# Cache settings handed to every provisioned node.
cache_capacity = {}

# Eviction policy: "fifo", "lru" or "lfu".
eviction_policy = "{}"

# =============================================================================
# Node Slots
# =============================================================================
# Machines the coordinator may place nodes on; the first slot anchors
# every bootstrap. Each node occupies its main port plus two derived
# ports: +100 (admin) and +200 (gossip).

[[slots]]
ip = "10.0.0.1"
port = 6000

[[slots]]
ip = "10.0.0.2"
port = 6000

# =============================================================================
# Launch Settings
# =============================================================================

[launch]
# Node binary started over ssh on the slot host.
remote_bin = "{}"

# Working directory on the remote host, if the binary is not on PATH.
# remote_dir = "/opt/halo"

# Seconds a launched process gets before its liveness ping.
grace_secs = {}

# =============================================================================
# Timing
# =============================================================================

[timing]
# Per-connection timeouts for admin commands.
connect_timeout_secs = {}
io_timeout_secs = {}

# Commands may move data before confirming, so this is the long one.
confirm_timeout_secs = {}

# How often queued failure reports are processed.
crash_check_interval_secs = {}
"#,
        path.display(),
        config.report_addr,
        config.initial_nodes,
        config.cache_capacity,
        config.eviction_policy,
        config.launch.remote_bin,
        config.launch.grace_secs,
        config.timing.connect_timeout_secs,
        config.timing.io_timeout_secs,
        config.timing.confirm_timeout_secs,
        config.timing.crash_check_interval_secs,
    );

    std::fs::write(path, content)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generated_config_parses_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("halo.toml");

        generate_config(&path).unwrap();

        let config = CoordinatorConfig::from_file(&path).unwrap();
        let defaults = CoordinatorConfig::default();
        assert_eq!(config.report_addr, defaults.report_addr);
        assert_eq!(config.initial_nodes, defaults.initial_nodes);
        assert_eq!(config.cache_capacity, defaults.cache_capacity);
        assert_eq!(config.slots.len(), 2);
        assert_eq!(config.launch.remote_bin, defaults.launch.remote_bin);
        assert_eq!(
            config.timing.confirm_timeout_secs,
            defaults.timing.confirm_timeout_secs
        );
    }
}
