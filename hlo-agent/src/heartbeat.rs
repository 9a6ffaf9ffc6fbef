//! Gossip heartbeat.
//!
//! Every node probes its two clockwise ring successors on their gossip
//! ports. A neighbor that cannot be reached, or answers anything but a
//! clean confirmation, is reported to the coordinator's failure port by
//! main address. Reporting is fire-and-forget; the coordinator decides
//! what a report means.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use hlo_core::NodeAddr;
use hlo_net::{dispatch_command, send_report, AdminMessage, ChannelConfig, CommandChannel, Confirmation};

use crate::state::AgentState;

/// Probe cadence and timeouts.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between probe rounds.
    pub interval: Duration,
    /// Channel timeouts for probes; tighter than admin traffic since a
    /// ping carries no work.
    pub channel: ChannelConfig,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            channel: ChannelConfig {
                connect_timeout: Duration::from_secs(2),
                io_timeout: Duration::from_secs(2),
                confirm_timeout: Duration::from_secs(2),
            },
        }
    }
}

pub(crate) async fn run_heartbeat(
    state: Arc<AgentState>,
    report_addr: SocketAddr,
    config: HeartbeatConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                probe_round(&state, report_addr, &config).await;
            }
            _ = shutdown_rx.recv() => {
                debug!(target: "halo::gossip", "Heartbeat stopping");
                break;
            }
        }
    }
}

async fn probe_round(state: &AgentState, report_addr: SocketAddr, config: &HeartbeatConfig) {
    let topology = state.topology().await;
    if topology.is_empty() {
        return;
    }
    let myself = state.addr();
    let succ1 = match topology.successor_of(myself) {
        Ok(entry) => entry.addr,
        Err(e) => {
            debug!(target: "halo::gossip", error = %e, "Topology does not place this node yet");
            return;
        },
    };
    let succ2 = match topology.successor_of(succ1) {
        Ok(entry) => entry.addr,
        Err(e) => {
            debug!(target: "halo::gossip", error = %e, "Topology truncated mid-walk");
            return;
        },
    };

    let mut probed = Vec::with_capacity(2);
    for neighbor in [succ1, succ2] {
        if neighbor == myself || probed.contains(&neighbor) {
            continue;
        }
        probed.push(neighbor);
        probe(myself, neighbor, report_addr, config).await;
    }
}

async fn probe(
    myself: NodeAddr,
    neighbor: NodeAddr,
    report_addr: SocketAddr,
    config: &HeartbeatConfig,
) {
    let answer = dispatch_command(neighbor.gossip_addr(), &AdminMessage::Ping, &config.channel).await;
    if matches!(answer, Ok(confirmation) if confirmation.is_executed()) {
        trace!(target: "halo::gossip", neighbor = %neighbor, "Neighbor alive");
        return;
    }
    warn!(
        target: "halo::gossip",
        node = %myself,
        neighbor = %neighbor,
        "Neighbor unresponsive, reporting it down"
    );
    let report = AdminMessage::ServerDown(neighbor);
    if let Err(e) = send_report(report_addr, &report, &config.channel).await {
        debug!(
            target: "halo::gossip",
            report_addr = %report_addr,
            error = %e,
            "Failure report not delivered"
        );
    }
}

/// Accept loop answering gossip probes. Pings get a confirmation, any
/// other valid frame is rejected, garbage is dropped.
pub(crate) async fn run_gossip_responder(
    listener: TcpListener,
    config: ChannelConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let config = config.clone();
                        tokio::spawn(async move {
                            answer_probe(stream, peer, config).await;
                        });
                    },
                    Err(e) => {
                        warn!(target: "halo::gossip", error = %e, "Gossip accept failed");
                    },
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(target: "halo::gossip", "Gossip responder stopping");
                break;
            }
        }
    }
}

async fn answer_probe(stream: TcpStream, peer: SocketAddr, config: ChannelConfig) {
    let mut channel = CommandChannel::from_stream(stream, config);
    match channel.read_message().await {
        Ok(AdminMessage::Ping) => {
            if let Err(e) = channel.send_confirmation(Confirmation::Executed).await {
                debug!(target: "halo::gossip", peer = %peer, error = %e, "Probe reply failed");
            }
        },
        Ok(other) => {
            debug!(
                target: "halo::gossip",
                peer = %peer,
                kind = ?other.kind(),
                "Non-ping frame on gossip port"
            );
            let _ = channel.send_confirmation(Confirmation::Rejected).await;
        },
        Err(e) => {
            debug!(target: "halo::gossip", peer = %peer, error = %e, "Bad gossip frame");
        },
    }
}
