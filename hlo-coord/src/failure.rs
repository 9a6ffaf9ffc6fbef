//! Failure-report intake and crash handling.
//!
//! Nodes report dead neighbors to the coordinator's report port. The
//! listener only queues the reports; a single crash-handler loop
//! consumes them, so no two ring repairs ever run concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use hlo_core::NodeAddr;
use hlo_net::{AdminMessage, ChannelConfig, CommandChannel};

use crate::coordinator::Coordinator;

/// Inbound failure reports, in arrival order.
#[derive(Debug, Default)]
pub struct ReportQueue {
    reports: Mutex<VecDeque<NodeAddr>>,
}

impl ReportQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, addr: NodeAddr) {
        self.reports.lock().await.push_back(addr);
    }

    pub async fn take_next(&self) -> Option<NodeAddr> {
        self.reports.lock().await.pop_front()
    }

    /// Drops every queued report naming `addr`. Neighbors report the
    /// same dead node independently, so one crash usually queues more
    /// than one report.
    pub async fn purge(&self, addr: NodeAddr) {
        self.reports.lock().await.retain(|a| *a != addr);
    }

    pub async fn len(&self) -> usize {
        self.reports.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reports.lock().await.is_empty()
    }
}

/// Accepts failure reports and queues them. Reports get no reply.
pub async fn run_failure_listener(
    listener: TcpListener,
    queue: Arc<ReportQueue>,
    config: ChannelConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else {
                    continue;
                };
                let queue = Arc::clone(&queue);
                let config = config.clone();
                tokio::spawn(async move {
                    let mut channel = CommandChannel::from_stream(stream, config);
                    match channel.read_message().await {
                        Ok(AdminMessage::ServerDown(addr)) => {
                            info!(
                                target: "halo::report",
                                node = %addr,
                                reporter = %peer,
                                "Failure report received"
                            );
                            queue.push(addr).await;
                        },
                        Ok(other) => {
                            warn!(
                                target: "halo::report",
                                command = ?other.kind(),
                                reporter = %peer,
                                "Unexpected message on the report port"
                            );
                        },
                        Err(e) => {
                            debug!(
                                target: "halo::report",
                                reporter = %peer,
                                error = %e,
                                "Discarding unreadable report"
                            );
                        },
                    }
                });
            },
            _ = shutdown_rx.recv() => {
                debug!(target: "halo::report", "Failure listener shutting down");
                break;
            },
        }
    }
}

/// Drains the report queue on a fixed interval, repairing one crashed
/// node at a time.
pub async fn run_crash_handler(
    coordinator: Arc<Coordinator>,
    queue: Arc<ReportQueue>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                drain_reports(&coordinator, &queue).await;
            },
            _ = shutdown_rx.recv() => {
                debug!(target: "halo::report", "Crash handler shutting down");
                break;
            },
        }
    }
}

async fn drain_reports(coordinator: &Coordinator, queue: &ReportQueue) {
    while let Some(addr) = queue.take_next().await {
        if let Err(e) = coordinator.remove_crashed(addr).await {
            warn!(
                target: "halo::report",
                node = %addr,
                error = %e,
                "Crash removal failed"
            );
        }
        // Duplicates for the node just handled are already covered by
        // the down set.
        queue.purge(addr).await;
    }
}
