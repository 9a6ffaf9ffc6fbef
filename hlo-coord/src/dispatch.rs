//! Command fan-out from the coordinator to node admin ports.

use futures::future::join_all;
use tracing::{debug, warn};

use hlo_core::NodeAddr;
use hlo_net::{dispatch_command, AdminMessage, ChannelConfig};

/// Sends admin commands and reduces group outcomes to a single bool.
///
/// Every failure is logged here so call sites only deal with the
/// boolean verdict.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    channel: ChannelConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(channel: ChannelConfig) -> Self {
        Self { channel }
    }

    /// Sends one command to one node's admin port. Returns true only
    /// for an `Executed` confirmation.
    pub async fn send(&self, node: NodeAddr, message: &AdminMessage) -> bool {
        match dispatch_command(node.admin_addr(), message, &self.channel).await {
            Ok(confirmation) if confirmation.is_executed() => true,
            Ok(_) => {
                warn!(
                    target: "halo::dispatch",
                    node = %node,
                    command = ?message.kind(),
                    "Node rejected command"
                );
                false
            },
            Err(e) => {
                warn!(
                    target: "halo::dispatch",
                    node = %node,
                    command = ?message.kind(),
                    error = %e,
                    "Command delivery failed"
                );
                false
            },
        }
    }

    /// Liveness check against the node's admin port.
    pub async fn ping(&self, node: NodeAddr) -> bool {
        self.send(node, &AdminMessage::Ping).await
    }

    /// Sends the same command to every node concurrently. Returns true
    /// only if every node executed it.
    pub async fn broadcast(&self, nodes: &[NodeAddr], message: &AdminMessage) -> bool {
        let sends = nodes.iter().map(|node| self.send(*node, message));
        let outcomes = join_all(sends).await;
        let ok = outcomes.iter().all(|executed| *executed);
        debug!(
            target: "halo::dispatch",
            command = ?message.kind(),
            nodes = nodes.len(),
            ok = ok,
            "Group command finished"
        );
        ok
    }

    /// Fire-and-forget send for commands that never answer, like
    /// `Crash`.
    pub fn send_detached(&self, node: NodeAddr, message: AdminMessage) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch_command(node.admin_addr(), &message, &channel).await {
                debug!(
                    target: "halo::dispatch",
                    node = %node,
                    command = ?message.kind(),
                    error = %e,
                    "Detached command ended with error"
                );
            }
        });
    }
}
