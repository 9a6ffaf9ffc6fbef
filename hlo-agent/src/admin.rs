//! Admin command listener.
//!
//! The coordinator drives a node through one-shot connections on the
//! admin port: read one command, execute it, answer one confirmation
//! byte, close. `Crash` is the exception and dies silently.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use hlo_core::NodePhase;
use hlo_net::{AdminMessage, ChannelConfig, CommandChannel, Confirmation};

use crate::agent::Termination;
use crate::state::AgentState;
use crate::store::RangeStore;
use crate::transfer;

/// Everything an admin connection needs to execute commands.
pub(crate) struct AdminContext {
    pub state: Arc<AgentState>,
    pub store: Arc<dyn RangeStore>,
    pub report_addr: SocketAddr,
    pub channel: ChannelConfig,
    pub term_tx: broadcast::Sender<Termination>,
}

pub(crate) async fn run_admin_listener(
    listener: TcpListener,
    ctx: Arc<AdminContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            handle_connection(stream, peer, ctx).await;
                        });
                    },
                    Err(e) => {
                        warn!(target: "halo::agent", error = %e, "Admin accept failed");
                    },
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(target: "halo::agent", "Admin listener stopping");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<AdminContext>) {
    let mut channel = CommandChannel::from_stream(stream, ctx.channel.clone());
    let message = match channel.read_message().await {
        Ok(message) => message,
        Err(e) => {
            warn!(target: "halo::agent", peer = %peer, error = %e, "Bad admin frame");
            return;
        },
    };

    if matches!(message, AdminMessage::Crash) {
        warn!(
            target: "halo::agent",
            node = %ctx.state.addr(),
            "Crash ordered, terminating without reply"
        );
        let _ = ctx.term_tx.send(Termination::Crash);
        return;
    }

    let kind = message.kind();
    let (confirmation, termination) = execute(message, &ctx).await;
    debug!(
        target: "halo::agent",
        peer = %peer,
        kind = ?kind,
        confirmation = ?confirmation,
        "Admin command executed"
    );
    if let Err(e) = channel.send_confirmation(confirmation).await {
        warn!(target: "halo::agent", peer = %peer, error = %e, "Failed to confirm admin command");
    }
    // The confirmation goes out before the process starts tearing down.
    if let Some(termination) = termination {
        let _ = ctx.term_tx.send(termination);
    }
}

async fn execute(message: AdminMessage, ctx: &AdminContext) -> (Confirmation, Option<Termination>) {
    match message {
        AdminMessage::Start => {
            ctx.state.set_phase(NodePhase::Started).await;
            info!(target: "halo::agent", node = %ctx.state.addr(), "Node started");
            (Confirmation::Executed, None)
        },
        AdminMessage::Stop => {
            ctx.state.set_phase(NodePhase::Stopped).await;
            info!(target: "halo::agent", node = %ctx.state.addr(), "Node stopped");
            (Confirmation::Executed, None)
        },
        AdminMessage::ShutDown => {
            ctx.state.set_write_locked(true);
            ctx.state.set_phase(NodePhase::ShutDown).await;
            info!(target: "halo::agent", node = %ctx.state.addr(), "Node shutting down");
            (Confirmation::Executed, Some(Termination::ShutDown))
        },
        AdminMessage::Topology(topology) => {
            info!(
                target: "halo::agent",
                node = %ctx.state.addr(),
                members = topology.len(),
                "Topology installed"
            );
            ctx.state.install_topology(topology).await;
            (Confirmation::Executed, None)
        },
        AdminMessage::LockWrite => {
            ctx.state.set_write_locked(true);
            (Confirmation::Executed, None)
        },
        AdminMessage::UnlockWrite => {
            ctx.state.set_write_locked(false);
            (Confirmation::Executed, None)
        },
        AdminMessage::Ping => (Confirmation::Executed, None),
        AdminMessage::MoveData { target, range } => {
            let confirmation = transfer::execute_push(
                &ctx.store,
                &ctx.channel,
                ctx.report_addr,
                target,
                range,
                true,
            )
            .await;
            (confirmation, None)
        },
        AdminMessage::ReplicateData { target, range } => {
            let confirmation = transfer::execute_push(
                &ctx.store,
                &ctx.channel,
                ctx.report_addr,
                target,
                range,
                false,
            )
            .await;
            (confirmation, None)
        },
        AdminMessage::DeleteData { owner, range } => {
            let removed = ctx.store.remove_range(&range);
            debug!(
                target: "halo::agent",
                owner = %owner,
                range = %range,
                removed,
                "Range deleted"
            );
            (Confirmation::Executed, None)
        },
        AdminMessage::ServerDown(reported) => {
            warn!(
                target: "halo::agent",
                reported = %reported,
                "Failure report arrived on admin port, rejecting"
            );
            (Confirmation::Rejected, None)
        },
        // Intercepted before the reply path.
        AdminMessage::Crash => (Confirmation::Rejected, None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use hlo_core::{KeyRange, NodeAddr, Position, Topology};
    use hlo_net::dispatch_command;

    use crate::store::MemoryStore;

    struct Harness {
        addr: SocketAddr,
        state: Arc<AgentState>,
        store: Arc<dyn RangeStore>,
        term_rx: broadcast::Receiver<Termination>,
        _shutdown_tx: broadcast::Sender<()>,
    }

    fn quick() -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
            confirm_timeout: Duration::from_millis(500),
        }
    }

    async fn boot() -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(AgentState::new(NodeAddr::new(Ipv4Addr::LOCALHOST, 6000)));
        let store: Arc<dyn RangeStore> = Arc::new(MemoryStore::new());
        let (term_tx, term_rx) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let ctx = Arc::new(AdminContext {
            state: Arc::clone(&state),
            store: Arc::clone(&store),
            report_addr: "127.0.0.1:1".parse().unwrap(),
            channel: quick(),
            term_tx,
        });
        tokio::spawn(run_admin_listener(listener, ctx, shutdown_rx));

        Harness {
            addr,
            state,
            store,
            term_rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn send(harness: &Harness, message: AdminMessage) -> Confirmation {
        dispatch_command(harness.addr, &message, &quick())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_toggle_phase() {
        let harness = boot().await;

        assert!(send(&harness, AdminMessage::Start).await.is_executed());
        assert_eq!(harness.state.phase().await, NodePhase::Started);

        assert!(send(&harness, AdminMessage::Stop).await.is_executed());
        assert_eq!(harness.state.phase().await, NodePhase::Stopped);
    }

    #[tokio::test]
    async fn test_lock_and_unlock_writes() {
        let harness = boot().await;

        assert!(send(&harness, AdminMessage::LockWrite).await.is_executed());
        assert!(harness.state.is_write_locked());

        assert!(send(&harness, AdminMessage::UnlockWrite).await.is_executed());
        assert!(!harness.state.is_write_locked());
    }

    #[tokio::test]
    async fn test_topology_install() {
        let harness = boot().await;

        let mut topology = Topology::new();
        topology
            .insert(NodeAddr::new(Ipv4Addr::new(10, 0, 0, 1), 6000))
            .unwrap();
        topology
            .insert(NodeAddr::new(Ipv4Addr::new(10, 0, 0, 2), 6000))
            .unwrap();

        assert!(send(&harness, AdminMessage::Topology(topology.clone()))
            .await
            .is_executed());
        assert_eq!(harness.state.topology().await, topology);
    }

    #[tokio::test]
    async fn test_ping_on_admin_port() {
        let harness = boot().await;
        assert!(send(&harness, AdminMessage::Ping).await.is_executed());
    }

    #[tokio::test]
    async fn test_delete_data_drops_range() {
        let harness = boot().await;
        harness.store.insert("doomed".into(), "1".into());
        harness.store.insert("spared".into(), "2".into());

        let p = Position::of(b"doomed");
        let message = AdminMessage::DeleteData {
            owner: NodeAddr::new(Ipv4Addr::new(10, 0, 0, 9), 6000),
            range: KeyRange::new(p, p),
        };
        assert!(send(&harness, message).await.is_executed());
        assert!(harness.store.get("doomed").is_none());
        assert_eq!(harness.store.get("spared").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_server_down_rejected_on_admin_port() {
        let harness = boot().await;
        let message = AdminMessage::ServerDown(NodeAddr::new(Ipv4Addr::new(10, 0, 0, 9), 6000));
        assert_eq!(send(&harness, message).await, Confirmation::Rejected);
    }

    #[tokio::test]
    async fn test_shutdown_confirms_then_terminates() {
        let mut harness = boot().await;

        assert!(send(&harness, AdminMessage::ShutDown).await.is_executed());
        assert_eq!(harness.state.phase().await, NodePhase::ShutDown);
        assert!(harness.state.is_write_locked());
        assert_eq!(harness.term_rx.recv().await.unwrap(), Termination::ShutDown);
    }

    #[tokio::test]
    async fn test_crash_terminates_without_reply() {
        let mut harness = boot().await;

        // No confirmation ever comes back, so the dispatch must fail.
        let result = dispatch_command(harness.addr, &AdminMessage::Crash, &quick()).await;
        assert!(result.is_err());
        assert_eq!(harness.term_rx.recv().await.unwrap(), Termination::Crash);
    }
}
