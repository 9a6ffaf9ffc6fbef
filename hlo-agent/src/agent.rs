//! Agent assembly and lifecycle.
//!
//! One agent runs one cache node's coordination side: the admin
//! listener, the gossip responder, the transfer listener and the
//! heartbeat prober, all sharing one [`AgentState`]. The daemon binary
//! owns the process; the agent only signals when an admin command asks
//! the process to end.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use hlo_core::{EvictionPolicy, NodeAddr, NodePhase, Result, Topology};
use hlo_net::ChannelConfig;

use crate::admin::{run_admin_listener, AdminContext};
use crate::heartbeat::{run_gossip_responder, run_heartbeat, HeartbeatConfig};
use crate::state::AgentState;
use crate::store::{MemoryStore, RangeStore};
use crate::transfer::run_transfer_listener;

/// Static configuration of one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node identity; admin and gossip listeners bind the derived ports.
    pub addr: NodeAddr,
    /// Capacity the cache engine behind the store seam was provisioned
    /// with. Carried for re-provisioning, not enforced here.
    pub cache_capacity: usize,
    pub policy: EvictionPolicy,
    /// Where failure reports go: the coordinator's report listener.
    pub report_addr: SocketAddr,
    pub heartbeat: HeartbeatConfig,
    pub channel: ChannelConfig,
}

impl AgentConfig {
    #[must_use]
    pub fn new(
        addr: NodeAddr,
        cache_capacity: usize,
        policy: EvictionPolicy,
        report_addr: SocketAddr,
    ) -> Self {
        Self {
            addr,
            cache_capacity,
            policy,
            report_addr,
            heartbeat: HeartbeatConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Why an agent wants its process to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Shut-down command executed: writes locked, serving stopped,
    /// confirmation sent.
    ShutDown,
    /// Crash command: die immediately, nothing was confirmed.
    Crash,
}

/// Outcome of a gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    Updated,
    WriteLocked,
    NotServing,
    NotResponsible,
}

/// Outcome of a gated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Value(String),
    Missing,
    NotServing,
    NotResponsible,
}

/// Handle to a running agent; dropping it does not stop the tasks, call
/// [`AgentHandle::shutdown`] or [`AgentHandle::abort`].
pub struct AgentHandle {
    state: Arc<AgentState>,
    store: Arc<dyn RangeStore>,
    cache_capacity: usize,
    policy: EvictionPolicy,
    shutdown_tx: broadcast::Sender<()>,
    term_tx: broadcast::Sender<Termination>,
    tasks: Vec<JoinHandle<()>>,
}

/// Start an agent with its own in-memory store.
///
/// # Errors
///
/// Fails when any of the three listeners cannot bind its derived port.
pub async fn spawn(config: AgentConfig) -> Result<AgentHandle> {
    spawn_with_store(config, Arc::new(MemoryStore::new())).await
}

/// Start an agent on a caller-provided store.
///
/// # Errors
///
/// Fails when any of the three listeners cannot bind its derived port.
pub async fn spawn_with_store(
    config: AgentConfig,
    store: Arc<dyn RangeStore>,
) -> Result<AgentHandle> {
    let transfer_listener = TcpListener::bind(config.addr.main_addr()).await?;
    let admin_listener = TcpListener::bind(config.addr.admin_addr()).await?;
    let gossip_listener = TcpListener::bind(config.addr.gossip_addr()).await?;

    let state = Arc::new(AgentState::new(config.addr));
    let (shutdown_tx, _) = broadcast::channel(4);
    let (term_tx, _) = broadcast::channel(4);

    let ctx = Arc::new(AdminContext {
        state: Arc::clone(&state),
        store: Arc::clone(&store),
        report_addr: config.report_addr,
        channel: config.channel.clone(),
        term_tx: term_tx.clone(),
    });

    let tasks = vec![
        tokio::spawn(run_admin_listener(
            admin_listener,
            ctx,
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(run_gossip_responder(
            gossip_listener,
            config.channel.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(run_transfer_listener(
            transfer_listener,
            Arc::clone(&store),
            config.channel.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(run_heartbeat(
            Arc::clone(&state),
            config.report_addr,
            config.heartbeat.clone(),
            shutdown_tx.subscribe(),
        )),
    ];

    info!(
        target: "halo::agent",
        node = %config.addr,
        admin_port = config.addr.admin_port(),
        gossip_port = config.addr.gossip_port(),
        policy = %config.policy,
        capacity = config.cache_capacity,
        "Agent listening"
    );

    Ok(AgentHandle {
        state,
        store,
        cache_capacity: config.cache_capacity,
        policy: config.policy,
        shutdown_tx,
        term_tx,
        tasks,
    })
}

impl AgentHandle {
    #[must_use]
    pub fn addr(&self) -> NodeAddr {
        self.state.addr()
    }

    pub async fn phase(&self) -> NodePhase {
        self.state.phase().await
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.is_write_locked()
    }

    pub async fn topology(&self) -> Topology {
        self.state.topology().await
    }

    #[must_use]
    pub fn stored_entries(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Receiver that fires when an admin command asks the process to end.
    #[must_use]
    pub fn subscribe_termination(&self) -> broadcast::Receiver<Termination> {
        self.term_tx.subscribe()
    }

    /// Write through the agent's gates: serving phase, then primary
    /// ownership, then the write lock.
    pub async fn put(&self, key: &str, value: &str) -> WriteOutcome {
        if !self.state.is_serving().await {
            return WriteOutcome::NotServing;
        }
        let responsible = self
            .state
            .topology()
            .await
            .within_writing_range(self.state.addr(), key.as_bytes())
            .unwrap_or(false);
        if !responsible {
            return WriteOutcome::NotResponsible;
        }
        if self.state.is_write_locked() {
            return WriteOutcome::WriteLocked;
        }
        match self.store.insert(key.to_string(), value.to_string()) {
            None => WriteOutcome::Stored,
            Some(_) => WriteOutcome::Updated,
        }
    }

    /// Read through the agent's gates: serving phase, then replica
    /// coverage. Reads are never blocked by the write lock.
    pub async fn get(&self, key: &str) -> ReadOutcome {
        if !self.state.is_serving().await {
            return ReadOutcome::NotServing;
        }
        let readable = self
            .state
            .topology()
            .await
            .within_reading_range(self.state.addr(), key.as_bytes())
            .unwrap_or(false);
        if !readable {
            return ReadOutcome::NotResponsible;
        }
        match self.store.get(key) {
            Some(value) => ReadOutcome::Value(value),
            None => ReadOutcome::Missing,
        }
    }

    /// Stop all tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Kill all tasks without any teardown. Crash simulation.
    pub fn abort(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use hlo_net::{dispatch_command, AdminMessage};

    static NEXT_BASE: AtomicU32 = AtomicU32::new(0);

    /// Reserve a main port whose +100/+200 siblings are also free.
    async fn reserve_node_addr() -> NodeAddr {
        loop {
            let n = NEXT_BASE.fetch_add(1, Ordering::SeqCst);
            let base = 42000 + u16::try_from((n * 300) % 20100).unwrap();
            let mut held = Vec::new();
            let mut all_free = true;
            for port in [base, base + 100, base + 200] {
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => held.push(listener),
                    Err(_) => {
                        all_free = false;
                        break;
                    },
                }
            }
            drop(held);
            if all_free {
                return NodeAddr::new(Ipv4Addr::LOCALHOST, base);
            }
        }
    }

    fn quiet_config(addr: NodeAddr) -> AgentConfig {
        let mut config = AgentConfig::new(
            addr,
            1000,
            EvictionPolicy::Lru,
            "127.0.0.1:1".parse().unwrap(),
        );
        // Keep the prober idle for the test's lifetime.
        config.heartbeat.interval = Duration::from_secs(60);
        config.channel = ChannelConfig {
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
            confirm_timeout: Duration::from_millis(500),
        };
        config
    }

    async fn admin(handle: &AgentHandle, message: AdminMessage) {
        let confirmation = dispatch_command(
            handle.addr().admin_addr(),
            &message,
            &ChannelConfig::default(),
        )
        .await
        .unwrap();
        assert!(confirmation.is_executed());
    }

    #[tokio::test]
    async fn test_agent_gates_until_started() {
        let addr = reserve_node_addr().await;
        let handle = spawn(quiet_config(addr)).await.unwrap();

        assert_eq!(handle.put("k", "v").await, WriteOutcome::NotServing);
        assert_eq!(handle.get("k").await, ReadOutcome::NotServing);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_serves_own_range_after_start() {
        let addr = reserve_node_addr().await;
        let handle = spawn(quiet_config(addr)).await.unwrap();

        let mut topology = Topology::new();
        topology.insert(addr).unwrap();
        admin(&handle, AdminMessage::Topology(topology)).await;
        admin(&handle, AdminMessage::Start).await;

        assert_eq!(handle.put("k", "v1").await, WriteOutcome::Stored);
        assert_eq!(handle.put("k", "v2").await, WriteOutcome::Updated);
        assert_eq!(handle.get("k").await, ReadOutcome::Value("v2".into()));
        assert_eq!(handle.get("other").await, ReadOutcome::Missing);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_lock_blocks_writes_not_reads() {
        let addr = reserve_node_addr().await;
        let handle = spawn(quiet_config(addr)).await.unwrap();

        let mut topology = Topology::new();
        topology.insert(addr).unwrap();
        admin(&handle, AdminMessage::Topology(topology)).await;
        admin(&handle, AdminMessage::Start).await;
        assert_eq!(handle.put("k", "v").await, WriteOutcome::Stored);

        admin(&handle, AdminMessage::LockWrite).await;
        assert_eq!(handle.put("k", "v2").await, WriteOutcome::WriteLocked);
        assert_eq!(handle.get("k").await, ReadOutcome::Value("v".into()));

        admin(&handle, AdminMessage::UnlockWrite).await;
        assert_eq!(handle.put("k", "v2").await, WriteOutcome::Updated);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_writes_refused_outside_own_range() {
        let addr = reserve_node_addr().await;
        let handle = spawn(quiet_config(addr)).await.unwrap();

        // Several (unreachable) members take most of the circle away.
        let mut topology = Topology::new();
        topology.insert(addr).unwrap();
        for i in 1..=5u8 {
            topology
                .insert(NodeAddr::new(Ipv4Addr::new(10, 9, 9, i), 6000))
                .unwrap();
        }
        admin(&handle, AdminMessage::Topology(topology.clone())).await;
        admin(&handle, AdminMessage::Start).await;

        let foreign_key = (0..2000)
            .map(|i| format!("key-{i}"))
            .find(|k| {
                !topology
                    .within_writing_range(addr, k.as_bytes())
                    .unwrap()
            })
            .unwrap();
        assert_eq!(
            handle.put(&foreign_key, "v").await,
            WriteOutcome::NotResponsible
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_command_signals_termination() {
        let addr = reserve_node_addr().await;
        let handle = spawn(quiet_config(addr)).await.unwrap();
        let mut term_rx = handle.subscribe_termination();

        admin(&handle, AdminMessage::ShutDown).await;
        assert_eq!(term_rx.recv().await.unwrap(), Termination::ShutDown);
        assert_eq!(handle.phase().await, NodePhase::ShutDown);
        assert!(handle.is_write_locked());

        handle.shutdown().await;
    }
}
