//! Shared agent state: lifecycle phase, write lock, installed topology.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use hlo_core::{NodeAddr, NodePhase, Topology};

/// State every agent task reads and the admin listener mutates.
///
/// The write lock is a plain flag rather than part of the phase: it is
/// only meaningful while the node is started, and it must survive a
/// topology install happening at the same time.
#[derive(Debug)]
pub struct AgentState {
    addr: NodeAddr,
    phase: RwLock<NodePhase>,
    write_locked: AtomicBool,
    topology: RwLock<Topology>,
}

impl AgentState {
    #[must_use]
    pub fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            phase: RwLock::new(NodePhase::Provisioned),
            write_locked: AtomicBool::new(false),
            topology: RwLock::new(Topology::new()),
        }
    }

    #[must_use]
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    pub async fn phase(&self) -> NodePhase {
        *self.phase.read().await
    }

    pub async fn set_phase(&self, phase: NodePhase) {
        *self.phase.write().await = phase;
    }

    pub async fn is_serving(&self) -> bool {
        self.phase.read().await.is_serving()
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.write_locked.load(Ordering::Acquire)
    }

    pub fn set_write_locked(&self, locked: bool) {
        self.write_locked.store(locked, Ordering::Release);
    }

    /// Snapshot of the currently installed topology.
    pub async fn topology(&self) -> Topology {
        self.topology.read().await.clone()
    }

    pub async fn install_topology(&self, topology: Topology) {
        *self.topology.write().await = topology;
    }
}
