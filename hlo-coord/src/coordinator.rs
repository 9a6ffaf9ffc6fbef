//! The cluster coordinator.
//!
//! Owns the authoritative topology, the slot inventory and the down
//! set. Every membership change runs under one lock, so neighbor
//! computations always observe a stable ring and no two changes can
//! interleave.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use hlo_core::{
    EvictionPolicy, HaloError, KeyRange, NodeAddr, NodeRecord, Result, Topology,
};
use hlo_net::AdminMessage;

use crate::config::CoordinatorConfig;
use crate::dispatch::Dispatcher;
use crate::inventory::Inventory;
use crate::launch::NodeLauncher;

struct CoordState {
    topology: Topology,
    members: HashMap<NodeAddr, NodeRecord>,
    inventory: Inventory,
    /// Hosts reported dead. Survives shutdown: a dead host stays dead
    /// until an operator clears it from the slot list.
    down: HashSet<NodeAddr>,
    service_running: bool,
}

pub struct Coordinator {
    state: Mutex<CoordState>,
    dispatcher: Dispatcher,
    launcher: Arc<dyn NodeLauncher>,
    report_addr: SocketAddr,
    launch_grace: Duration,
}

impl Coordinator {
    /// # Errors
    ///
    /// Returns `Inventory` if the configured slots contain duplicates.
    pub fn new(config: &CoordinatorConfig, launcher: Arc<dyn NodeLauncher>) -> Result<Self> {
        let inventory = Inventory::from_addrs(config.slot_addrs())?;
        Ok(Self {
            state: Mutex::new(CoordState {
                topology: Topology::new(),
                members: HashMap::new(),
                inventory,
                down: HashSet::new(),
                service_running: false,
            }),
            dispatcher: Dispatcher::new(config.channel_config()),
            launcher,
            report_addr: config.report_addr,
            launch_grace: config.launch_grace(),
        })
    }

    // ==================== lifecycle ====================

    /// Provisions a fresh ring of `count` nodes and pushes them the
    /// first topology. Nodes come up in the provisioned phase; serving
    /// begins with [`start_all`](Self::start_all).
    ///
    /// All-or-nothing: on failure no coordinator state changes, though
    /// processes launched before the failing step are not reclaimed.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning`; `Inventory` when slots are short; `Rejected`
    /// when a launch or the topology broadcast fails.
    pub async fn bootstrap(
        &self,
        count: usize,
        cache_capacity: usize,
        policy: EvictionPolicy,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.service_running {
            return Err(HaloError::AlreadyRunning);
        }
        let picked = state.inventory.pick_bootstrap_set(count, &state.down)?;
        let records: Vec<NodeRecord> = picked
            .iter()
            .map(|addr| NodeRecord::new(*addr, cache_capacity, policy))
            .collect();

        let mut topology = Topology::new();
        for record in &records {
            topology.insert(record.addr)?;
        }
        info!(target: "halo::coord", nodes = count, "Bootstrapping service");

        if !self.launch_group(&records).await {
            warn!(
                target: "halo::coord",
                "Bootstrap launch failed; any processes already started are left behind"
            );
            return Err(HaloError::Rejected("bootstrap launch failed"));
        }
        let message = AdminMessage::Topology(topology.clone());
        if !self.dispatcher.broadcast(&topology.addrs(), &message).await {
            warn!(target: "halo::coord", "Bootstrap topology broadcast failed");
            return Err(HaloError::Rejected("bootstrap topology broadcast failed"));
        }

        for record in records {
            state.inventory.mark_running(record.addr)?;
            state.members.insert(record.addr, record);
        }
        state.topology = topology;
        state.service_running = true;
        info!(target: "halo::coord", nodes = count, "Service bootstrapped");
        Ok(())
    }

    /// Tells every node to begin serving client traffic.
    ///
    /// # Errors
    ///
    /// `NotRunning`; `Rejected` unless every node confirms.
    pub async fn start_all(&self) -> Result<()> {
        let state = self.state.lock().await;
        if !state.service_running {
            return Err(HaloError::NotRunning);
        }
        let addrs = state.topology.addrs();
        if self.dispatcher.broadcast(&addrs, &AdminMessage::Start).await {
            info!(target: "halo::coord", nodes = addrs.len(), "Service started");
            Ok(())
        } else {
            Err(HaloError::Rejected("some nodes refused to start"))
        }
    }

    /// Pauses client traffic on every node. Topology and data stay.
    ///
    /// # Errors
    ///
    /// `NotRunning`; `Rejected` unless every node confirms.
    pub async fn stop_all(&self) -> Result<()> {
        let state = self.state.lock().await;
        if !state.service_running {
            return Err(HaloError::NotRunning);
        }
        let addrs = state.topology.addrs();
        if self.dispatcher.broadcast(&addrs, &AdminMessage::Stop).await {
            info!(target: "halo::coord", nodes = addrs.len(), "Service stopped");
            Ok(())
        } else {
            Err(HaloError::Rejected("some nodes refused to stop"))
        }
    }

    /// Terminates every node and clears all service state. The down
    /// set is kept. Idempotent when no service is running.
    ///
    /// # Errors
    ///
    /// `Rejected` when some node did not confirm termination; local
    /// state is cleared regardless.
    pub async fn shut_down(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.service_running {
            return Ok(());
        }
        let addrs = state.topology.addrs();
        let ok = self
            .dispatcher
            .broadcast(&addrs, &AdminMessage::ShutDown)
            .await;

        state.topology = Topology::new();
        state.members.clear();
        state.inventory.free_all();
        state.service_running = false;

        if ok {
            info!(target: "halo::coord", nodes = addrs.len(), "Service shut down");
            Ok(())
        } else {
            warn!(target: "halo::coord", "Some nodes did not confirm shutdown");
            Err(HaloError::Rejected("some nodes did not confirm shutdown"))
        }
    }

    // ==================== membership ====================

    /// Provisions one node on a random free slot and splices it into
    /// the ring.
    ///
    /// # Errors
    ///
    /// `NotRunning`; `Inventory` when no slot is free; `Rejected` when
    /// a provisioning step fails. On failure the newcomer is withdrawn
    /// from the coordinator's topology, but commands already executed
    /// on nodes are not undone.
    pub async fn add_node(
        &self,
        cache_capacity: usize,
        policy: EvictionPolicy,
    ) -> Result<NodeAddr> {
        let mut state = self.state.lock().await;
        if !state.service_running {
            return Err(HaloError::NotRunning);
        }
        self.add_node_locked(&mut state, cache_capacity, policy)
            .await
    }

    /// Removes one randomly chosen member from the ring, moving its
    /// range to the absorbing successor before shutting it down.
    ///
    /// # Errors
    ///
    /// `NotRunning`; `Rejected` when only one member is left.
    pub async fn remove_node(&self) -> Result<NodeAddr> {
        let mut state = self.state.lock().await;
        if !state.service_running {
            return Err(HaloError::NotRunning);
        }
        if state.members.len() <= 1 {
            return Err(HaloError::Rejected("refusing to remove the last member"));
        }
        let addrs: Vec<NodeAddr> = state.members.keys().copied().collect();
        let addr = {
            use rand::seq::SliceRandom;
            addrs
                .choose(&mut rand::thread_rng())
                .copied()
                .ok_or(HaloError::Rejected("no member to remove"))?
        };
        self.remove_node_locked(&mut state, addr).await?;
        Ok(addr)
    }

    /// Handles a failure report: records the node as down, repairs the
    /// ring, and provisions a replacement with the crashed node's
    /// cache configuration.
    ///
    /// Duplicate reports for the same node are no-ops.
    ///
    /// # Errors
    ///
    /// `RingCorrupt` when the topology no longer yields neighbors for
    /// a tracked member.
    pub async fn remove_crashed(&self, addr: NodeAddr) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.service_running {
            debug!(target: "halo::coord", node = %addr, "Ignoring failure report, service not running");
            return Ok(());
        }
        self.remove_crashed_locked(&mut state, addr).await
    }

    /// Pauses client traffic on one member. The node keeps its ring
    /// range and its data; [`start_all`](Self::start_all) resumes it.
    ///
    /// # Errors
    ///
    /// `NotRunning`; `Rejected` when `addr` is not a member or did not
    /// confirm.
    pub async fn stop_node(&self, addr: NodeAddr) -> Result<()> {
        let state = self.state.lock().await;
        if !state.service_running {
            return Err(HaloError::NotRunning);
        }
        if !state.members.contains_key(&addr) {
            return Err(HaloError::Rejected("not a member"));
        }
        if self.dispatcher.send(addr, &AdminMessage::Stop).await {
            info!(target: "halo::coord", node = %addr, "Node stopped");
            Ok(())
        } else {
            Err(HaloError::Rejected("node refused to stop"))
        }
    }

    /// Hard-kills a member for failure-injection tests. The node never
    /// replies to this, so delivery is fire-and-forget.
    ///
    /// # Errors
    ///
    /// `NotRunning`; `Rejected` when `addr` is not a member.
    pub async fn crash_node(&self, addr: NodeAddr) -> Result<()> {
        let state = self.state.lock().await;
        if !state.service_running {
            return Err(HaloError::NotRunning);
        }
        if !state.members.contains_key(&addr) {
            return Err(HaloError::Rejected("not a member"));
        }
        warn!(target: "halo::coord", node = %addr, "Crashing node on request");
        self.dispatcher.send_detached(addr, AdminMessage::Crash);
        Ok(())
    }

    // ==================== views ====================

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.service_running
    }

    /// Number of occupied inventory slots.
    pub async fn servers_running(&self) -> usize {
        self.state.lock().await.inventory.running_count()
    }

    pub async fn is_down(&self, addr: NodeAddr) -> bool {
        self.state.lock().await.down.contains(&addr)
    }

    pub async fn topology(&self) -> Topology {
        self.state.lock().await.topology.clone()
    }

    pub async fn member_records(&self) -> Vec<NodeRecord> {
        self.state.lock().await.members.values().copied().collect()
    }

    // ==================== membership internals ====================

    async fn add_node_locked(
        &self,
        state: &mut CoordState,
        cache_capacity: usize,
        policy: EvictionPolicy,
    ) -> Result<NodeAddr> {
        let addr = state
            .inventory
            .pick_free(&state.down)
            .ok_or_else(|| HaloError::Inventory("no free slot for a new node".into()))?;
        let record = NodeRecord::new(addr, cache_capacity, policy);

        let Some(displaced) = state.topology.insert(addr)? else {
            let _ = state.topology.remove(addr);
            return Err(HaloError::RingCorrupt(
                "service marked running with an empty ring".into(),
            ));
        };
        let owner = displaced.owner;
        let carved = displaced.range;
        info!(
            target: "halo::coord",
            node = %addr,
            owner = %owner,
            range = %carved,
            "Adding node"
        );

        if let Err(e) = self.provision(state, &record, owner, carved).await {
            warn!(
                target: "halo::coord",
                node = %addr,
                error = %e,
                "Provisioning failed, withdrawing newcomer from the ring"
            );
            if let Err(undo) = state.topology.remove(addr) {
                error!(target: "halo::coord", node = %addr, error = %undo, "Topology rollback failed");
            }
            return Err(e);
        }

        state.members.insert(addr, record);
        state.inventory.mark_running(addr)?;
        self.reconcile_join(&state.topology, addr).await;
        info!(target: "halo::coord", node = %addr, "Node added");
        Ok(addr)
    }

    /// The remote half of a join. Order matters: the newcomer needs
    /// the post-split topology before data moves, and the old owner
    /// stays write-locked until the new topology is everywhere.
    async fn provision(
        &self,
        state: &CoordState,
        record: &NodeRecord,
        owner: NodeAddr,
        carved: KeyRange,
    ) -> Result<()> {
        let addr = record.addr;
        if !self.launch_group(std::slice::from_ref(record)).await {
            return Err(HaloError::Rejected("newcomer did not come up"));
        }
        if !self.dispatcher.send(addr, &AdminMessage::Start).await {
            return Err(HaloError::Rejected("newcomer refused start"));
        }
        let topology = AdminMessage::Topology(state.topology.clone());
        if !self.dispatcher.send(addr, &topology).await {
            return Err(HaloError::Rejected("newcomer refused topology"));
        }
        if !self.dispatcher.send(owner, &AdminMessage::LockWrite).await {
            return Err(HaloError::Rejected("owner refused write lock"));
        }
        let move_data = AdminMessage::MoveData {
            target: addr,
            range: carved,
        };
        if !self.dispatcher.send(owner, &move_data).await {
            return Err(HaloError::Rejected("owner failed the data move"));
        }
        if !self
            .dispatcher
            .broadcast(&state.topology.addrs(), &topology)
            .await
        {
            return Err(HaloError::Rejected("topology broadcast failed"));
        }
        if !self.dispatcher.send(owner, &AdminMessage::UnlockWrite).await {
            return Err(HaloError::Rejected("owner refused unlock"));
        }
        Ok(())
    }

    async fn remove_node_locked(&self, state: &mut CoordState, addr: NodeAddr) -> Result<()> {
        // Neighbors come from the pre-removal ring; once the entry is
        // gone they cannot be derived from `addr` any more.
        let pred1 = state.topology.predecessor_of(addr)?.addr;
        let pred2 = state.topology.predecessor_of(pred1)?.addr;
        let succ1 = state.topology.successor_of(addr)?.addr;
        let succ2 = state.topology.successor_of(succ1)?.addr;

        let Some(absorbed) = state.topology.remove(addr)? else {
            return Err(HaloError::RingCorrupt(format!(
                "removal of {addr} cleared the ring"
            )));
        };
        state.members.remove(&addr);
        state.inventory.mark_free(addr)?;
        info!(
            target: "halo::coord",
            node = %addr,
            absorber = %absorbed.successor,
            range = %absorbed.range,
            "Removing node"
        );

        let message = AdminMessage::Topology(state.topology.clone());
        if !self
            .dispatcher
            .broadcast(&state.topology.addrs(), &message)
            .await
        {
            warn!(target: "halo::coord", "Topology broadcast incomplete after removal");
        }
        if !self.dispatcher.send(addr, &AdminMessage::ShutDown).await {
            warn!(target: "halo::coord", node = %addr, "Departing node did not confirm shutdown");
        }

        self.reconcile_departure(&state.topology, pred1, pred2, succ1, succ2)
            .await;
        info!(target: "halo::coord", node = %addr, "Node removed");
        Ok(())
    }

    async fn remove_crashed_locked(&self, state: &mut CoordState, addr: NodeAddr) -> Result<()> {
        // The down set dedupes the burst of reports every neighbor
        // files for the same dead node.
        if !state.down.insert(addr) {
            debug!(target: "halo::coord", node = %addr, "Crash already handled");
            return Ok(());
        }
        let Some(record) = state.members.get(&addr).copied() else {
            warn!(target: "halo::coord", node = %addr, "Failure report for a node that is not a member");
            return Ok(());
        };
        warn!(target: "halo::coord", node = %addr, "Member is down, repairing the ring");

        if state.members.len() == 1 {
            // Nothing is left to absorb the range.
            state.topology = Topology::new();
            state.members.clear();
            state.inventory.mark_free(addr)?;
            state.service_running = false;
            error!(target: "halo::coord", node = %addr, "Last member crashed, service is down");
            return Ok(());
        }

        let pred1 = state.topology.predecessor_of(addr)?.addr;
        let pred2 = state.topology.predecessor_of(pred1)?.addr;
        let succ1 = state.topology.successor_of(addr)?.addr;
        let succ2 = state.topology.successor_of(succ1)?.addr;

        let Some(absorbed) = state.topology.remove(addr)? else {
            return Err(HaloError::RingCorrupt(format!(
                "removal of {addr} cleared the ring"
            )));
        };
        state.members.remove(&addr);
        state.inventory.mark_free(addr)?;
        info!(
            target: "halo::coord",
            node = %addr,
            absorber = %absorbed.successor,
            "Crashed node removed from the ring"
        );

        self.reconcile_departure(&state.topology, pred1, pred2, succ1, succ2)
            .await;

        let message = AdminMessage::Topology(state.topology.clone());
        if !self
            .dispatcher
            .broadcast(&state.topology.addrs(), &message)
            .await
        {
            warn!(target: "halo::coord", "Topology broadcast incomplete after crash removal");
        }

        // Keep cluster capacity constant: replace the dead node with a
        // fresh one carrying the same cache configuration.
        match self
            .add_node_locked(state, record.cache_capacity, record.policy)
            .await
        {
            Ok(replacement) => {
                info!(target: "halo::coord", node = %replacement, "Replacement node provisioned");
            },
            Err(e) => {
                warn!(
                    target: "halo::coord",
                    error = %e,
                    "No replacement provisioned, cluster is one node short"
                );
            },
        }
        Ok(())
    }

    // ==================== provisioning ====================

    /// Launches every record, waits one grace period for the processes
    /// to bind their ports, then pings each node. True only when every
    /// node answers.
    async fn launch_group(&self, records: &[NodeRecord]) -> bool {
        for record in records {
            if let Err(e) = self.launcher.launch(record, self.report_addr) {
                error!(
                    target: "halo::coord",
                    node = %record.addr,
                    error = %e,
                    "Node launch could not be issued"
                );
                return false;
            }
        }
        tokio::time::sleep(self.launch_grace).await;
        let pings = records.iter().map(|record| self.dispatcher.ping(record.addr));
        join_all(pings).await.iter().all(|alive| *alive)
    }

    // ==================== replica reconciliation ====================

    async fn reconcile_join(&self, topology: &Topology, newcomer: NodeAddr) {
        if let Err(e) = self.reconcile_join_inner(topology, newcomer).await {
            warn!(
                target: "halo::coord",
                node = %newcomer,
                error = %e,
                "Join reconciliation incomplete"
            );
        }
    }

    /// Restores the replica layout around a newcomer: the newcomer
    /// holds both predecessor ranges, its own range sits on its two
    /// successors, and copies that stopped being part of any replica
    /// set are deleted.
    async fn reconcile_join_inner(&self, topology: &Topology, newcomer: NodeAddr) -> Result<()> {
        let pred1 = topology.predecessor_of(newcomer)?.addr;
        let pred2 = topology.predecessor_of(pred1)?.addr;
        let succ1 = topology.successor_of(newcomer)?.addr;
        let succ2 = topology.successor_of(succ1)?.addr;
        let succ3 = topology.successor_of(succ2)?.addr;

        // The newcomer serves reads for both predecessor ranges.
        if pred1 != newcomer {
            self.replicate_range(topology, pred1, newcomer).await?;
        }
        if pred2 != newcomer {
            self.replicate_range(topology, pred2, newcomer).await?;
        }
        // The move stripped the old owner's copy of the carved range;
        // as first successor it has to hold one again.
        if succ1 != newcomer {
            self.replicate_range(topology, newcomer, succ1).await?;
        }

        self.delete_stale_copy(topology, pred1, succ2).await;
        self.delete_stale_copy(topology, pred2, succ1).await;
        self.delete_stale_copy(topology, newcomer, succ3).await;
        Ok(())
    }

    async fn reconcile_departure(
        &self,
        topology: &Topology,
        pred1: NodeAddr,
        pred2: NodeAddr,
        succ1: NodeAddr,
        succ2: NodeAddr,
    ) {
        if let Err(e) = self
            .reconcile_departure_inner(topology, pred1, pred2, succ1, succ2)
            .await
        {
            warn!(target: "halo::coord", error = %e, "Departure reconciliation incomplete");
        }
    }

    /// Restores the replica layout after a member left: both
    /// predecessor ranges gain their new third holder, and the
    /// absorber's enlarged range is copied two successors ahead.
    ///
    /// Neighbors were computed before the removal, so in small rings
    /// the roles collapse onto each other or onto the removed node
    /// itself; the guards skip those cases.
    async fn reconcile_departure_inner(
        &self,
        topology: &Topology,
        pred1: NodeAddr,
        pred2: NodeAddr,
        succ1: NodeAddr,
        succ2: NodeAddr,
    ) -> Result<()> {
        if pred1 != succ2 && topology.contains(pred1) && topology.contains(succ2) {
            self.replicate_range(topology, pred1, succ2).await?;
        }
        if pred2 != succ1 && topology.contains(pred2) && topology.contains(succ1) {
            self.replicate_range(topology, pred2, succ1).await?;
        }
        if topology.contains(succ1) {
            let next = topology.successor_of(succ1)?.addr;
            let succ3 = topology.successor_of(next)?.addr;
            if succ3 != succ1 {
                self.replicate_range(topology, succ1, succ3).await?;
            }
        }
        Ok(())
    }

    /// Tells `owner` to copy its current range to `target`, keeping
    /// its own data.
    async fn replicate_range(
        &self,
        topology: &Topology,
        owner: NodeAddr,
        target: NodeAddr,
    ) -> Result<()> {
        let range = topology.entry_of(owner)?.range;
        let message = AdminMessage::ReplicateData { target, range };
        if self.dispatcher.send(owner, &message).await {
            debug!(
                target: "halo::coord",
                owner = %owner,
                to = %target,
                range = %range,
                "Replica copy placed"
            );
        } else {
            warn!(target: "halo::coord", owner = %owner, to = %target, "Replica copy failed");
        }
        Ok(())
    }

    /// Deletes `owner`'s range from `holder`, unless `holder` is one
    /// of the range's legitimate replica holders.
    async fn delete_stale_copy(&self, topology: &Topology, owner: NodeAddr, holder: NodeAddr) {
        let holders = match topology.replica_holders(owner) {
            Ok(holders) => holders,
            Err(e) => {
                warn!(target: "halo::coord", owner = %owner, error = %e, "Stale-copy check failed");
                return;
            },
        };
        if holders.contains(&holder) {
            return;
        }
        let range = match topology.entry_of(owner) {
            Ok(entry) => entry.range,
            Err(e) => {
                warn!(target: "halo::coord", owner = %owner, error = %e, "Stale-copy check failed");
                return;
            },
        };
        let message = AdminMessage::DeleteData { owner, range };
        if self.dispatcher.send(holder, &message).await {
            debug!(
                target: "halo::coord",
                holder = %holder,
                range = %range,
                "Stale copy deleted"
            );
        } else {
            warn!(target: "halo::coord", holder = %holder, "Stale copy delete failed");
        }
    }
}
