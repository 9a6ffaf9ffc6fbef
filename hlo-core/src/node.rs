//! Node-level descriptors: eviction policy, lifecycle phase, provisioning
//! record.

use std::fmt;
use std::str::FromStr;

use crate::ring::NodeAddr;

/// Cache eviction policy a node is provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict in insertion order.
    #[default]
    Fifo,
    /// Evict the least recently used entry.
    Lru,
    /// Evict the least frequently used entry.
    Lfu,
}

impl EvictionPolicy {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Fifo => "FIFO",
            EvictionPolicy::Lru => "LRU",
            EvictionPolicy::Lfu => "LFU",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(EvictionPolicy::Fifo),
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            _ => Err(format!("Unknown eviction policy: {s}")),
        }
    }
}

/// Lifecycle phase of a node as seen by its own agent.
///
/// Provisioned nodes have a process but no serving loop; `Started` and
/// `Stopped` toggle under admin control; `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePhase {
    #[default]
    Provisioned,
    Started,
    Stopped,
    ShutDown,
}

impl NodePhase {
    /// Whether the node currently serves reads and writes.
    #[inline]
    #[must_use]
    pub const fn is_serving(&self) -> bool {
        matches!(self, NodePhase::Started)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            NodePhase::Provisioned => "provisioned",
            NodePhase::Started => "started",
            NodePhase::Stopped => "stopped",
            NodePhase::ShutDown => "shut-down",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything the coordinator needs to (re)provision one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub addr: NodeAddr,
    pub cache_capacity: usize,
    pub policy: EvictionPolicy,
}

impl NodeRecord {
    #[must_use]
    pub const fn new(addr: NodeAddr, cache_capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            addr,
            cache_capacity,
            policy,
        }
    }
}
