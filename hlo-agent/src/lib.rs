#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Node-side agent for HALO.
//!
//! Runs on every cache node next to the cache engine. Listens for the
//! coordinator's admin commands, answers gossip probes from ring
//! neighbors, accepts range transfers from peers, and probes its own
//! successors for liveness. Reads and writes pass through the agent's
//! gates: lifecycle phase, ring responsibility and the write lock.

mod admin;
mod agent;
mod heartbeat;
mod state;
mod store;
mod transfer;

pub use agent::{
    spawn, spawn_with_store, AgentConfig, AgentHandle, ReadOutcome, Termination, WriteOutcome,
};
pub use heartbeat::HeartbeatConfig;
pub use store::{MemoryStore, RangeStore};
pub use transfer::{push_batch, MAX_BATCH_ENTRIES, MAX_KEY_LEN, MAX_VALUE_LEN};
