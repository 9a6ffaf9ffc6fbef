#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Core types for the HALO coordination layer.
//!
//! HALO (Hash-ring Allocation and Liveness Orchestrator) places cache
//! nodes on a 128-bit consistent-hash circle and keeps every key range
//! owned by exactly one node and replicated on its two clockwise
//! successors. This crate holds the pure data model: positions, ranges,
//! the ring itself and its wire encoding, and per-node descriptors.
//! Networking and orchestration live in the sibling crates.

mod error;
mod hash;
mod node;
mod ports;
mod range;
mod ring;

pub use error::{HaloError, Result};
pub use hash::Position;
pub use node::{EvictionPolicy, NodePhase, NodeRecord};
pub use ports::{offset_port, ADMIN_PORT_OFFSET, GOSSIP_PORT_OFFSET};
pub use range::KeyRange;
pub use ring::{Absorbed, Displaced, NodeAddr, RingEntry, Topology};

/// Copies of every key range kept across the ring: the owner plus its
/// two clockwise successors.
pub const REPLICA_COUNT: usize = 3;
