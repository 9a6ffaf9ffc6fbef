//! The consistent-hash ring and its wire form.
//!
//! The ring is a set of entries, one per cache node, whose key ranges
//! partition the 128-bit circle exactly: every position has one owner and
//! ranges never overlap. Inserting a node splits the range of the node
//! that currently owns the newcomer's position; removing a node merges
//! its range into the clockwise successor.
//!
//! Entry wire layout (40 bytes, big-endian):
//!
//! ```text
//! +----------+-----------+----------------+----------------+
//! | ip (4B)  | port (4B) | range min (16B)| range max (16B)|
//! +----------+-----------+----------------+----------------+
//! ```
//!
//! A topology payload is zero or more such entries back to back.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{HaloError, Result};
use crate::hash::Position;
use crate::ports::{offset_port, ADMIN_PORT_OFFSET, GOSSIP_PORT_OFFSET};
use crate::range::KeyRange;

/// Identity of a cache node: IPv4 address plus main service port.
///
/// The admin and gossip ports are derived, never stored, so a node's
/// identity is always the main address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NodeAddr {
    /// Encoded size in bytes: 4 for the octets, 4 for the port.
    pub const SIZE: usize = 8;

    #[must_use]
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The node's position on the hash circle, derived from `ip:port`.
    #[must_use]
    pub fn position(&self) -> Position {
        Position::of(self.to_string().as_bytes())
    }

    #[must_use]
    pub fn admin_port(&self) -> u16 {
        offset_port(self.port, ADMIN_PORT_OFFSET)
    }

    #[must_use]
    pub fn gossip_port(&self) -> u16 {
        offset_port(self.port, GOSSIP_PORT_OFFSET)
    }

    /// Main service address (client traffic and range transfers).
    #[must_use]
    pub fn main_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Admin command listener address.
    #[must_use]
    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.admin_port()))
    }

    /// Gossip probe listener address.
    #[must_use]
    pub fn gossip_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.gossip_port()))
    }

    /// Encode into the front of `buf`, which must hold at least `SIZE` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ip.octets());
        buf[4..8].copy_from_slice(&u32::from(self.port).to_be_bytes());
    }

    /// Decode an address from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `HaloError::Protocol` if the buffer is too short or the
    /// port field does not fit in 16 bits.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(HaloError::Protocol(format!(
                "node address needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
        let raw_port = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let port = u16::try_from(raw_port)
            .map_err(|_| HaloError::Protocol(format!("port {raw_port} out of range")))?;
        Ok(Self { ip, port })
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = HaloError;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s.split_once(':').ok_or_else(|| {
            HaloError::Config(format!("invalid node address '{s}', expected ip:port"))
        })?;
        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| HaloError::Config(format!("invalid IPv4 address '{ip}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| HaloError::Config(format!("invalid port '{port}'")))?;
        Ok(Self::new(ip, port))
    }
}

/// One ring entry: a node and the key range it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub addr: NodeAddr,
    pub range: KeyRange,
}

impl RingEntry {
    /// Encoded size in bytes.
    pub const SIZE: usize = NodeAddr::SIZE + KeyRange::SIZE;

    /// Encode into the front of `buf`, which must hold at least `SIZE` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        self.addr.encode_into(&mut buf[0..NodeAddr::SIZE]);
        self.range.encode_into(&mut buf[NodeAddr::SIZE..Self::SIZE]);
    }

    #[must_use]
    pub fn to_be_bytes(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        self.encode_into(&mut raw);
        raw
    }

    /// Decode an entry from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `HaloError::Protocol` on a short buffer or malformed field.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(HaloError::Protocol(format!(
                "ring entry needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        let addr = NodeAddr::parse(&buf[0..NodeAddr::SIZE])?;
        let range = KeyRange::parse(&buf[NodeAddr::SIZE..Self::SIZE])?;
        Ok(Self { addr, range })
    }
}

impl fmt::Display for RingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.addr, self.range)
    }
}

/// Outcome of an insert: the node whose range was split and the carved-off
/// lower sub-range that now belongs to the newcomer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displaced {
    pub owner: NodeAddr,
    pub range: KeyRange,
}

/// Outcome of a removal: the successor that absorbed the departed node's
/// range, and the absorbed range itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Absorbed {
    pub successor: NodeAddr,
    pub range: KeyRange,
}

/// The full cluster topology: one entry per live node.
///
/// Maintains the partition invariant across mutations. Lookup order is
/// linear; rings here are tens of nodes, not thousands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    entries: Vec<RingEntry>,
}

impl Topology {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// Addresses of every member, in entry order.
    #[must_use]
    pub fn addrs(&self) -> Vec<NodeAddr> {
        self.entries.iter().map(|e| e.addr).collect()
    }

    #[must_use]
    pub fn contains(&self, addr: NodeAddr) -> bool {
        self.entries.iter().any(|e| e.addr == addr)
    }

    /// Insert a node at its hash position.
    ///
    /// On an empty ring the node takes the whole circle and nothing is
    /// displaced. Otherwise the current owner of the position keeps the
    /// upper sub-range and the newcomer takes the lower one.
    ///
    /// # Errors
    ///
    /// `Rejected` if the node is already a member; `RingCorrupt` if a
    /// non-empty ring has no owner for the position.
    pub fn insert(&mut self, addr: NodeAddr) -> Result<Option<Displaced>> {
        if self.contains(addr) {
            return Err(HaloError::Rejected("node already in ring"));
        }
        let at = addr.position();
        if self.entries.is_empty() {
            self.entries.push(RingEntry {
                addr,
                range: KeyRange::full_circle_at(at),
            });
            return Ok(None);
        }
        let owner_idx = self.owner_index(at)?;
        let carved = self.entries[owner_idx].range.split(at);
        let owner = self.entries[owner_idx].addr;
        self.entries.push(RingEntry {
            addr,
            range: carved,
        });
        Ok(Some(Displaced {
            owner,
            range: carved,
        }))
    }

    /// Remove a node, merging its range into the clockwise successor.
    ///
    /// An empty ring is a no-op. A single remaining entry is cleared
    /// outright; callers that must keep the service alive refuse that
    /// case before getting here.
    ///
    /// # Errors
    ///
    /// `RingCorrupt` if the address is not a member of a multi-node ring,
    /// or if no entry is range-adjacent to the removed one.
    pub fn remove(&mut self, addr: NodeAddr) -> Result<Option<Absorbed>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        if self.entries.len() == 1 {
            self.entries.clear();
            return Ok(None);
        }
        let idx = self.entry_index(addr)?;
        let removed = self.entries[idx];
        let succ_min = removed.range.max.wrapping_next();
        let succ_idx = self
            .entries
            .iter()
            .position(|e| e.range.min == succ_min)
            .ok_or_else(|| {
                HaloError::RingCorrupt(format!("no successor adjacent to {}", removed.range))
            })?;
        self.entries[succ_idx].range.extend_down(removed.range.min);
        let successor = self.entries[succ_idx].addr;
        self.entries.swap_remove(idx);
        Ok(Some(Absorbed {
            successor,
            range: removed.range,
        }))
    }

    /// The entry owning `position`.
    ///
    /// # Errors
    ///
    /// `RingEmpty` on an empty ring. `RingCorrupt` when no range covers
    /// the position; the partition invariant makes that unreachable on a
    /// well-formed ring, so a miss means the ring state itself is bad.
    pub fn owner_of(&self, position: Position) -> Result<&RingEntry> {
        if self.entries.is_empty() {
            return Err(HaloError::RingEmpty);
        }
        self.entries
            .iter()
            .find(|e| e.range.contains(position))
            .ok_or_else(|| HaloError::RingCorrupt(format!("no owner for position {position}")))
    }

    /// The entry for a member address.
    ///
    /// # Errors
    ///
    /// `RingEmpty` on an empty ring, `RingCorrupt` if the address is not
    /// a member.
    pub fn entry_of(&self, addr: NodeAddr) -> Result<&RingEntry> {
        if self.entries.is_empty() {
            return Err(HaloError::RingEmpty);
        }
        self.entries
            .iter()
            .find(|e| e.addr == addr)
            .ok_or_else(|| HaloError::RingCorrupt(format!("{addr} is not a ring member")))
    }

    /// The clockwise successor of a member (itself on a one-node ring).
    pub fn successor_of(&self, addr: NodeAddr) -> Result<&RingEntry> {
        let entry = self.entry_of(addr)?;
        self.owner_of(entry.range.max.wrapping_next())
    }

    /// The counter-clockwise predecessor of a member.
    pub fn predecessor_of(&self, addr: NodeAddr) -> Result<&RingEntry> {
        let entry = self.entry_of(addr)?;
        self.owner_of(entry.range.min.wrapping_prev())
    }

    /// Whether `addr` may serve reads for `key`.
    ///
    /// A node reads from its own range and from the ranges of its two
    /// predecessors, whose replicas it holds.
    pub fn within_reading_range(&self, addr: NodeAddr, key: &[u8]) -> Result<bool> {
        let position = Position::of(key);
        let own = self.entry_of(addr)?;
        if own.range.contains(position) {
            return Ok(true);
        }
        let pred1 = self.predecessor_of(addr)?;
        if pred1.range.contains(position) {
            return Ok(true);
        }
        let pred2 = self.predecessor_of(pred1.addr)?;
        Ok(pred2.range.contains(position))
    }

    /// Whether `addr` is the primary writer for `key`: own range only.
    pub fn within_writing_range(&self, addr: NodeAddr, key: &[u8]) -> Result<bool> {
        let position = Position::of(key);
        Ok(self.entry_of(addr)?.range.contains(position))
    }

    /// The nodes holding copies of `owner`'s range: the owner plus its two
    /// clockwise successors, deduplicated on small rings.
    pub fn replica_holders(&self, owner: NodeAddr) -> Result<Vec<NodeAddr>> {
        let succ1 = self.successor_of(owner)?.addr;
        let succ2 = self.successor_of(succ1)?.addr;
        let mut holders = vec![owner];
        for addr in [succ1, succ2] {
            if !holders.contains(&addr) {
                holders.push(addr);
            }
        }
        Ok(holders)
    }

    /// Serialize every entry back to back.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.entries.len() * RingEntry::SIZE);
        for entry in &self.entries {
            buf.put_slice(&entry.to_be_bytes());
        }
        buf.freeze()
    }

    /// Decode a topology payload.
    ///
    /// # Errors
    ///
    /// `Protocol` if the payload length is not a multiple of the entry
    /// size or any entry is malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % RingEntry::SIZE != 0 {
            return Err(HaloError::Protocol(format!(
                "topology payload length {} is not a multiple of {}",
                data.len(),
                RingEntry::SIZE
            )));
        }
        let entries = data
            .chunks_exact(RingEntry::SIZE)
            .map(RingEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    fn owner_index(&self, position: Position) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.range.contains(position))
            .ok_or_else(|| HaloError::RingCorrupt(format!("no owner for position {position}")))
    }

    fn entry_index(&self, addr: NodeAddr) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.addr == addr)
            .ok_or_else(|| HaloError::RingCorrupt(format!("{addr} is not a ring member")))
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node(s)", self.entries.len())?;
        for entry in &self.entries {
            write!(f, "; {entry}")?;
        }
        Ok(())
    }
}
