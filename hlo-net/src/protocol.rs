//! Admin wire protocol.
//!
//! Every admin, gossip and failure-report exchange uses the same frame:
//! a single status byte, followed for payload-bearing commands by a
//! big-endian u32 length and the payload itself.
//!
//! ```text
//! +-----------+
//! | status 1B |                                   bare command
//! +-----------+
//! +-----------+-------------+- - - - - - - -+
//! | status 1B | length 4B BE| payload bytes |    command with payload
//! +-----------+-------------+- - - - - - - -+
//! ```
//!
//! Topology payloads are back-to-back 40-byte ring entries. Transfer
//! commands (move, replicate, delete) carry exactly one ring entry
//! naming the peer node and the key range concerned. Failure reports
//! carry one 8-byte node address. Replies are a single confirmation
//! byte; anything else on the wire is a protocol error.

use bytes::{BufMut, Bytes, BytesMut};
use hlo_core::{HaloError, KeyRange, NodeAddr, Result, RingEntry, Topology};

/// Upper bound on a payload length field. Generous: a topology of a
/// thousand nodes is 40 KB.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Status byte of every admin command.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start = 0x15,
    Stop = 0x16,
    ShutDown = 0x17,
    Topology = 0x18,
    LockWrite = 0x19,
    UnlockWrite = 0x1A,
    MoveData = 0x1B,
    Ping = 0x1C,
    Crash = 0x1D,
    ReplicateData = 0x1E,
    DeleteData = 0x1F,
    ServerDown = 0x2B,
}

impl CommandKind {
    /// Decode a status byte; unknown bytes are rejected, never coerced.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x15 => Some(CommandKind::Start),
            0x16 => Some(CommandKind::Stop),
            0x17 => Some(CommandKind::ShutDown),
            0x18 => Some(CommandKind::Topology),
            0x19 => Some(CommandKind::LockWrite),
            0x1A => Some(CommandKind::UnlockWrite),
            0x1B => Some(CommandKind::MoveData),
            0x1C => Some(CommandKind::Ping),
            0x1D => Some(CommandKind::Crash),
            0x1E => Some(CommandKind::ReplicateData),
            0x1F => Some(CommandKind::DeleteData),
            0x2B => Some(CommandKind::ServerDown),
            _ => None,
        }
    }

    /// Whether frames of this kind carry a length-prefixed payload.
    #[must_use]
    pub const fn has_payload(self) -> bool {
        matches!(
            self,
            CommandKind::Topology
                | CommandKind::MoveData
                | CommandKind::ReplicateData
                | CommandKind::DeleteData
                | CommandKind::ServerDown
        )
    }
}

/// Single-byte reply to an admin command.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Executed = 0x29,
    Rejected = 0x2A,
}

impl Confirmation {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x29 => Some(Confirmation::Executed),
            0x2A => Some(Confirmation::Rejected),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_executed(self) -> bool {
        matches!(self, Confirmation::Executed)
    }
}

/// A decoded admin command, ready to execute or to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    /// Begin serving reads and writes.
    Start,
    /// Stop serving but keep the process and its data.
    Stop,
    /// Lock writes, stop serving, terminate the process.
    ShutDown,
    /// Install a new cluster topology.
    Topology(Topology),
    /// Reject writes until unlocked.
    LockWrite,
    /// Lift a write lock.
    UnlockWrite,
    /// Push `range` to `target`, then drop the local copy.
    MoveData { target: NodeAddr, range: KeyRange },
    /// Liveness probe.
    Ping,
    /// Terminate immediately without replying. Test and drill use.
    Crash,
    /// Push `range` to `target`, keeping the local copy.
    ReplicateData { target: NodeAddr, range: KeyRange },
    /// Drop the local copy of `range`; `owner` is who owns it now.
    DeleteData { owner: NodeAddr, range: KeyRange },
    /// Failure report: the named node stopped answering.
    ServerDown(NodeAddr),
}

impl AdminMessage {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            AdminMessage::Start => CommandKind::Start,
            AdminMessage::Stop => CommandKind::Stop,
            AdminMessage::ShutDown => CommandKind::ShutDown,
            AdminMessage::Topology(_) => CommandKind::Topology,
            AdminMessage::LockWrite => CommandKind::LockWrite,
            AdminMessage::UnlockWrite => CommandKind::UnlockWrite,
            AdminMessage::MoveData { .. } => CommandKind::MoveData,
            AdminMessage::Ping => CommandKind::Ping,
            AdminMessage::Crash => CommandKind::Crash,
            AdminMessage::ReplicateData { .. } => CommandKind::ReplicateData,
            AdminMessage::DeleteData { .. } => CommandKind::DeleteData,
            AdminMessage::ServerDown(_) => CommandKind::ServerDown,
        }
    }

    /// Encode the full frame: status byte, then length and payload when
    /// the kind carries one.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self.payload() {
            None => Bytes::copy_from_slice(&[self.kind() as u8]),
            Some(payload) => {
                let mut buf = BytesMut::with_capacity(1 + 4 + payload.len());
                buf.put_u8(self.kind() as u8);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(&payload);
                buf.freeze()
            },
        }
    }

    /// Reassemble a message from its decoded status byte and payload.
    ///
    /// # Errors
    ///
    /// `Protocol` when a payload is present but not expected (or the
    /// reverse), or when the payload is malformed for the kind.
    pub fn from_parts(kind: CommandKind, payload: Option<&[u8]>) -> Result<Self> {
        match (kind.has_payload(), payload) {
            (false, Some(_)) => Err(HaloError::Protocol(format!(
                "unexpected payload for {kind:?}"
            ))),
            (true, None) => Err(HaloError::Protocol(format!("missing payload for {kind:?}"))),
            (false, None) => Ok(match kind {
                CommandKind::Start => AdminMessage::Start,
                CommandKind::Stop => AdminMessage::Stop,
                CommandKind::ShutDown => AdminMessage::ShutDown,
                CommandKind::LockWrite => AdminMessage::LockWrite,
                CommandKind::UnlockWrite => AdminMessage::UnlockWrite,
                CommandKind::Ping => AdminMessage::Ping,
                CommandKind::Crash => AdminMessage::Crash,
                // Payload-bearing kinds are unreachable in this arm.
                _ => return Err(HaloError::Protocol(format!("malformed {kind:?} frame"))),
            }),
            (true, Some(data)) => match kind {
                CommandKind::Topology => Ok(AdminMessage::Topology(Topology::from_bytes(data)?)),
                CommandKind::MoveData => {
                    let entry = Self::sole_entry(kind, data)?;
                    Ok(AdminMessage::MoveData {
                        target: entry.addr,
                        range: entry.range,
                    })
                },
                CommandKind::ReplicateData => {
                    let entry = Self::sole_entry(kind, data)?;
                    Ok(AdminMessage::ReplicateData {
                        target: entry.addr,
                        range: entry.range,
                    })
                },
                CommandKind::DeleteData => {
                    let entry = Self::sole_entry(kind, data)?;
                    Ok(AdminMessage::DeleteData {
                        owner: entry.addr,
                        range: entry.range,
                    })
                },
                CommandKind::ServerDown => {
                    if data.len() != NodeAddr::SIZE {
                        return Err(HaloError::Protocol(format!(
                            "server-down payload must be {} bytes, got {}",
                            NodeAddr::SIZE,
                            data.len()
                        )));
                    }
                    Ok(AdminMessage::ServerDown(NodeAddr::parse(data)?))
                },
                _ => Err(HaloError::Protocol(format!("malformed {kind:?} frame"))),
            },
        }
    }

    fn payload(&self) -> Option<Bytes> {
        match self {
            AdminMessage::Topology(topology) => Some(topology.to_bytes()),
            AdminMessage::MoveData { target, range }
            | AdminMessage::ReplicateData { target, range } => {
                let entry = RingEntry {
                    addr: *target,
                    range: *range,
                };
                Some(Bytes::copy_from_slice(&entry.to_be_bytes()))
            },
            AdminMessage::DeleteData { owner, range } => {
                let entry = RingEntry {
                    addr: *owner,
                    range: *range,
                };
                Some(Bytes::copy_from_slice(&entry.to_be_bytes()))
            },
            AdminMessage::ServerDown(addr) => {
                let mut raw = [0u8; NodeAddr::SIZE];
                addr.encode_into(&mut raw);
                Some(Bytes::copy_from_slice(&raw))
            },
            _ => None,
        }
    }

    fn sole_entry(kind: CommandKind, data: &[u8]) -> Result<RingEntry> {
        if data.len() != RingEntry::SIZE {
            return Err(HaloError::Protocol(format!(
                "{kind:?} payload must be exactly {} bytes, got {}",
                RingEntry::SIZE,
                data.len()
            )));
        }
        RingEntry::parse(data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> NodeAddr {
        NodeAddr::new(Ipv4Addr::new(10, 0, 0, last), 6000)
    }

    fn decode(frame: &[u8]) -> AdminMessage {
        let kind = CommandKind::from_u8(frame[0]).unwrap();
        if kind.has_payload() {
            let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
            assert_eq!(frame.len(), 5 + len);
            AdminMessage::from_parts(kind, Some(&frame[5..])).unwrap()
        } else {
            assert_eq!(frame.len(), 1);
            AdminMessage::from_parts(kind, None).unwrap()
        }
    }

    // ==================== frame shape ====================

    #[test]
    fn test_bare_commands_are_one_byte() {
        for msg in [
            AdminMessage::Start,
            AdminMessage::Stop,
            AdminMessage::ShutDown,
            AdminMessage::LockWrite,
            AdminMessage::UnlockWrite,
            AdminMessage::Ping,
            AdminMessage::Crash,
        ] {
            let frame = msg.encode();
            assert_eq!(frame.len(), 1);
            assert_eq!(decode(&frame), msg);
        }
    }

    #[test]
    fn test_status_bytes_match_wire_values() {
        assert_eq!(AdminMessage::Start.encode()[0], 0x15);
        assert_eq!(AdminMessage::ShutDown.encode()[0], 0x17);
        assert_eq!(AdminMessage::Ping.encode()[0], 0x1C);
        assert_eq!(AdminMessage::Crash.encode()[0], 0x1D);
        assert_eq!(AdminMessage::ServerDown(addr(1)).encode()[0], 0x2B);
    }

    #[test]
    fn test_topology_frame_round_trip() {
        let mut topology = Topology::new();
        topology.insert(addr(1)).unwrap();
        topology.insert(addr(2)).unwrap();
        topology.insert(addr(3)).unwrap();

        let msg = AdminMessage::Topology(topology.clone());
        let frame = msg.encode();
        assert_eq!(frame.len(), 1 + 4 + 3 * RingEntry::SIZE);
        assert_eq!(decode(&frame), msg);
    }

    #[test]
    fn test_transfer_frames_round_trip() {
        let range = KeyRange::full_circle_at(addr(9).position());
        for msg in [
            AdminMessage::MoveData {
                target: addr(9),
                range,
            },
            AdminMessage::ReplicateData {
                target: addr(9),
                range,
            },
            AdminMessage::DeleteData {
                owner: addr(9),
                range,
            },
        ] {
            let frame = msg.encode();
            assert_eq!(frame.len(), 1 + 4 + RingEntry::SIZE);
            assert_eq!(decode(&frame), msg);
        }
    }

    #[test]
    fn test_server_down_round_trip() {
        let msg = AdminMessage::ServerDown(addr(13));
        let frame = msg.encode();
        assert_eq!(frame.len(), 1 + 4 + NodeAddr::SIZE);
        assert_eq!(decode(&frame), msg);
    }

    // ==================== strictness ====================

    #[test]
    fn test_unknown_status_byte_rejected() {
        assert!(CommandKind::from_u8(0x00).is_none());
        assert!(CommandKind::from_u8(0x29).is_none());
        assert!(CommandKind::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_payload_presence_must_match_kind() {
        assert!(AdminMessage::from_parts(CommandKind::Ping, Some(&[0u8; 8])).is_err());
        assert!(AdminMessage::from_parts(CommandKind::Topology, None).is_err());
    }

    #[test]
    fn test_transfer_payload_must_be_exactly_one_entry() {
        let short = [0u8; RingEntry::SIZE - 1];
        let long = [0u8; RingEntry::SIZE + 1];
        assert!(AdminMessage::from_parts(CommandKind::MoveData, Some(&short)).is_err());
        assert!(AdminMessage::from_parts(CommandKind::MoveData, Some(&long)).is_err());
    }

    #[test]
    fn test_confirmation_decode_is_strict() {
        assert_eq!(Confirmation::from_u8(0x29), Some(Confirmation::Executed));
        assert_eq!(Confirmation::from_u8(0x2A), Some(Confirmation::Rejected));
        assert_eq!(Confirmation::from_u8(0x2C), None);
        assert_eq!(Confirmation::from_u8(0x15), None);
        assert!(Confirmation::Executed.is_executed());
        assert!(!Confirmation::Rejected.is_executed());
    }
}
