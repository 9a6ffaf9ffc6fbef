//! Port derivation for the per-node listener family.
//!
//! Each node owns three TCP ports derived from its main service port:
//! the main port itself (client traffic and incoming range transfers),
//! `main + 100` for admin commands and `main + 200` for gossip probes.
//! Derivations that would pass 65535 are folded back into the
//! non-privileged range instead of wrapping to a reserved port.

/// Offset of the admin command port from the main port.
pub const ADMIN_PORT_OFFSET: u16 = 100;

/// Offset of the gossip probe port from the main port.
pub const GOSSIP_PORT_OFFSET: u16 = 200;

/// Derive a sibling port from `port` by `offset`.
///
/// When the sum exceeds 65535 the overshoot is re-based at 1023, so the
/// result always lands above the reserved port range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn offset_port(port: u16, offset: u16) -> u16 {
    let shifted = u32::from(port) + u32::from(offset);
    if shifted > 65535 {
        // Overshoot re-based above the reserved ports; fits u16 because
        // offset is at most 200.
        (shifted - 65535 + 1023) as u16
    } else {
        shifted as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_offsets() {
        assert_eq!(offset_port(6000, ADMIN_PORT_OFFSET), 6100);
        assert_eq!(offset_port(6000, GOSSIP_PORT_OFFSET), 6200);
    }

    #[test]
    fn test_offset_at_upper_bound() {
        assert_eq!(offset_port(65435, ADMIN_PORT_OFFSET), 65535);
    }

    #[test]
    fn test_offset_past_upper_bound_folds_back() {
        assert_eq!(offset_port(65436, ADMIN_PORT_OFFSET), 1024);
        assert_eq!(offset_port(65535, ADMIN_PORT_OFFSET), 1123);
        assert_eq!(offset_port(65535, GOSSIP_PORT_OFFSET), 1223);
    }

    #[test]
    fn test_folded_ports_stay_unprivileged() {
        for port in 65336..=65535u16 {
            assert!(offset_port(port, GOSSIP_PORT_OFFSET) >= 1024);
        }
    }
}
