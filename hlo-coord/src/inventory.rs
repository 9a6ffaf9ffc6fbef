//! The fixed pool of provisionable node slots.
//!
//! The coordinator never invents addresses: every node it launches
//! occupies one of the slots listed in its configuration. A slot is
//! either free or running, and crashed hosts are excluded from reuse
//! by the caller's down set.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use hlo_core::{HaloError, NodeAddr, Result};

#[derive(Debug, Clone, Copy)]
struct Slot {
    addr: NodeAddr,
    running: bool,
}

#[derive(Debug, Clone)]
pub struct Inventory {
    slots: Vec<Slot>,
}

impl Inventory {
    /// Builds an inventory from the configured slot addresses.
    ///
    /// # Errors
    ///
    /// Returns `Inventory` if the list contains a duplicate address.
    pub fn from_addrs(addrs: Vec<NodeAddr>) -> Result<Self> {
        let mut seen = HashSet::new();
        for addr in &addrs {
            if !seen.insert(*addr) {
                return Err(HaloError::Inventory(format!("duplicate slot {addr}")));
            }
        }
        Ok(Self {
            slots: addrs
                .into_iter()
                .map(|addr| Slot {
                    addr,
                    running: false,
                })
                .collect(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.slots.iter().filter(|s| s.running).count()
    }

    /// The anchor slot. Every bootstrap includes it, so the first
    /// configured address is always part of a fresh ring.
    #[must_use]
    pub fn anchor(&self) -> Option<NodeAddr> {
        self.slots.first().map(|s| s.addr)
    }

    /// Picks one free slot at random, skipping addresses in `down`.
    #[must_use]
    pub fn pick_free(&self, down: &HashSet<NodeAddr>) -> Option<NodeAddr> {
        let candidates: Vec<NodeAddr> = self
            .slots
            .iter()
            .filter(|s| !s.running && !down.contains(&s.addr))
            .map(|s| s.addr)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Picks `count` slots for a bootstrap: the anchor plus random
    /// free slots.
    ///
    /// # Errors
    ///
    /// Returns `Inventory` if `count` is zero, the anchor is down or
    /// occupied, or fewer than `count` usable slots exist.
    pub fn pick_bootstrap_set(
        &self,
        count: usize,
        down: &HashSet<NodeAddr>,
    ) -> Result<Vec<NodeAddr>> {
        if count == 0 {
            return Err(HaloError::Inventory(
                "bootstrap needs at least one node".into(),
            ));
        }
        let anchor = self
            .anchor()
            .ok_or_else(|| HaloError::Inventory("no slots configured".into()))?;
        if down.contains(&anchor) {
            return Err(HaloError::Inventory(format!(
                "anchor slot {anchor} is marked down"
            )));
        }
        let anchor_slot = &self.slots[0];
        if anchor_slot.running {
            return Err(HaloError::Inventory(format!(
                "anchor slot {anchor} is already running"
            )));
        }

        let candidates: Vec<NodeAddr> = self
            .slots
            .iter()
            .skip(1)
            .filter(|s| !s.running && !down.contains(&s.addr))
            .map(|s| s.addr)
            .collect();
        if candidates.len() + 1 < count {
            return Err(HaloError::Inventory(format!(
                "need {count} slots, only {} usable",
                candidates.len() + 1
            )));
        }

        let mut picked = vec![anchor];
        picked.extend(
            candidates
                .choose_multiple(&mut rand::thread_rng(), count - 1)
                .copied(),
        );
        Ok(picked)
    }

    /// # Errors
    ///
    /// Returns `Inventory` if `addr` is not a configured slot.
    pub fn mark_running(&mut self, addr: NodeAddr) -> Result<()> {
        self.slot_mut(addr)?.running = true;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Inventory` if `addr` is not a configured slot.
    pub fn mark_free(&mut self, addr: NodeAddr) -> Result<()> {
        self.slot_mut(addr)?.running = false;
        Ok(())
    }

    pub fn free_all(&mut self) {
        for slot in &mut self.slots {
            slot.running = false;
        }
    }

    fn slot_mut(&mut self, addr: NodeAddr) -> Result<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|s| s.addr == addr)
            .ok_or_else(|| HaloError::Inventory(format!("unknown slot {addr}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last_octet: u8) -> NodeAddr {
        NodeAddr::new(Ipv4Addr::new(10, 0, 0, last_octet), 6000)
    }

    fn inventory(n: u8) -> Inventory {
        Inventory::from_addrs((1..=n).map(addr).collect()).unwrap()
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let result = Inventory::from_addrs(vec![addr(1), addr(2), addr(1)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bootstrap_set_includes_anchor() {
        let inv = inventory(8);
        for _ in 0..20 {
            let picked = inv.pick_bootstrap_set(3, &HashSet::new()).unwrap();
            assert_eq!(picked.len(), 3);
            assert_eq!(picked[0], addr(1));
            let unique: HashSet<_> = picked.iter().copied().collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn test_bootstrap_set_exhausts_inventory() {
        let inv = inventory(3);
        let picked = inv.pick_bootstrap_set(3, &HashSet::new()).unwrap();
        assert_eq!(picked.len(), 3);

        assert!(inv.pick_bootstrap_set(4, &HashSet::new()).is_err());
        assert!(inv.pick_bootstrap_set(0, &HashSet::new()).is_err());
    }

    #[test]
    fn test_bootstrap_refuses_down_anchor() {
        let inv = inventory(3);
        let down: HashSet<_> = [addr(1)].into();
        assert!(inv.pick_bootstrap_set(2, &down).is_err());
    }

    #[test]
    fn test_pick_free_skips_running_and_down() {
        let mut inv = inventory(3);
        inv.mark_running(addr(1)).unwrap();
        let down: HashSet<_> = [addr(2)].into();

        for _ in 0..20 {
            assert_eq!(inv.pick_free(&down), Some(addr(3)));
        }

        inv.mark_running(addr(3)).unwrap();
        assert_eq!(inv.pick_free(&down), None);
    }

    #[test]
    fn test_mark_free_returns_slot_to_pool() {
        let mut inv = inventory(2);
        inv.mark_running(addr(1)).unwrap();
        inv.mark_running(addr(2)).unwrap();
        assert_eq!(inv.running_count(), 2);

        inv.mark_free(addr(1)).unwrap();
        assert_eq!(inv.running_count(), 1);
        assert_eq!(inv.pick_free(&HashSet::new()), Some(addr(1)));

        inv.free_all();
        assert_eq!(inv.running_count(), 0);
    }

    #[test]
    fn test_unknown_slot_rejected() {
        let mut inv = inventory(1);
        assert!(inv.mark_running(addr(9)).is_err());
        assert!(inv.mark_free(addr(9)).is_err());
    }
}
