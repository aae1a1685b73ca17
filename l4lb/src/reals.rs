//! The Real pool: one arena of backend addresses keyed by a stable index.
//!
//! VIPs, QUIC mappings and source-routing rules hold indices into the pool,
//! never the records themselves. A Real stays allocated while it has at least
//! one reference or an explicit pin; its index is constant for that whole
//! time, which is what keeps ring slots meaningful across rebuilds.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use l4lb_common::{RealFlags, RealIndex};
use log::debug;

use crate::error::{LbError, LbResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Real {
    pub address: IpAddr,
    /// Weight used by VIPs that do not override it.
    pub weight: u32,
    pub flags: RealFlags,
    refs: u32,
    pinned: bool,
}

impl Real {
    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

pub(crate) fn validate_weight(address: IpAddr, weight: u32) -> LbResult<()> {
    if weight == 0 {
        return Err(LbError::InvalidConfiguration(format!(
            "real {} must have a weight of at least 1",
            address
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RealPool {
    slots: Vec<Option<Real>>,
    by_addr: HashMap<IpAddr, RealIndex>,
    free: BTreeSet<RealIndex>,
    // previous owner of each free index, so a quick re-add gets it back
    retired: HashMap<RealIndex, IpAddr>,
    capacity: u32,
}

impl RealPool {
    pub fn new(capacity: u32) -> Self {
        RealPool {
            slots: Vec::new(),
            by_addr: HashMap::new(),
            free: BTreeSet::new(),
            retired: HashMap::new(),
            capacity,
        }
    }

    pub fn index_of(&self, address: &IpAddr) -> Option<RealIndex> {
        self.by_addr.get(address).copied()
    }

    pub fn get(&self, index: RealIndex) -> Option<&Real> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Live Reals in index order.
    pub fn iter(&self) -> impl Iterator<Item = (RealIndex, &Real)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i as RealIndex, r)))
    }

    /// Number of indices still available for new addresses.
    pub fn available(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.by_addr.len())
    }

    /// Ensures `address` has capacity to be created if it is new.
    pub(crate) fn check_room_for<'a, I>(&self, addresses: I) -> LbResult<()>
    where
        I: IntoIterator<Item = &'a IpAddr>,
    {
        let mut new: BTreeSet<&IpAddr> = BTreeSet::new();
        for addr in addresses {
            if !self.by_addr.contains_key(addr) {
                new.insert(addr);
            }
        }
        if new.len() > self.available() {
            return Err(LbError::CapacityExceeded(format!(
                "real pool holds at most {} reals",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Takes a reference on `address`, creating it with `weight` if absent.
    pub fn acquire(&mut self, address: IpAddr, weight: u32) -> LbResult<RealIndex> {
        let index = match self.index_of(&address) {
            Some(index) => index,
            None => self.create(address, weight)?,
        };
        if let Some(real) = self.slot_mut(index) {
            real.refs += 1;
        }
        Ok(index)
    }

    /// Drops a reference; frees the index when nothing holds the Real.
    /// Returns true if the Real was freed.
    pub fn release(&mut self, index: RealIndex) -> bool {
        let Some(real) = self.slot_mut(index) else {
            return false;
        };
        real.refs = real.refs.saturating_sub(1);
        if real.refs == 0 && !real.pinned {
            self.free_index(index);
            return true;
        }
        false
    }

    /// Pins `address` so it outlives its references. Returns the index and
    /// whether the Real was created by this call.
    pub fn pin(&mut self, address: IpAddr, weight: u32) -> LbResult<(RealIndex, bool)> {
        let (index, created) = match self.index_of(&address) {
            Some(index) => (index, false),
            None => (self.create(address, weight)?, true),
        };
        if let Some(real) = self.slot_mut(index) {
            real.pinned = true;
        }
        Ok((index, created))
    }

    /// Frees the index regardless of references. Callers detach every holder
    /// first.
    pub fn evict(&mut self, index: RealIndex) -> Option<Real> {
        let real = self.get(index)?.clone();
        self.free_index(index);
        Some(real)
    }

    pub fn set_weight(&mut self, index: RealIndex, weight: u32) {
        if let Some(real) = self.slot_mut(index) {
            real.weight = weight;
        }
    }

    pub fn set_flags(&mut self, index: RealIndex, flags: RealFlags) {
        if let Some(real) = self.slot_mut(index) {
            real.flags = flags;
        }
    }

    fn slot_mut(&mut self, index: RealIndex) -> Option<&mut Real> {
        self.slots.get_mut(index as usize).and_then(Option::as_mut)
    }

    fn create(&mut self, address: IpAddr, weight: u32) -> LbResult<RealIndex> {
        validate_weight(address, weight)?;
        let index = self.allocate_index(&address)?;
        let real = Real {
            address,
            weight,
            flags: RealFlags::NONE,
            refs: 0,
            pinned: false,
        };
        if index as usize == self.slots.len() {
            self.slots.push(Some(real));
        } else {
            self.slots[index as usize] = Some(real);
        }
        self.by_addr.insert(address, index);
        debug!("allocated real index {} for {}", index, address);
        Ok(index)
    }

    // own previous index first, then a never used one, then the lowest free
    fn allocate_index(&mut self, address: &IpAddr) -> LbResult<RealIndex> {
        let previous = self
            .free
            .iter()
            .copied()
            .find(|i| self.retired.get(i) == Some(address));
        let index = match previous {
            Some(index) => index,
            None if (self.slots.len() as u64) < self.capacity as u64 => {
                return Ok(self.slots.len() as RealIndex);
            }
            None => match self.free.iter().next().copied() {
                Some(index) => index,
                None => {
                    return Err(LbError::CapacityExceeded(format!(
                        "real pool holds at most {} reals",
                        self.capacity
                    )))
                }
            },
        };
        self.free.remove(&index);
        self.retired.remove(&index);
        Ok(index)
    }

    fn free_index(&mut self, index: RealIndex) {
        if let Some(real) = self.slots.get_mut(index as usize).and_then(Option::take) {
            self.by_addr.remove(&real.address);
            self.free.insert(index);
            self.retired.insert(index, real.address);
            debug!("freed real index {} ({})", index, real.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn indices_are_allocated_in_order_and_shared() {
        let mut pool = RealPool::new(16);
        assert_eq!(pool.acquire(ip("10.0.0.1"), 1).unwrap(), 0);
        assert_eq!(pool.acquire(ip("10.0.0.2"), 1).unwrap(), 1);
        assert_eq!(pool.acquire(ip("10.0.0.1"), 1).unwrap(), 0);
        assert_eq!(pool.get(0).unwrap().refs(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn real_is_freed_with_its_last_reference() {
        let mut pool = RealPool::new(16);
        let idx = pool.acquire(ip("10.0.0.1"), 1).unwrap();
        pool.acquire(ip("10.0.0.1"), 1).unwrap();
        assert!(!pool.release(idx));
        assert!(pool.release(idx));
        assert!(pool.get(idx).is_none());
        assert_eq!(pool.index_of(&ip("10.0.0.1")), None);
    }

    #[test]
    fn readded_address_gets_its_index_back() {
        let mut pool = RealPool::new(16);
        pool.acquire(ip("10.0.0.1"), 1).unwrap();
        let idx = pool.acquire(ip("10.0.0.2"), 1).unwrap();
        pool.acquire(ip("10.0.0.3"), 1).unwrap();
        pool.release(idx);
        pool.acquire(ip("10.0.0.4"), 1).unwrap();
        assert_eq!(pool.acquire(ip("10.0.0.2"), 1).unwrap(), idx);
    }

    #[test]
    fn free_indices_are_reused_when_pool_is_full() {
        let mut pool = RealPool::new(2);
        pool.acquire(ip("10.0.0.1"), 1).unwrap();
        let idx = pool.acquire(ip("10.0.0.2"), 1).unwrap();
        assert!(matches!(
            pool.acquire(ip("10.0.0.3"), 1),
            Err(LbError::CapacityExceeded(_))
        ));
        pool.release(idx);
        assert_eq!(pool.acquire(ip("10.0.0.3"), 1).unwrap(), idx);
    }

    #[test]
    fn pinned_real_survives_release() {
        let mut pool = RealPool::new(4);
        let (idx, created) = pool.pin(ip("10.0.0.9"), 3).unwrap();
        assert!(created);
        pool.acquire(ip("10.0.0.9"), 1).unwrap();
        assert!(!pool.release(idx));
        assert_eq!(pool.get(idx).unwrap().weight, 3);
        assert!(pool.evict(idx).is_some());
        assert!(pool.get(idx).is_none());
    }

    #[test]
    fn zero_weight_is_rejected() {
        let mut pool = RealPool::new(4);
        assert!(matches!(
            pool.acquire(ip("10.0.0.1"), 0),
            Err(LbError::InvalidConfiguration(_))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn room_check_only_counts_new_addresses() {
        let mut pool = RealPool::new(2);
        pool.acquire(ip("10.0.0.1"), 1).unwrap();
        let addrs = [ip("10.0.0.1"), ip("10.0.0.2")];
        assert!(pool.check_room_for(addrs.iter()).is_ok());
        let addrs = [ip("10.0.0.2"), ip("10.0.0.3")];
        assert!(pool.check_room_for(addrs.iter()).is_err());
    }
}
