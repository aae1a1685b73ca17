//! VIP registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use l4lb_common::{RealIndex, VipFlags, VipKey, NO_REAL};
use network_types::ip::IpProto;

use crate::error::{LbError, LbResult};
use crate::hash::vip_seed;

/// Checks the documented flag combinations for a VIP.
pub fn validate_flags(key: &VipKey, flags: VipFlags) -> LbResult<()> {
    let udp_only = VipFlags::QUIC | VipFlags::UDP_STABLE_ROUTING | VipFlags::UDP_FLOW_MIGRATION;
    if flags.intersects(udp_only) && !matches!(key.proto, IpProto::Udp) {
        return Err(LbError::InvalidConfiguration(format!(
            "vip {}: quic, stable routing and flow migration need udp",
            key
        )));
    }
    if flags.contains(VipFlags::QUIC | VipFlags::UDP_STABLE_ROUTING) {
        return Err(LbError::InvalidConfiguration(format!(
            "vip {}: quic and udp stable routing cannot be combined",
            key
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Vip {
    key: VipKey,
    vip_num: u32,
    flags: VipFlags,
    seed: u32,
    // member index -> per-vip weight, None meaning the pool weight
    reals: BTreeMap<RealIndex, Option<u32>>,
    ring: Arc<[RealIndex]>,
}

impl Vip {
    fn new(key: VipKey, vip_num: u32, flags: VipFlags, ring_size: u32) -> Self {
        Vip {
            key,
            vip_num,
            flags,
            seed: vip_seed(&key),
            reals: BTreeMap::new(),
            ring: vec![NO_REAL; ring_size as usize].into(),
        }
    }

    pub fn key(&self) -> &VipKey {
        &self.key
    }

    /// Dense number used by the datapath for per-VIP rings and stats.
    pub fn vip_num(&self) -> u32 {
        self.vip_num
    }

    pub fn flags(&self) -> VipFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: VipFlags) {
        self.flags = flags;
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn has_real(&self, index: RealIndex) -> bool {
        self.reals.contains_key(&index)
    }

    pub fn members(&self) -> impl Iterator<Item = (RealIndex, Option<u32>)> + '_ {
        self.reals.iter().map(|(i, w)| (*i, *w))
    }

    pub fn member_count(&self) -> usize {
        self.reals.len()
    }

    pub(crate) fn set_member(&mut self, index: RealIndex, weight: Option<u32>) -> bool {
        self.reals.insert(index, weight).is_none()
    }

    pub(crate) fn remove_member(&mut self, index: RealIndex) -> bool {
        self.reals.remove(&index).is_some()
    }

    /// Ring currently published for this VIP.
    pub fn ring(&self) -> &Arc<[RealIndex]> {
        &self.ring
    }

    pub(crate) fn set_ring(&mut self, ring: Arc<[RealIndex]>) {
        self.ring = ring;
    }
}

#[derive(Debug, Clone)]
pub struct VipRegistry {
    vips: HashMap<VipKey, Vip>,
    free_nums: BTreeSet<u32>,
    next_num: u32,
    capacity: u32,
}

impl VipRegistry {
    pub fn new(capacity: u32) -> Self {
        VipRegistry {
            vips: HashMap::new(),
            free_nums: BTreeSet::new(),
            next_num: 0,
            capacity,
        }
    }

    pub fn get(&self, key: &VipKey) -> Option<&Vip> {
        self.vips.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &VipKey) -> Option<&mut Vip> {
        self.vips.get_mut(key)
    }

    pub fn lookup(&self, key: &VipKey) -> LbResult<&Vip> {
        self.vips.get(key).ok_or(LbError::VipNotFound(*key))
    }

    pub fn len(&self) -> usize {
        self.vips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vip> {
        self.vips.values()
    }

    /// Keys in address, port, protocol order.
    pub fn keys(&self) -> Vec<VipKey> {
        let mut keys: Vec<VipKey> = self.vips.keys().copied().collect();
        keys.sort_by_key(|k| k.sort_key());
        keys
    }

    pub(crate) fn insert(&mut self, key: VipKey, flags: VipFlags, ring_size: u32) -> LbResult<&Vip> {
        if self.vips.contains_key(&key) {
            return Err(LbError::VipAlreadyExists(key));
        }
        let vip_num = match self.free_nums.iter().next().copied() {
            Some(num) => {
                self.free_nums.remove(&num);
                num
            }
            None if self.next_num < self.capacity => {
                self.next_num += 1;
                self.next_num - 1
            }
            None => {
                return Err(LbError::CapacityExceeded(format!(
                    "at most {} vips can be configured",
                    self.capacity
                )))
            }
        };
        Ok(self
            .vips
            .entry(key)
            .or_insert_with(|| Vip::new(key, vip_num, flags, ring_size)))
    }

    pub(crate) fn remove(&mut self, key: &VipKey) -> Option<Vip> {
        let vip = self.vips.remove(key)?;
        self.free_nums.insert(vip.vip_num);
        Some(vip)
    }
}
