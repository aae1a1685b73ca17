//! The control-plane facade.
//!
//! [`LoadBalancer`] owns the authoritative configuration. Every mutation
//! validates its input, commits, rebuilds the rings it touched and publishes a
//! new [`Tables`] generation before returning.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use l4lb_common::{CounterKind, LbStats, RealFlags, RealIndex, VipFlags, VipKey, NO_REAL};
use log::{debug, info, warn};

use crate::config::LbConfig;
use crate::down::DownRealTracker;
use crate::error::{LbError, LbResult};
use crate::hash::{ConsistentHasher, Endpoint, RendezvousHasher};
use crate::publish::{Publisher, RealDefinition, Tables, VipMeta};
use crate::quic::{self, QuicLookup, QuicMappingTable, QuicReal};
use crate::reals::{validate_weight, Real, RealPool};
use crate::src_routing::{Cidr, SrcRoutingTable};
use crate::stats::Counters;
use crate::vip::{validate_flags, Vip, VipRegistry};

/// Weight used for Reals first created by a QUIC mapping or a source rule.
const DEFAULT_WEIGHT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyAction {
    Add,
    Del,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    AlreadyExists,
}

/// A Real as attached to a VIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewReal {
    pub address: IpAddr,
    pub weight: u32,
}

pub struct LoadBalancer {
    config: LbConfig,
    hasher: RendezvousHasher,
    reals: RealPool,
    vips: VipRegistry,
    down: DownRealTracker,
    quic: QuicMappingTable,
    src_routing: SrcRoutingTable,
    decap_dsts: BTreeSet<IpAddr>,
    healthcheck_dsts: BTreeMap<u32, IpAddr>,
    counters: Arc<Counters>,
    publisher: Arc<dyn Publisher>,
    generation: u64,
    pending: bool,
}

impl LoadBalancer {
    pub fn new(config: LbConfig, publisher: Arc<dyn Publisher>) -> LbResult<Self> {
        config.validate()?;
        let hasher = RendezvousHasher::new(config.ch_ring_size)?;
        let counters = Arc::new(Counters::new(
            config.max_vips,
            config.max_reals,
            config.optional_counters,
        ));
        info!(
            "control plane ready: ring size {}, {} vips, {} reals",
            config.ch_ring_size, config.max_vips, config.max_reals
        );
        Ok(LoadBalancer {
            reals: RealPool::new(config.max_reals),
            vips: VipRegistry::new(config.max_vips),
            down: DownRealTracker::new(),
            quic: QuicMappingTable::new(),
            src_routing: SrcRoutingTable::new(),
            decap_dsts: BTreeSet::new(),
            healthcheck_dsts: BTreeMap::new(),
            counters,
            publisher,
            generation: 0,
            pending: false,
            hasher,
            config,
        })
    }

    pub fn config(&self) -> &LbConfig {
        &self.config
    }

    /// Generation of the last successfully published tables.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when committed state has not reached the datapath yet.
    pub fn has_pending_publish(&self) -> bool {
        self.pending
    }

    // Reals

    /// Adds a Real to the pool and pins it there until `remove_real`.
    /// Repeating the call with the same weight is a no-op; a different weight
    /// is rejected, use `set_real_weight` for that.
    pub fn add_real(&mut self, address: IpAddr, weight: u32) -> LbResult<RealIndex> {
        validate_weight(address, weight)?;
        if let Some(existing) = self.get_real_index(&address).and_then(|i| self.reals.get(i)) {
            if existing.weight != weight {
                return Err(LbError::AlreadyExists(format!(
                    "real {} with weight {}",
                    address, existing.weight
                )));
            }
        }
        let (index, created) = self.reals.pin(address, weight)?;
        if !created {
            return Ok(index);
        }
        info!("added real {} with index {}", address, index);
        self.publish()?;
        Ok(index)
    }

    /// Removes a Real and everything that points at it.
    pub fn remove_real(&mut self, address: &IpAddr) -> LbResult<()> {
        let index = self.real_index(address)?;
        let members: Vec<VipKey> = self
            .vips
            .iter()
            .filter(|v| v.has_real(index))
            .map(|v| *v.key())
            .collect();
        for key in &members {
            if let Some(vip) = self.vips.get_mut(key) {
                vip.remove_member(index);
            }
            self.down.mark_up(key, index);
            self.rebuild(key)?;
        }
        for id in self.quic.ids_for(index) {
            self.quic.remove(id);
        }
        for prefix in self.src_routing.prefixes_for(index) {
            self.src_routing.remove(&prefix);
        }
        self.reals.evict(index);
        info!(
            "removed real {} (index {}) from {} vips",
            address,
            index,
            members.len()
        );
        self.publish()
    }

    pub fn modify_real(
        &mut self,
        address: &IpAddr,
        flags: RealFlags,
        action: ModifyAction,
    ) -> LbResult<()> {
        let index = self.real_index(address)?;
        let current = self.reals.get(index).map(|r| r.flags).unwrap_or_default();
        let next = match action {
            ModifyAction::Add => current.union(flags),
            ModifyAction::Del => current.difference(flags),
        };
        if next == current {
            return Ok(());
        }
        self.reals.set_flags(index, next);
        info!("real {} flags {:#x} -> {:#x}", address, current.bits(), next.bits());
        self.publish()
    }

    /// Changes the pool weight; VIPs with their own weight for the Real keep it.
    pub fn set_real_weight(&mut self, address: &IpAddr, weight: u32) -> LbResult<()> {
        validate_weight(*address, weight)?;
        let index = self.real_index(address)?;
        if self.reals.get(index).map(|r| r.weight) == Some(weight) {
            return Ok(());
        }
        self.reals.set_weight(index, weight);
        let affected: Vec<VipKey> = self
            .vips
            .iter()
            .filter(|v| v.members().any(|(i, w)| i == index && w.is_none()))
            .map(|v| *v.key())
            .collect();
        for key in &affected {
            self.rebuild(key)?;
        }
        info!("real {} weight set to {}", address, weight);
        self.publish()
    }

    pub fn get_real_index(&self, address: &IpAddr) -> Option<RealIndex> {
        self.reals.index_of(address)
    }

    pub fn get_real(&self, index: RealIndex) -> Option<&Real> {
        self.reals.get(index)
    }

    pub fn reals(&self) -> impl Iterator<Item = (RealIndex, &Real)> {
        self.reals.iter()
    }

    // VIPs

    pub fn add_vip(&mut self, key: VipKey, flags: VipFlags) -> LbResult<AddOutcome> {
        if let Some(vip) = self.vips.get(&key) {
            if vip.flags() == flags {
                return Ok(AddOutcome::AlreadyExists);
            }
            return Err(LbError::VipAlreadyExists(key));
        }
        validate_flags(&key, flags)?;
        let vip_num = self
            .vips
            .insert(key, flags, self.hasher.ring_size())?
            .vip_num();
        info!("added vip {} as {} with flags {:#x}", key, vip_num, flags.bits());
        self.publish()?;
        Ok(AddOutcome::Created)
    }

    pub fn remove_vip(&mut self, key: &VipKey) -> LbResult<()> {
        let vip = self.vips.remove(key).ok_or(LbError::VipNotFound(*key))?;
        self.down.clear(key);
        for (index, _) in vip.members() {
            self.reals.release(index);
        }
        info!("removed vip {} ({} reals)", key, vip.member_count());
        self.publish()
    }

    /// Sets or clears `flags` on a VIP.
    pub fn modify_vip(&mut self, key: &VipKey, flags: VipFlags, action: ModifyAction) -> LbResult<()> {
        let current = self.vips.lookup(key)?.flags();
        let next = match action {
            ModifyAction::Add => current.union(flags),
            ModifyAction::Del => current.difference(flags),
        };
        if next == current {
            return Ok(());
        }
        validate_flags(key, next)?;
        if let Some(vip) = self.vips.get_mut(key) {
            vip.set_flags(next);
        }
        if next.hashing_mode() != current.hashing_mode() {
            self.rebuild(key)?;
        }
        info!("vip {} flags {:#x} -> {:#x}", key, current.bits(), next.bits());
        self.publish()
    }

    pub fn add_real_to_vip(&mut self, key: &VipKey, real: &NewReal) -> LbResult<RealIndex> {
        self.modify_reals_for_vip(ModifyAction::Add, std::slice::from_ref(real), key)?;
        self.real_index(&real.address)
    }

    pub fn del_real_from_vip(&mut self, key: &VipKey, address: &IpAddr) -> LbResult<()> {
        let real = NewReal {
            address: *address,
            weight: DEFAULT_WEIGHT,
        };
        self.modify_reals_for_vip(ModifyAction::Del, &[real], key)
    }

    /// Adds or removes a batch of Reals with a single rebuild. Either every
    /// Real is applied or none is.
    pub fn modify_reals_for_vip(
        &mut self,
        action: ModifyAction,
        reals: &[NewReal],
        key: &VipKey,
    ) -> LbResult<()> {
        let vip = self.vips.lookup(key)?;
        let mut leaving = BTreeSet::new();
        let changed = match action {
            ModifyAction::Add => {
                // later entries for the same address win
                let batch: BTreeMap<IpAddr, u32> =
                    reals.iter().map(|r| (r.address, r.weight)).collect();
                for (address, weight) in &batch {
                    validate_weight(*address, *weight)?;
                }
                self.reals.check_room_for(batch.keys())?;
                let joining = batch
                    .keys()
                    .filter(|a| !self.reals.index_of(a).is_some_and(|i| vip.has_real(i)))
                    .count();
                self.check_ring_room(vip.member_count() + joining)?;
                let mut changed = 0;
                for (address, weight) in batch {
                    if self.attach(key, address, weight)? {
                        changed += 1;
                    }
                }
                changed
            }
            ModifyAction::Del => {
                for real in reals {
                    let index = self.real_index(&real.address)?;
                    if !vip.has_real(index) {
                        return Err(LbError::NotFound(format!(
                            "real {} in vip {}",
                            real.address, key
                        )));
                    }
                    leaving.insert(index);
                }
                for index in &leaving {
                    if let Some(vip) = self.vips.get_mut(key) {
                        vip.remove_member(*index);
                    }
                    self.down.mark_up(key, *index);
                }
                leaving.len()
            }
        };
        if changed == 0 {
            return Ok(());
        }
        self.rebuild(key)?;
        // after the rebuild, so no ring names a freed index
        for index in leaving {
            self.reals.release(index);
        }
        info!("{:?} {} reals on vip {}", action, changed, key);
        self.publish()
    }

    pub fn get_vip_flags(&self, key: &VipKey) -> LbResult<VipFlags> {
        Ok(self.vips.lookup(key)?.flags())
    }

    /// Members of a VIP with their effective weights, in index order.
    pub fn get_reals_for_vip(&self, key: &VipKey) -> LbResult<Vec<NewReal>> {
        let vip = self.vips.lookup(key)?;
        Ok(vip
            .members()
            .filter_map(|(index, weight)| {
                let real = self.reals.get(index)?;
                Some(NewReal {
                    address: real.address,
                    weight: weight.unwrap_or(real.weight),
                })
            })
            .collect())
    }

    pub fn get_all_vips(&self) -> Vec<VipKey> {
        self.vips.keys()
    }

    pub fn vip(&self, key: &VipKey) -> Option<&Vip> {
        self.vips.get(key)
    }

    // Down Reals

    pub fn mark_down(&mut self, key: &VipKey, index: RealIndex) -> LbResult<()> {
        self.check_member(key, index)?;
        if !self.down.mark_down(key, index) {
            return Ok(());
        }
        self.rebuild(key)?;
        info!("marked real index {} down on vip {}", index, key);
        self.publish()
    }

    pub fn mark_up(&mut self, key: &VipKey, index: RealIndex) -> LbResult<()> {
        self.check_member(key, index)?;
        if !self.down.mark_up(key, index) {
            return Ok(());
        }
        self.rebuild(key)?;
        info!("marked real index {} up on vip {}", index, key);
        self.publish()
    }

    pub fn is_down(&self, key: &VipKey, index: RealIndex) -> bool {
        self.down.is_down(key, index)
    }

    pub fn get_down_reals(&self, key: &VipKey) -> LbResult<Vec<RealIndex>> {
        self.vips.lookup(key)?;
        Ok(self.down.down_reals(key))
    }

    pub fn clear_down_reals(&mut self, key: &VipKey) -> LbResult<()> {
        self.vips.lookup(key)?;
        if !self.down.clear(key) {
            return Ok(());
        }
        self.rebuild(key)?;
        info!("cleared down reals of vip {}", key);
        self.publish()
    }

    // QUIC server ids

    pub fn modify_quic_reals_mapping(
        &mut self,
        action: ModifyAction,
        mappings: &[QuicReal],
    ) -> LbResult<()> {
        let mut changed = 0;
        match action {
            ModifyAction::Add => {
                let mut batch: BTreeMap<u32, IpAddr> = BTreeMap::new();
                for mapping in mappings {
                    quic::validate_id(mapping.id)?;
                    if let Some(other) = batch.insert(mapping.id, mapping.address) {
                        if other != mapping.address {
                            return Err(LbError::InvalidConfiguration(format!(
                                "server id {} given for both {} and {}",
                                mapping.id, other, mapping.address
                            )));
                        }
                    }
                }
                self.reals.check_room_for(batch.values())?;
                for (id, address) in batch {
                    let current = self.quic.get(id);
                    if current.is_some() && current == self.reals.index_of(&address) {
                        continue;
                    }
                    let index = self.reals.acquire(address, DEFAULT_WEIGHT)?;
                    if let Some(previous) = self.quic.insert(id, index) {
                        self.reals.release(previous);
                    }
                    changed += 1;
                }
            }
            ModifyAction::Del => {
                for mapping in mappings {
                    let current = self.quic.get(mapping.id);
                    if current.is_none() || current != self.reals.index_of(&mapping.address) {
                        return Err(LbError::NotFound(format!(
                            "server id {} for {}",
                            mapping.id, mapping.address
                        )));
                    }
                }
                for mapping in mappings {
                    if let Some(index) = self.quic.remove(mapping.id) {
                        self.reals.release(index);
                        changed += 1;
                    }
                }
            }
        }
        if changed == 0 {
            return Ok(());
        }
        info!("{:?} {} quic server ids", action, changed);
        self.publish()
    }

    pub fn add_quic_mapping(&mut self, address: IpAddr, id: u32) -> LbResult<()> {
        self.modify_quic_reals_mapping(ModifyAction::Add, &[QuicReal { address, id }])
    }

    pub fn remove_quic_mapping(&mut self, id: u32) -> LbResult<()> {
        let index = self
            .quic
            .remove(id)
            .ok_or_else(|| LbError::NotFound(format!("server id {}", id)))?;
        self.reals.release(index);
        info!("removed quic server id {}", id);
        self.publish()
    }

    /// Registers one server under both its CIDv1 and CIDv2 ids.
    pub fn add_quic_server(&mut self, address: IpAddr, host_id: u16, job: u8) -> LbResult<()> {
        quic::validate_id(host_id as u32)?;
        let mappings = quic::cid_pair(host_id, job).map(|id| QuicReal { address, id });
        self.modify_quic_reals_mapping(ModifyAction::Add, &mappings)
    }

    /// Assigned server ids in id order.
    pub fn get_quic_mapping(&self) -> Vec<QuicReal> {
        self.quic
            .mappings()
            .filter_map(|(id, index)| {
                self.reals.get(index).map(|real| QuicReal {
                    address: real.address,
                    id,
                })
            })
            .collect()
    }

    pub fn lookup_quic(&self, id: u32) -> QuicLookup {
        self.quic.lookup(id)
    }

    // Source routing

    pub fn add_src_routing_rule<S: AsRef<str>>(&mut self, srcs: &[S], dst: IpAddr) -> LbResult<()> {
        let prefixes = parse_prefixes(srcs)?;
        let dst_index = self.reals.index_of(&dst).unwrap_or(NO_REAL);
        self.src_routing.check_conflicts(&prefixes, dst_index)?;
        let new: Vec<Cidr> = prefixes
            .into_iter()
            .filter(|p| self.src_routing.get(p).is_none())
            .collect();
        if new.is_empty() {
            return Ok(());
        }
        if self.src_routing.len() + new.len() > self.config.max_src_routing_rules as usize {
            return Err(LbError::CapacityExceeded(format!(
                "at most {} source routing rules",
                self.config.max_src_routing_rules
            )));
        }
        self.reals.check_room_for([dst].iter())?;
        for prefix in &new {
            let index = self.reals.acquire(dst, DEFAULT_WEIGHT)?;
            self.src_routing.insert(*prefix, index);
        }
        info!("routing {} source prefixes to {}", new.len(), dst);
        self.publish()
    }

    pub fn del_src_routing_rule<S: AsRef<str>>(&mut self, srcs: &[S]) -> LbResult<()> {
        let prefixes = parse_prefixes(srcs)?;
        if let Some(missing) = prefixes.iter().find(|p| self.src_routing.get(p).is_none()) {
            return Err(LbError::NotFound(format!("source routing rule {}", missing)));
        }
        for prefix in &prefixes {
            if let Some(index) = self.src_routing.remove(prefix) {
                self.reals.release(index);
            }
        }
        info!("removed {} source routing rules", prefixes.len());
        self.publish()
    }

    pub fn clear_all_src_routing_rules(&mut self) -> LbResult<()> {
        if self.src_routing.is_empty() {
            return Ok(());
        }
        let released = self.src_routing.drain();
        for index in &released {
            self.reals.release(*index);
        }
        info!("cleared {} source routing rules", released.len());
        self.publish()
    }

    pub fn get_src_routing_rules(&self) -> Vec<(Cidr, IpAddr)> {
        self.src_routing
            .rules()
            .filter_map(|(prefix, index)| self.reals.get(index).map(|r| (*prefix, r.address)))
            .collect()
    }

    /// Destination of the longest prefix covering `src`.
    pub fn resolve_src(&self, src: &IpAddr) -> Option<IpAddr> {
        let index = self.src_routing.resolve(src)?;
        self.reals.get(index).map(|r| r.address)
    }

    // Inline decap destinations

    pub fn add_inline_decap_dst(&mut self, dst: IpAddr) -> LbResult<()> {
        if self.decap_dsts.contains(&dst) {
            return Err(LbError::AlreadyExists(format!("decap destination {}", dst)));
        }
        if self.decap_dsts.len() >= self.config.max_decap_dsts as usize {
            return Err(LbError::CapacityExceeded(format!(
                "at most {} decap destinations",
                self.config.max_decap_dsts
            )));
        }
        self.decap_dsts.insert(dst);
        info!("added inline decap destination {}", dst);
        self.publish()
    }

    pub fn del_inline_decap_dst(&mut self, dst: &IpAddr) -> LbResult<()> {
        if !self.decap_dsts.remove(dst) {
            return Err(LbError::NotFound(format!("decap destination {}", dst)));
        }
        info!("removed inline decap destination {}", dst);
        self.publish()
    }

    pub fn get_inline_decap_dsts(&self) -> Vec<IpAddr> {
        self.decap_dsts.iter().copied().collect()
    }

    // Health-check destinations

    /// Points health-check probes tagged `id` at `dst`, replacing any
    /// previous destination for that id.
    pub fn add_healthchecker_dst(&mut self, id: u32, dst: IpAddr) -> LbResult<()> {
        if self.healthcheck_dsts.get(&id) == Some(&dst) {
            return Ok(());
        }
        if !self.healthcheck_dsts.contains_key(&id)
            && self.healthcheck_dsts.len() >= self.config.max_healthcheck_dsts as usize
        {
            return Err(LbError::CapacityExceeded(format!(
                "at most {} healthcheck destinations",
                self.config.max_healthcheck_dsts
            )));
        }
        self.healthcheck_dsts.insert(id, dst);
        info!("healthcheck id {} -> {}", id, dst);
        self.publish()
    }

    pub fn del_healthchecker_dst(&mut self, id: u32) -> LbResult<()> {
        if self.healthcheck_dsts.remove(&id).is_none() {
            return Err(LbError::NotFound(format!("healthcheck id {}", id)));
        }
        info!("removed healthcheck id {}", id);
        self.publish()
    }

    pub fn get_healthchecker_dsts(&self) -> BTreeMap<u32, IpAddr> {
        self.healthcheck_dsts.clone()
    }

    // Counters

    /// Shared counter store, handed to whatever processes packets.
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn get_counter(&self, kind: CounterKind) -> u64 {
        self.counters.get(kind)
    }

    pub fn get_counters(&self) -> BTreeMap<CounterKind, u64> {
        self.counters.all()
    }

    /// Zero for unknown VIPs.
    pub fn get_vip_stats(&self, key: &VipKey) -> LbStats {
        self.vips
            .get(key)
            .map(|vip| self.counters.vip(vip.vip_num()))
            .unwrap_or_default()
    }

    pub fn get_real_stats(&self, index: RealIndex) -> LbStats {
        self.counters.real(index)
    }

    // Publication

    /// Retries a publish that failed earlier.
    pub fn republish(&mut self) -> LbResult<()> {
        self.publish()
    }

    /// Snapshot of the committed state, as it would be published next.
    pub fn build_tables(&self) -> Tables {
        let mut tables = Tables {
            generation: self.generation + 1,
            server_ids: Arc::new(self.quic.snapshot()),
            src_routing: Arc::new(self.src_routing.snapshot()),
            decap_dsts: Arc::new(self.decap_dsts.iter().copied().collect()),
            healthcheck_dsts: Arc::new(self.healthcheck_dsts.clone()),
            ..Tables::default()
        };
        let mut vip_nums = HashMap::new();
        for vip in self.vips.iter() {
            vip_nums.insert(*vip.key(), vip.vip_num());
            tables.vips.insert(
                *vip.key(),
                VipMeta {
                    vip_num: vip.vip_num(),
                    flags: vip.flags(),
                },
            );
            tables.rings.insert(vip.vip_num(), Arc::clone(vip.ring()));
        }
        for (index, real) in self.reals.iter() {
            tables.reals.insert(
                index,
                RealDefinition {
                    address: real.address,
                    flags: real.flags,
                },
            );
        }
        for (key, set) in self.down.snapshot() {
            if let Some(num) = vip_nums.get(key) {
                tables.down_reals.insert(*num, set);
            }
        }
        tables
    }

    fn publish(&mut self) -> LbResult<()> {
        let tables = Arc::new(self.build_tables());
        let generation = tables.generation;
        match self.publisher.publish(tables) {
            Ok(()) => {
                self.generation = generation;
                self.pending = false;
                debug!("published tables generation {}", generation);
                Ok(())
            }
            Err(err) => {
                self.pending = true;
                warn!("publishing tables generation {} failed: {}", generation, err);
                Err(match err {
                    LbError::PublishFailure(_) => err,
                    other => LbError::PublishFailure(other.to_string()),
                })
            }
        }
    }

    // Internals

    fn real_index(&self, address: &IpAddr) -> LbResult<RealIndex> {
        self.reals
            .index_of(address)
            .ok_or(LbError::RealNotFound(*address))
    }

    fn check_member(&self, key: &VipKey, index: RealIndex) -> LbResult<()> {
        if !self.vips.lookup(key)?.has_real(index) {
            return Err(LbError::NotFound(format!("real index {} in vip {}", index, key)));
        }
        Ok(())
    }

    fn check_ring_room(&self, members: usize) -> LbResult<()> {
        if members > self.hasher.ring_size() as usize {
            return Err(LbError::CapacityExceeded(format!(
                "{} reals do not fit a ring of {} slots",
                members,
                self.hasher.ring_size()
            )));
        }
        Ok(())
    }

    /// Attaches or re-weights one member without rebuilding. Returns true if
    /// the VIP changed.
    fn attach(&mut self, key: &VipKey, address: IpAddr, weight: u32) -> LbResult<bool> {
        let member = self.reals.index_of(&address).filter(|i| {
            self.vips.get(key).is_some_and(|v| v.has_real(*i))
        });
        let index = match member {
            Some(index) => index,
            None => self.reals.acquire(address, weight)?,
        };
        let pool_weight = self.reals.get(index).map(|r| r.weight).unwrap_or(weight);
        let weight = (weight != pool_weight).then_some(weight);
        let Some(vip) = self.vips.get_mut(key) else {
            return Ok(false);
        };
        if member.is_some() && vip.members().any(|(i, w)| i == index && w == weight) {
            return Ok(false);
        }
        vip.set_member(index, weight);
        Ok(true)
    }

    fn endpoints(&self, vip: &Vip) -> Vec<Endpoint> {
        vip.members()
            .filter_map(|(index, weight)| {
                let real = self.reals.get(index)?;
                let weight = if self.down.is_down(vip.key(), index) {
                    0
                } else {
                    weight.unwrap_or(real.weight)
                };
                Some(Endpoint {
                    index,
                    address: real.address,
                    weight,
                })
            })
            .collect()
    }

    fn rebuild(&mut self, key: &VipKey) -> LbResult<()> {
        let vip = self.vips.lookup(key)?;
        let endpoints = self.endpoints(vip);
        let ring = self
            .hasher
            .generate_hash_ring(vip.seed(), &endpoints, Some(&vip.ring()[..]))?;
        debug!(
            "rebuilt ring of vip {} over {} reals",
            key,
            endpoints.iter().filter(|e| e.weight > 0).count()
        );
        if let Some(vip) = self.vips.get_mut(key) {
            vip.set_ring(ring.into());
        }
        Ok(())
    }
}

fn parse_prefixes<S: AsRef<str>>(srcs: &[S]) -> LbResult<Vec<Cidr>> {
    let mut prefixes: Vec<Cidr> = srcs
        .iter()
        .map(|s| s.as_ref().parse())
        .collect::<LbResult<_>>()?;
    prefixes.sort();
    prefixes.dedup();
    Ok(prefixes)
}
