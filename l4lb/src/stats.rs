//! Counters written by the datapath and read back by the control plane.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use l4lb_common::{CounterKind, LbStats, RealIndex};

#[derive(Debug, Default)]
struct StatsSlot {
    v1: AtomicU64,
    v2: AtomicU64,
}

impl StatsSlot {
    fn add(&self, v1: u64, v2: u64) {
        self.v1.fetch_add(v1, Ordering::Relaxed);
        self.v2.fetch_add(v2, Ordering::Relaxed);
    }

    fn read(&self) -> LbStats {
        LbStats {
            v1: self.v1.load(Ordering::Relaxed),
            v2: self.v2.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-size counter arrays, sized like datapath maps: one slot per counter
/// kind, per `vip_num` and per Real index.
#[derive(Debug)]
pub struct Counters {
    global: Vec<AtomicU64>,
    vips: Vec<StatsSlot>,
    reals: Vec<StatsSlot>,
    optional: bool,
}

impl Counters {
    pub fn new(max_vips: u32, max_reals: u32, optional: bool) -> Self {
        Counters {
            global: (0..CounterKind::COUNT).map(|_| AtomicU64::new(0)).collect(),
            vips: (0..max_vips).map(|_| StatsSlot::default()).collect(),
            reals: (0..max_reals).map(|_| StatsSlot::default()).collect(),
            optional,
        }
    }

    pub fn optional_enabled(&self) -> bool {
        self.optional
    }

    pub fn incr(&self, kind: CounterKind) {
        self.add(kind, 1);
    }

    /// Optional kinds are dropped unless enabled.
    pub fn add(&self, kind: CounterKind, n: u64) {
        if kind.is_optional() && !self.optional {
            return;
        }
        self.global[kind as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_vip(&self, vip_num: u32, bytes: u64) {
        if let Some(slot) = self.vips.get(vip_num as usize) {
            slot.add(1, bytes);
        }
    }

    pub fn add_real(&self, index: RealIndex, bytes: u64) {
        if let Some(slot) = self.reals.get(index as usize) {
            slot.add(1, bytes);
        }
    }

    pub fn get(&self, kind: CounterKind) -> u64 {
        self.global
            .get(kind as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Zero for numbers no VIP ever had.
    pub fn vip(&self, vip_num: u32) -> LbStats {
        self.vips
            .get(vip_num as usize)
            .map(StatsSlot::read)
            .unwrap_or_default()
    }

    pub fn real(&self, index: RealIndex) -> LbStats {
        self.reals
            .get(index as usize)
            .map(StatsSlot::read)
            .unwrap_or_default()
    }

    pub fn all(&self) -> BTreeMap<CounterKind, u64> {
        CounterKind::ALL.iter().map(|k| (*k, self.get(*k))).collect()
    }
}
