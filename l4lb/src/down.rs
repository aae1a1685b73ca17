//! Per-VIP sets of Reals excluded from new ring slots.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use l4lb_common::{RealIndex, VipKey};

#[derive(Debug, Clone, Default)]
pub struct DownRealTracker {
    down: HashMap<VipKey, BTreeSet<RealIndex>>,
}

impl DownRealTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the Real was up before.
    pub fn mark_down(&mut self, vip: &VipKey, index: RealIndex) -> bool {
        self.down.entry(*vip).or_default().insert(index)
    }

    /// Returns true if the Real was down before.
    pub fn mark_up(&mut self, vip: &VipKey, index: RealIndex) -> bool {
        let Some(set) = self.down.get_mut(vip) else {
            return false;
        };
        let changed = set.remove(&index);
        if set.is_empty() {
            self.down.remove(vip);
        }
        changed
    }

    pub fn is_down(&self, vip: &VipKey, index: RealIndex) -> bool {
        self.down.get(vip).is_some_and(|set| set.contains(&index))
    }

    pub fn down_reals(&self, vip: &VipKey) -> Vec<RealIndex> {
        self.down
            .get(vip)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every down mark of a VIP. Returns true if there were any.
    pub fn clear(&mut self, vip: &VipKey) -> bool {
        self.down.remove(vip).is_some()
    }

    /// Down sets as published to the datapath, keyed by VIP.
    pub(crate) fn snapshot(&self) -> impl Iterator<Item = (&VipKey, Arc<BTreeSet<RealIndex>>)> {
        self.down.iter().map(|(k, set)| (k, Arc::new(set.clone())))
    }
}
