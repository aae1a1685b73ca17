//! Publication of the datapath tables.
//!
//! The control plane never edits a table a reader can see. It assembles a
//! complete [`Tables`] value off to the side and hands it to a [`Publisher`],
//! which makes it visible in one step. A reader that loaded the previous
//! snapshot keeps a consistent view of it for as long as it holds the `Arc`:
//! ring slots in a snapshot only name Reals present in that same snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use l4lb_common::{RealFlags, RealIndex, VipFlags, VipKey};

use crate::error::LbResult;
use crate::quic::{self, QuicLookup, ServerIdTable};
use crate::src_routing::LpmTable;

/// What the datapath knows about a VIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VipMeta {
    pub vip_num: u32,
    pub flags: VipFlags,
}

/// What the datapath knows about a Real.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealDefinition {
    pub address: IpAddr,
    pub flags: RealFlags,
}

/// One immutable generation of every table the datapath reads.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub generation: u64,
    pub vips: HashMap<VipKey, VipMeta>,
    /// Ring per `vip_num`.
    pub rings: HashMap<u32, Arc<[RealIndex]>>,
    pub reals: HashMap<RealIndex, RealDefinition>,
    /// Down Reals per `vip_num`.
    pub down_reals: HashMap<u32, Arc<BTreeSet<RealIndex>>>,
    pub server_ids: Arc<ServerIdTable>,
    pub src_routing: Arc<LpmTable>,
    pub decap_dsts: Arc<HashSet<IpAddr>>,
    pub healthcheck_dsts: Arc<BTreeMap<u32, IpAddr>>,
}

impl Tables {
    pub fn vip(&self, key: &VipKey) -> Option<&VipMeta> {
        self.vips.get(key)
    }

    pub fn ring(&self, vip_num: u32) -> Option<&[RealIndex]> {
        self.rings.get(&vip_num).map(|r| &r[..])
    }

    pub fn real(&self, index: RealIndex) -> Option<&RealDefinition> {
        self.reals.get(&index)
    }

    pub fn is_down(&self, vip_num: u32, index: RealIndex) -> bool {
        self.down_reals
            .get(&vip_num)
            .is_some_and(|set| set.contains(&index))
    }

    pub fn server_id(&self, id: u32) -> QuicLookup {
        quic::resolve(&self.server_ids, id)
    }
}

/// Sink for finished table generations.
pub trait Publisher: Send + Sync {
    /// Makes `tables` the generation readers see. Must be all or nothing.
    fn publish(&self, tables: Arc<Tables>) -> LbResult<()>;
}

/// In-process tables shared with readers through an atomic pointer swap.
#[derive(Debug)]
pub struct SharedTables {
    current: ArcSwap<Tables>,
}

impl SharedTables {
    pub fn new() -> Self {
        SharedTables {
            current: ArcSwap::from_pointee(Tables::default()),
        }
    }

    /// Cheap, lock-free access for per-packet readers.
    pub fn load(&self) -> Guard<Arc<Tables>> {
        self.current.load()
    }

    /// Snapshot that can be held across many lookups.
    pub fn snapshot(&self) -> Arc<Tables> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }
}

impl Default for SharedTables {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for SharedTables {
    fn publish(&self, tables: Arc<Tables>) -> LbResult<()> {
        self.current.store(tables);
        Ok(())
    }
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, tables: Arc<Tables>) -> LbResult<()> {
        (**self).publish(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn readers_keep_their_generation_across_a_swap() {
        let shared = Arc::new(SharedTables::new());
        let before = shared.snapshot();
        assert_eq!(before.generation, 0);

        let next = Tables {
            generation: 1,
            rings: HashMap::from([(0, Arc::from(vec![1, 2, 3]))]),
            ..Tables::default()
        };
        shared.publish(Arc::new(next)).unwrap();

        assert!(before.ring(0).is_none());
        assert_eq!(shared.generation(), 1);
        assert_eq!(shared.load().ring(0), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn concurrent_readers_never_see_a_ring_without_its_reals() {
        let shared = Arc::new(SharedTables::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let tables = shared.load();
                        if let Some(ring) = tables.ring(0) {
                            for idx in ring {
                                assert!(tables.real(*idx).is_some());
                            }
                        }
                    }
                })
            })
            .collect();

        for generation in 1..200u64 {
            let idx = (generation % 7) as RealIndex;
            let tables = Tables {
                generation,
                rings: HashMap::from([(0, Arc::from(vec![idx; 64]))]),
                reals: HashMap::from([(
                    idx,
                    RealDefinition {
                        address: IpAddr::from([10, 0, 0, idx as u8]),
                        flags: RealFlags::NONE,
                    },
                )]),
                ..Tables::default()
            };
            shared.publish(Arc::new(tables)).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
