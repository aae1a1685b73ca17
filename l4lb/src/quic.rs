//! Server-id table shared by QUIC connection-id routing, TCP server-id
//! routing and UDP stable routing.
//!
//! One server is usually registered twice: once under its CIDv1 id (the bare
//! 16-bit host id) and once under its CIDv2 id (host id with a job tag in bits
//! 16..24). Both keys point at the same Real.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use l4lb_common::{quic_cid_v2, QuicSlot, RealIndex, MAX_QUIC_SERVER_ID};
use serde::Deserialize;

use crate::error::{LbError, LbResult};

/// A server id and the Real it routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuicReal {
    #[serde(rename = "addr")]
    pub address: IpAddr,
    pub id: u32,
}

/// Published form of the table.
pub type ServerIdTable = HashMap<u32, QuicSlot>;

/// Outcome of resolving a server id against a published table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicLookup {
    Real(RealIndex),
    /// the id is known but points at the reserved index
    Unassigned,
    Unknown,
}

pub fn resolve(table: &ServerIdTable, id: u32) -> QuicLookup {
    classify(table.get(&id))
}

fn classify(slot: Option<&QuicSlot>) -> QuicLookup {
    match slot {
        Some(slot) => match slot.real() {
            Some(index) => QuicLookup::Real(index),
            None => QuicLookup::Unassigned,
        },
        None => QuicLookup::Unknown,
    }
}

/// CIDv1 and CIDv2 ids for one server identity.
pub fn cid_pair(host_id: u16, job: u8) -> [u32; 2] {
    [host_id as u32, quic_cid_v2(host_id, job)]
}

pub fn validate_id(id: u32) -> LbResult<()> {
    if id == 0 || id > MAX_QUIC_SERVER_ID {
        return Err(LbError::InvalidConfiguration(format!(
            "server id {} is outside 1..={}",
            id, MAX_QUIC_SERVER_ID
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct QuicMappingTable {
    // removed ids stay behind as unassigned slots
    entries: BTreeMap<u32, QuicSlot>,
}

impl QuicMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<RealIndex> {
        self.entries.get(&id).and_then(|slot| slot.real())
    }

    /// Points `id` at `index`; returns the Real it pointed at before.
    pub fn insert(&mut self, id: u32, index: RealIndex) -> Option<RealIndex> {
        self.entries
            .insert(id, QuicSlot::from_real(index))
            .and_then(|slot| slot.real())
    }

    /// Unassigns `id`; returns the Real it pointed at.
    pub fn remove(&mut self, id: u32) -> Option<RealIndex> {
        let slot = self.entries.get_mut(&id)?;
        let previous = slot.real();
        *slot = QuicSlot::UNASSIGNED;
        previous
    }

    pub fn lookup(&self, id: u32) -> QuicLookup {
        classify(self.entries.get(&id))
    }

    /// Assigned ids pointing at `index`.
    pub fn ids_for(&self, index: RealIndex) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, slot)| slot.real() == Some(index))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Assigned mappings in id order.
    pub fn mappings(&self) -> impl Iterator<Item = (u32, RealIndex)> + '_ {
        self.entries
            .iter()
            .filter_map(|(id, slot)| slot.real().map(|index| (*id, index)))
    }

    pub(crate) fn snapshot(&self) -> ServerIdTable {
        self.entries.iter().map(|(id, slot)| (*id, *slot)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_cid_versions_resolve_to_one_real() {
        let mut table = QuicMappingTable::new();
        for id in cid_pair(1022, 3) {
            table.insert(id, 4);
        }
        assert_eq!(table.lookup(1022), QuicLookup::Real(4));
        assert_eq!(table.lookup(0x030000 | 1022), QuicLookup::Real(4));
        assert_eq!(table.ids_for(4), vec![1022, 0x030000 | 1022]);
    }

    #[test]
    fn removed_id_reads_as_unassigned() {
        let mut table = QuicMappingTable::new();
        table.insert(1023, 0);
        assert_eq!(table.remove(1023), Some(0));
        assert_eq!(table.remove(1023), None);
        assert_eq!(table.lookup(1023), QuicLookup::Unassigned);
        assert_eq!(table.lookup(1024), QuicLookup::Unknown);
        assert_eq!(table.mappings().count(), 0);

        let published = table.snapshot();
        assert_eq!(resolve(&published, 1023), QuicLookup::Unassigned);
        assert_eq!(resolve(&published, 1024), QuicLookup::Unknown);
    }

    #[test]
    fn real_at_index_zero_is_not_the_sentinel() {
        let mut table = QuicMappingTable::new();
        table.insert(7, 0);
        assert_eq!(resolve(&table.snapshot(), 7), QuicLookup::Real(0));
    }

    #[test]
    fn id_range() {
        assert!(validate_id(0).is_err());
        assert!(validate_id(1).is_ok());
        assert!(validate_id(MAX_QUIC_SERVER_ID).is_ok());
        assert!(validate_id(MAX_QUIC_SERVER_ID + 1).is_err());
    }
}
