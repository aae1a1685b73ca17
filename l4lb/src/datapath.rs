//! Userspace reader of the published tables.
//!
//! Resolves already-parsed packet metadata to a Real exactly the way a
//! packet-processing engine consuming [`SharedTables`] would, and writes the
//! same raw counters. Used to exercise the published contract end to end.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use l4lb_common::{
    CounterKind, FiveTuple, RealFlags, RealIndex, VipFlags, VipKey, MAX_QUIC_SERVER_ID, NO_REAL,
};
use log::trace;
use network_types::ip::IpProto;

use crate::config::LbConfig;
use crate::publish::{RealDefinition, SharedTables, Tables, VipMeta};
use crate::quic::QuicLookup;
use crate::stats::Counters;

const FLOW_HASH_SEED: u32 = 0x5f4c_4234;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidVersion {
    V1,
    V2,
}

/// Server id extracted from a QUIC short-header connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicCid {
    pub version: CidVersion,
    pub server_id: u32,
}

/// Server id carried in a UDP stable routing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableRoutingHeader {
    /// false when the header type byte is not one the datapath understands
    pub valid_type: bool,
    pub server_id: u32,
}

/// Packet metadata as produced by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub flow: FiveTuple,
    pub len: u16,
    pub tcp_syn: bool,
    pub quic_cid: Option<QuicCid>,
    pub tcp_server_id: Option<u32>,
    pub stable_routing: Option<StableRoutingHeader>,
    /// outer destination of an encapsulated packet
    pub outer_dst: Option<IpAddr>,
}

impl Packet {
    pub fn new(flow: FiveTuple, len: u16) -> Self {
        Packet {
            flow,
            len,
            tcp_syn: false,
            quic_cid: None,
            tcp_server_id: None,
            stable_routing: None,
            outer_dst: None,
        }
    }

    pub fn syn(mut self) -> Self {
        self.tcp_syn = true;
        self
    }

    pub fn with_quic_cid(mut self, version: CidVersion, server_id: u32) -> Self {
        self.quic_cid = Some(QuicCid { version, server_id });
        self
    }

    pub fn with_tcp_server_id(mut self, server_id: u32) -> Self {
        self.tcp_server_id = Some(server_id);
        self
    }

    pub fn with_stable_routing(mut self, valid_type: bool, server_id: u32) -> Self {
        self.stable_routing = Some(StableRoutingHeader {
            valid_type,
            server_id,
        });
        self
    }

    pub fn encapsulated_to(mut self, outer_dst: IpAddr) -> Self {
        self.outer_dst = Some(outer_dst);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// the VIP's ring has no Real
    NoReal,
    /// stable routing named a server id with no Real behind it
    UnknownStableRoutingReal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// not addressed to a VIP
    Pass,
    Forward { real: RealIndex, address: IpAddr },
    /// local VIP whose chosen Real is on this host
    Local { real: RealIndex },
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy)]
struct FlowEntry {
    real: RealIndex,
    address: IpAddr,
}

#[derive(Debug)]
struct FlowCache {
    entries: HashMap<FiveTuple, FlowEntry>,
    order: VecDeque<FiveTuple>,
    capacity: usize,
}

impl FlowCache {
    fn new(capacity: usize) -> Self {
        FlowCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, flow: &FiveTuple) -> Option<FlowEntry> {
        self.entries.get(flow).copied()
    }

    fn insert(&mut self, flow: FiveTuple, entry: FlowEntry) {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
        if self.entries.insert(flow, entry).is_none() {
            self.order.push_back(flow);
        }
    }

    fn remove(&mut self, flow: &FiveTuple) {
        if self.entries.remove(flow).is_some() {
            self.order.retain(|f| f != flow);
        }
    }
}

pub struct Datapath {
    tables: Arc<SharedTables>,
    counters: Arc<Counters>,
    flows: Mutex<FlowCache>,
    tcp_server_id_routing: bool,
}

impl Datapath {
    pub fn new(tables: Arc<SharedTables>, counters: Arc<Counters>, config: &LbConfig) -> Self {
        Datapath {
            tables,
            counters,
            flows: Mutex::new(FlowCache::new(config.flow_cache_size as usize)),
            tcp_server_id_routing: config.tcp_server_id_routing,
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Number of pinned flows.
    pub fn flow_count(&self) -> usize {
        self.flow_cache().entries.len()
    }

    pub fn cached_real(&self, flow: &FiveTuple) -> Option<RealIndex> {
        self.flow_cache().get(flow).map(|e| e.real)
    }

    fn flow_cache(&self) -> std::sync::MutexGuard<'_, FlowCache> {
        self.flows.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn process(&self, pkt: &Packet) -> Verdict {
        let tables = self.tables.load();
        let flow = &pkt.flow;
        let bytes = pkt.len as u64;
        self.counters.incr(CounterKind::TotalPkts);

        match flow.proto as u8 {
            IPPROTO_ICMP => {
                self.counters.incr(CounterKind::IcmpV4Counts);
                return Verdict::Pass;
            }
            IPPROTO_ICMPV6 => {
                self.counters.incr(CounterKind::IcmpV6Counts);
                return Verdict::Pass;
            }
            _ => {}
        }

        if let Some(outer) = pkt.outer_dst {
            if tables.decap_dsts.contains(&outer) {
                self.counters.incr(CounterKind::InlineDecapPkts);
            }
        }

        let key = VipKey::new(flow.dst_addr, flow.dst_port, flow.proto);
        let meta = match tables.vip(&key).or_else(|| tables.vip(&key.any_port())) {
            Some(meta) => *meta,
            None => return Verdict::Pass,
        };
        self.counters.add_vip(meta.vip_num, bytes);
        let is_udp = matches!(flow.proto, IpProto::Udp);
        let is_tcp = matches!(flow.proto, IpProto::Tcp);

        if meta.flags.contains(VipFlags::SRC_ROUTING) {
            if let Some((index, real)) = tables
                .src_routing
                .lookup(&flow.source_addr)
                .and_then(|i| tables.real(i).map(|r| (i, r)))
            {
                if real.flags.contains(RealFlags::LOCAL) {
                    self.counters.incr(CounterKind::SrcRoutingPktsLocal);
                } else {
                    self.counters.incr(CounterKind::SrcRoutingPktsRemote);
                }
                return self.deliver(&meta, index, real, bytes);
            }
        }

        if meta.flags.contains(VipFlags::QUIC) {
            if let Some(cid) = pkt.quic_cid {
                self.counters.incr(match cid.version {
                    CidVersion::V1 => CounterKind::QuicCidV1,
                    CidVersion::V2 => CounterKind::QuicCidV2,
                });
                match tables.server_id(cid.server_id) {
                    QuicLookup::Real(index) => match tables.real(index) {
                        Some(real) => {
                            self.counters.incr(CounterKind::QuicRoutingWithCid);
                            return self.deliver(&meta, index, real, bytes);
                        }
                        None => self.counters.incr(CounterKind::QuicCidDropsNoReal),
                    },
                    QuicLookup::Unassigned => self.counters.incr(CounterKind::QuicCidDropsReal0),
                    QuicLookup::Unknown => {}
                }
            }
            self.counters.incr(CounterKind::QuicRoutingWithCh);
        }

        if is_tcp && self.tcp_server_id_routing && !pkt.tcp_syn {
            if let Some(server_id) = pkt.tcp_server_id {
                if let QuicLookup::Real(index) = tables.server_id(server_id) {
                    if let Some(real) = tables.real(index) {
                        self.counters.incr(CounterKind::TcpServerIdRouting);
                        return self.deliver(&meta, index, real, bytes);
                    }
                }
                self.counters.incr(CounterKind::TcpServerIdRoutingFallbackCh);
            }
        }

        if is_udp && meta.flags.contains(VipFlags::UDP_STABLE_ROUTING) {
            match pkt.stable_routing {
                Some(hdr) if !hdr.valid_type => {
                    self.counters.incr(CounterKind::StableRtInvalidPacketType);
                }
                Some(hdr) if hdr.server_id == 0 || hdr.server_id > MAX_QUIC_SERVER_ID => {
                    self.counters.incr(CounterKind::StableRtCidInvalidServerId);
                }
                Some(hdr) => {
                    let resolved = match tables.server_id(hdr.server_id) {
                        QuicLookup::Real(index) => tables.real(index).map(|r| (index, r)),
                        _ => None,
                    };
                    return match resolved {
                        Some((index, real)) => {
                            self.counters.incr(CounterKind::StableRtCidRouting);
                            self.deliver(&meta, index, real, bytes)
                        }
                        None => {
                            self.counters.incr(CounterKind::StableRtCidUnknownRealDropped);
                            Verdict::Drop(DropReason::UnknownStableRoutingReal)
                        }
                    };
                }
                None => self.counters.incr(CounterKind::StableRtChRouting),
            }
        }

        let use_cache = !meta.flags.contains(VipFlags::LRU_BYPASS);
        if use_cache {
            if let Some(verdict) = self.lookup_flow(&tables, &meta, flow, is_udp, bytes) {
                return verdict;
            }
            self.counters.incr(CounterKind::LruMisses);
            if is_tcp {
                if pkt.tcp_syn {
                    self.counters.incr(CounterKind::TcpSyns);
                } else {
                    self.counters.incr(CounterKind::NonSynLruMisses);
                }
            }
        }

        let ring = tables.ring(meta.vip_num).unwrap_or(&[]);
        let index = if ring.is_empty() {
            NO_REAL
        } else {
            let hash = flow_hash(flow, meta.flags) as usize;
            ring[hash & (ring.len() - 1)]
        };
        let Some(real) = tables.real(index) else {
            self.counters.incr(CounterKind::LruFallbackHits);
            return Verdict::Drop(DropReason::NoReal);
        };
        if use_cache {
            self.flow_cache().insert(
                *flow,
                FlowEntry {
                    real: index,
                    address: real.address,
                },
            );
        }
        self.deliver(&meta, index, real, bytes)
    }

    fn lookup_flow(
        &self,
        tables: &Tables,
        meta: &VipMeta,
        flow: &FiveTuple,
        is_udp: bool,
        bytes: u64,
    ) -> Option<Verdict> {
        let mut cache = self.flow_cache();
        let entry = cache.get(flow)?;
        let real = match tables.real(entry.real) {
            // the index may have been freed and handed to another address
            Some(real) if real.address == entry.address => real,
            _ => {
                cache.remove(flow);
                return None;
            }
        };
        if is_udp
            && meta.flags.contains(VipFlags::UDP_FLOW_MIGRATION)
            && tables.is_down(meta.vip_num, entry.real)
        {
            trace!("invalidating flow pinned to down real {}", entry.real);
            cache.remove(flow);
            self.counters.incr(CounterKind::UdpFlowMigrationStats);
            return None;
        }
        drop(cache);
        Some(self.deliver(meta, entry.real, real, bytes))
    }

    fn deliver(&self, meta: &VipMeta, index: RealIndex, real: &RealDefinition, bytes: u64) -> Verdict {
        self.counters.add_real(index, bytes);
        if meta.flags.contains(VipFlags::LOCAL_VIP) && real.flags.contains(RealFlags::LOCAL) {
            Verdict::Local { real: index }
        } else {
            Verdict::Forward {
                real: index,
                address: real.address,
            }
        }
    }
}

fn push_addr(buf: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(a) => buf.extend_from_slice(&a.octets()),
        IpAddr::V6(a) => buf.extend_from_slice(&a.octets()),
    }
}

/// Ring hash of a flow under the VIP's hashing flags.
pub fn flow_hash(flow: &FiveTuple, flags: VipFlags) -> u32 {
    let mut buf = Vec::with_capacity(40);
    if flags.contains(VipFlags::DPORT_HASH) {
        buf.extend_from_slice(&flow.dst_port.to_be_bytes());
    } else {
        push_addr(&mut buf, &flow.source_addr);
        if !flags.contains(VipFlags::NO_SRC_PORT) {
            buf.extend_from_slice(&flow.source_port.to_be_bytes());
        }
        push_addr(&mut buf, &flow.dst_addr);
        buf.extend_from_slice(&flow.dst_port.to_be_bytes());
        buf.push(flow.proto as u8);
    }
    mur3::murmurhash3_x86_32(&buf, FLOW_HASH_SEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(src: &str, sport: u16, dst: &str, dport: u16, proto: IpProto) -> FiveTuple {
        FiveTuple {
            source_addr: src.parse().unwrap(),
            source_port: sport,
            dst_addr: dst.parse().unwrap(),
            dst_port: dport,
            proto,
        }
    }

    #[test]
    fn dport_hash_ignores_source() {
        let a = flow("192.168.1.1", 1000, "10.200.1.4", 80, IpProto::Tcp);
        let b = flow("172.16.0.9", 2000, "10.200.1.4", 80, IpProto::Tcp);
        assert_eq!(flow_hash(&a, VipFlags::DPORT_HASH), flow_hash(&b, VipFlags::DPORT_HASH));
        assert_ne!(flow_hash(&a, VipFlags::NONE), flow_hash(&b, VipFlags::NONE));
    }

    #[test]
    fn no_src_port_hashes_by_source_address() {
        let a = flow("192.168.1.1", 1000, "10.200.1.1", 80, IpProto::Udp);
        let b = flow("192.168.1.1", 2000, "10.200.1.1", 80, IpProto::Udp);
        assert_eq!(
            flow_hash(&a, VipFlags::NO_SRC_PORT),
            flow_hash(&b, VipFlags::NO_SRC_PORT)
        );
        // dport-only wins when both are set
        assert_eq!(
            flow_hash(&a, VipFlags::NO_SRC_PORT | VipFlags::DPORT_HASH),
            flow_hash(&a, VipFlags::DPORT_HASH)
        );
    }

    #[test]
    fn flow_cache_is_bounded() {
        let mut cache = FlowCache::new(2);
        let entry = FlowEntry {
            real: 0,
            address: "10.0.0.1".parse().unwrap(),
        };
        for port in 1..=3 {
            cache.insert(flow("192.168.1.1", port, "10.200.1.1", 80, IpProto::Udp), entry);
        }
        assert_eq!(cache.entries.len(), 2);
        assert!(cache
            .get(&flow("192.168.1.1", 1, "10.200.1.1", 80, IpProto::Udp))
            .is_none());
    }
}
