#![cfg_attr(not(test), no_std)]

//! Types shared between the l4lb control plane and the datapath that reads
//! the tables it publishes.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::net::IpAddr;
use core::ops::BitOr;

use network_types::ip::IpProto;

/// Index of a Real in the Real pool.
pub type RealIndex = u32;

/// Ring slot value meaning "no Real to pick".
pub const NO_REAL: RealIndex = u32::MAX;

/// Default number of slots in a per-VIP consistent hash ring.
pub const DEFAULT_CH_RING_SIZE: u32 = 65536;

/// Largest server id accepted in the QUIC / server-id table (24 bits).
pub const MAX_QUIC_SERVER_ID: u32 = 0x00ff_ffff;
/// Host id bits of a CIDv1 server id.
pub const QUIC_CID_V1_MASK: u32 = 0x0000_ffff;
/// Shift of the job tag packed into a CIDv2 server id.
pub const QUIC_CID_V2_JOB_SHIFT: u32 = 16;
/// Width mask of the CIDv2 job tag.
pub const QUIC_CID_V2_JOB_MASK: u32 = 0xff;

// This is a 5tuple struct which is used to identify a flow
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FiveTuple {
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub proto: IpProto,
}

impl Hash for FiveTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_addr.hash(state);
        self.source_port.hash(state);
        self.dst_addr.hash(state);
        self.dst_port.hash(state);
        (self.proto as u8).hash(state);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VipKey {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: IpProto,
}

impl VipKey {
    pub fn new(addr: IpAddr, port: u16, proto: IpProto) -> Self {
        VipKey { addr, port, proto }
    }

    /// The port-0 key a packet falls back to when no VIP matches its port.
    pub fn any_port(&self) -> Self {
        VipKey { port: 0, ..*self }
    }

    /// Bytes fed to hashers seeded by VIP identity.
    pub fn hash_bytes(&self) -> ([u8; 19], usize) {
        let mut buf = [0u8; 19];
        let len = match self.addr {
            IpAddr::V4(a) => {
                buf[..4].copy_from_slice(&a.octets());
                4
            }
            IpAddr::V6(a) => {
                buf[..16].copy_from_slice(&a.octets());
                16
            }
        };
        buf[len..len + 2].copy_from_slice(&self.port.to_be_bytes());
        buf[len + 2] = self.proto as u8;
        (buf, len + 3)
    }

    /// Total order used when listing VIPs.
    pub fn sort_key(&self) -> (IpAddr, u16, u8) {
        (self.addr, self.port, self.proto as u8)
    }
}

impl Hash for VipKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.port.hash(state);
        (self.proto as u8).hash(state);
    }
}

impl fmt::Display for VipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port)?,
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port)?,
        }
        match self.proto {
            IpProto::Tcp => f.write_str("/tcp"),
            IpProto::Udp => f.write_str("/udp"),
            other => write!(f, "/{}", other as u8),
        }
    }
}

/// Per-VIP routing modifiers. Each bit is checked independently by the
/// datapath.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct VipFlags(u32);

impl VipFlags {
    pub const NONE: VipFlags = VipFlags(0);
    /// hash on source address only, ignoring the source port
    pub const NO_SRC_PORT: VipFlags = VipFlags(1 << 0);
    /// never pin flows in the connection table
    pub const LRU_BYPASS: VipFlags = VipFlags(1 << 1);
    /// route by the server id carried in QUIC connection ids
    pub const QUIC: VipFlags = VipFlags(1 << 2);
    /// hash on the destination port only
    pub const DPORT_HASH: VipFlags = VipFlags(1 << 3);
    /// redirect matching source prefixes to their configured destination
    pub const SRC_ROUTING: VipFlags = VipFlags(1 << 4);
    /// deliver locally when the chosen Real is local
    pub const LOCAL_VIP: VipFlags = VipFlags(1 << 5);
    /// route by the server id carried in the UDP stable routing header
    pub const UDP_STABLE_ROUTING: VipFlags = VipFlags(1 << 8);
    /// invalidate pinned flows whose Real went down
    pub const UDP_FLOW_MIGRATION: VipFlags = VipFlags(1 << 9);

    const ALL: u32 = Self::NO_SRC_PORT.0
        | Self::LRU_BYPASS.0
        | Self::QUIC.0
        | Self::DPORT_HASH.0
        | Self::SRC_ROUTING.0
        | Self::LOCAL_VIP.0
        | Self::UDP_STABLE_ROUTING.0
        | Self::UDP_FLOW_MIGRATION.0;

    /// Returns `None` if `bits` carries an unknown flag.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            None
        } else {
            Some(VipFlags(bits))
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: VipFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: VipFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: VipFlags) -> Self {
        VipFlags(self.0 | other.0)
    }

    pub const fn difference(self, other: VipFlags) -> Self {
        VipFlags(self.0 & !other.0)
    }

    /// Flags that change which packet fields feed the ring hash.
    pub const fn hashing_mode(self) -> Self {
        VipFlags(self.0 & (Self::NO_SRC_PORT.0 | Self::DPORT_HASH.0))
    }
}

impl BitOr for VipFlags {
    type Output = VipFlags;

    fn bitor(self, rhs: VipFlags) -> VipFlags {
        self.union(rhs)
    }
}

/// Per-Real flags.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RealFlags(u8);

impl RealFlags {
    pub const NONE: RealFlags = RealFlags(0);
    /// the Real lives on this host
    pub const LOCAL: RealFlags = RealFlags(1 << 1);

    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::LOCAL.0 != 0 {
            None
        } else {
            Some(RealFlags(bits))
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: RealFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: RealFlags) -> Self {
        RealFlags(self.0 | other.0)
    }

    pub const fn difference(self, other: RealFlags) -> Self {
        RealFlags(self.0 & !other.0)
    }
}

/// Value stored in the published server-id table. Zero is reserved for
/// "mapping exists but is not assigned"; otherwise it holds `index + 1`.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QuicSlot(u32);

impl QuicSlot {
    pub const UNASSIGNED: QuicSlot = QuicSlot(0);

    pub const fn from_real(index: RealIndex) -> Self {
        QuicSlot(index + 1)
    }

    pub const fn real(self) -> Option<RealIndex> {
        match self.0 {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Builds the CIDv2 server id for `host_id` tagged with `job`.
pub const fn quic_cid_v2(host_id: u16, job: u8) -> u32 {
    ((job as u32 & QUIC_CID_V2_JOB_MASK) << QUIC_CID_V2_JOB_SHIFT) | host_id as u32
}

/// Packets/bytes pair, the shape every datapath stats slot has.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LbStats {
    pub v1: u64,
    pub v2: u64,
}

/// Global counters maintained by the datapath.
///
/// New kinds are appended; a kind a datapath never writes reads as zero.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterKind {
    TotalPkts = 0,
    LruMisses,
    TcpSyns,
    NonSynLruMisses,
    /// lookups that found no Real in the ring either
    LruFallbackHits,
    QuicRoutingWithCh,
    QuicRoutingWithCid,
    QuicCidV1,
    QuicCidV2,
    QuicCidDropsReal0,
    QuicCidDropsNoReal,
    TcpServerIdRouting,
    TcpServerIdRoutingFallbackCh,
    TotalFailedBpfCalls,
    TotalAddressValidationFailed,
    IcmpV4Counts,
    IcmpV6Counts,
    SrcRoutingPktsLocal,
    SrcRoutingPktsRemote,
    InlineDecapPkts,
    StableRtChRouting,
    StableRtCidRouting,
    StableRtCidInvalidServerId,
    StableRtCidUnknownRealDropped,
    StableRtInvalidPacketType,
    XpopDecapSuccessful,
    XpopDecapSuccessfulV4,
    XpopDecapSuccessfulV6,
    UdpFlowMigrationStats,
}

impl CounterKind {
    pub const COUNT: usize = CounterKind::UdpFlowMigrationStats as usize + 1;

    pub const ALL: [CounterKind; CounterKind::COUNT] = [
        CounterKind::TotalPkts,
        CounterKind::LruMisses,
        CounterKind::TcpSyns,
        CounterKind::NonSynLruMisses,
        CounterKind::LruFallbackHits,
        CounterKind::QuicRoutingWithCh,
        CounterKind::QuicRoutingWithCid,
        CounterKind::QuicCidV1,
        CounterKind::QuicCidV2,
        CounterKind::QuicCidDropsReal0,
        CounterKind::QuicCidDropsNoReal,
        CounterKind::TcpServerIdRouting,
        CounterKind::TcpServerIdRoutingFallbackCh,
        CounterKind::TotalFailedBpfCalls,
        CounterKind::TotalAddressValidationFailed,
        CounterKind::IcmpV4Counts,
        CounterKind::IcmpV6Counts,
        CounterKind::SrcRoutingPktsLocal,
        CounterKind::SrcRoutingPktsRemote,
        CounterKind::InlineDecapPkts,
        CounterKind::StableRtChRouting,
        CounterKind::StableRtCidRouting,
        CounterKind::StableRtCidInvalidServerId,
        CounterKind::StableRtCidUnknownRealDropped,
        CounterKind::StableRtInvalidPacketType,
        CounterKind::XpopDecapSuccessful,
        CounterKind::XpopDecapSuccessfulV4,
        CounterKind::XpopDecapSuccessfulV6,
        CounterKind::UdpFlowMigrationStats,
    ];

    /// Counters a datapath only maintains when built with optional counters.
    pub const fn is_optional(self) -> bool {
        matches!(
            self,
            CounterKind::IcmpV4Counts
                | CounterKind::IcmpV6Counts
                | CounterKind::SrcRoutingPktsLocal
                | CounterKind::SrcRoutingPktsRemote
                | CounterKind::InlineDecapPkts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn counter_kinds_are_dense() {
        for (i, kind) in CounterKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
        }
    }

    #[test]
    fn vip_flags_reject_unknown_bits() {
        assert_eq!(VipFlags::from_bits(4 | 8), Some(VipFlags::QUIC | VipFlags::DPORT_HASH));
        assert_eq!(VipFlags::from_bits(1 << 6), None);
        assert!(VipFlags::from_bits(256 | 512)
            .unwrap()
            .contains(VipFlags::UDP_FLOW_MIGRATION));
    }

    #[test]
    fn quic_slot_reserves_zero() {
        assert_eq!(QuicSlot::UNASSIGNED.real(), None);
        assert_eq!(QuicSlot::from_real(0).real(), Some(0));
        assert_eq!(QuicSlot::from_real(0).raw(), 1);
    }

    #[test]
    fn cid_v2_packs_job_above_host_id() {
        assert_eq!(quic_cid_v2(1022, 3), 0x030000 | 1022);
        assert_eq!(quic_cid_v2(1022, 3) & QUIC_CID_V1_MASK, 1022);
    }

    #[test]
    fn vip_key_hash_bytes_cover_port_and_proto() {
        let vip = VipKey::new(IpAddr::V4(Ipv4Addr::new(10, 200, 1, 1)), 80, IpProto::Udp);
        let (buf, len) = vip.hash_bytes();
        assert_eq!(len, 7);
        assert_eq!(&buf[..len], &[10, 200, 1, 1, 0, 80, 17]);
        assert_eq!(vip.any_port().port, 0);
    }
}
