use std::cmp::Reverse;
use std::net::IpAddr;

use l4lb_common::{RealIndex, VipKey, NO_REAL};
use log::debug;

use crate::error::{LbError, LbResult};

const VIP_SEED: u32 = 0x4c34_4c42;
const SALT: u32 = 0x9e37_79b9;
const SLOT_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

pub const MIN_RING_SIZE: u32 = 16;
pub const MAX_RING_SIZE: u32 = 1 << 24;

/// A Real as the ring builder sees it for one VIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub index: RealIndex,
    pub address: IpAddr,
    /// Zero for Reals that must not receive new slots.
    pub weight: u32,
}

pub trait ConsistentHasher {
    /// Builds the ring for a VIP. The result depends only on `seed` and the
    /// `(address, weight)` pairs in `endpoints`; `previous` is the ring
    /// currently published and is only compared against.
    fn generate_hash_ring(
        &self,
        seed: u32,
        endpoints: &[Endpoint],
        previous: Option<&[RealIndex]>,
    ) -> LbResult<Vec<RealIndex>>;

    fn ring_size(&self) -> u32;
}

/// Seed for everything hashed on behalf of one VIP.
pub fn vip_seed(vip: &VipKey) -> u32 {
    let (buf, len) = vip.hash_bytes();
    mur3::murmurhash3_x86_32(&buf[..len], VIP_SEED)
}

fn addr_bytes(addr: &IpAddr) -> ([u8; 16], usize) {
    let mut buf = [0u8; 16];
    match addr {
        IpAddr::V4(a) => {
            buf[..4].copy_from_slice(&a.octets());
            (buf, 4)
        }
        IpAddr::V6(a) => {
            buf.copy_from_slice(&a.octets());
            (buf, 16)
        }
    }
}

fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Per-slot score of one Real. Lower wins.
#[derive(Debug, Clone, Copy)]
struct Scorer {
    key: u64,
    weight: f64,
}

impl Scorer {
    fn new(seed: u32, endpoint: &Endpoint) -> Self {
        let (buf, len) = addr_bytes(&endpoint.address);
        let hi = mur3::murmurhash3_x86_32(&buf[..len], seed) as u64;
        let lo = mur3::murmurhash3_x86_32(&buf[..len], seed ^ SALT) as u64;
        Scorer {
            key: (hi << 32) | lo,
            weight: endpoint.weight as f64,
        }
    }

    /// Weighted rendezvous score: `-ln(u) / w` for a uniform `u` in (0, 1].
    fn score(&self, slot: usize) -> f64 {
        let x = mix64(self.key ^ (slot as u64).wrapping_mul(SLOT_MIX));
        let u = ((x >> 11) + 1) as f64 / (1u64 << 53) as f64;
        -u.ln() / self.weight
    }
}

/// Slot quota per endpoint: largest remainder of `weight / total * size`.
/// Quotas add up to `size` and each is within one slot of the exact share.
pub fn quotas(weights: &[u32], size: u32) -> Vec<u32> {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        return vec![0; weights.len()];
    }
    let mut quotas = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let share = *w as u64 * size as u64;
        quotas.push((share / total) as u32);
        remainders.push((share % total, i));
    }
    let assigned: u64 = quotas.iter().map(|q| *q as u64).sum();
    let mut left = size as u64 - assigned;
    // ties go to the endpoint listed first
    remainders.sort_by_key(|(rem, i)| (Reverse(*rem), *i));
    for (_, i) in remainders {
        if left == 0 {
            break;
        }
        quotas[i] += 1;
        left -= 1;
    }
    quotas
}

/// Weighted rendezvous ring with exact quotas.
///
/// Every slot goes to the eligible Real with the lowest weighted score for
/// it, scores being derived from the Real address, the slot number and the
/// VIP seed. Reals above their quota then hand slots to Reals below theirs,
/// cheapest score difference first, until every quota is met. A slot only
/// changes owner when the Real holding it leaves, or when quotas shift enough
/// to tip the balancing step, so a single membership change moves little more
/// than that Real's share.
#[derive(Debug, Clone, Copy)]
pub struct RendezvousHasher {
    ring_size: u32,
}

impl RendezvousHasher {
    pub fn new(ring_size: u32) -> LbResult<Self> {
        if !ring_size.is_power_of_two() || !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&ring_size) {
            return Err(LbError::InvalidConfiguration(format!(
                "ring size {} must be a power of two between {} and {}",
                ring_size, MIN_RING_SIZE, MAX_RING_SIZE
            )));
        }
        Ok(RendezvousHasher { ring_size })
    }
}

impl ConsistentHasher for RendezvousHasher {
    fn generate_hash_ring(
        &self,
        seed: u32,
        endpoints: &[Endpoint],
        previous: Option<&[RealIndex]>,
    ) -> LbResult<Vec<RealIndex>> {
        let size = self.ring_size as usize;
        let mut eligible: Vec<&Endpoint> = endpoints.iter().filter(|e| e.weight > 0).collect();
        if eligible.is_empty() {
            return Ok(vec![NO_REAL; size]);
        }
        if eligible.len() > size {
            return Err(LbError::CapacityExceeded(format!(
                "{} eligible reals do not fit a ring of {} slots",
                eligible.len(),
                size
            )));
        }
        eligible.sort_by(|a, b| a.address.cmp(&b.address));

        let weights: Vec<u32> = eligible.iter().map(|e| e.weight).collect();
        let quota = quotas(&weights, self.ring_size);
        let scorers: Vec<Scorer> = eligible.iter().map(|e| Scorer::new(seed, e)).collect();

        let mut owner = vec![0usize; size];
        let mut owned = vec![0u32; eligible.len()];
        for (slot, o) in owner.iter_mut().enumerate() {
            *o = lowest(&scorers, 0..scorers.len(), slot);
            owned[*o] += 1;
        }

        let mut balanced = 0usize;
        loop {
            let under: Vec<usize> = (0..eligible.len()).filter(|p| owned[*p] < quota[*p]).collect();
            if under.is_empty() {
                break;
            }
            let mut moves: Vec<(f64, usize, usize)> = Vec::new();
            for (slot, o) in owner.iter().enumerate() {
                if owned[*o] <= quota[*o] {
                    continue;
                }
                let to = lowest(&scorers, under.iter().copied(), slot);
                let cost = scorers[to].score(slot) - scorers[*o].score(slot);
                moves.push((cost, slot, to));
            }
            moves.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            for (_, slot, to) in moves {
                let from = owner[slot];
                if owned[from] <= quota[from] || owned[to] >= quota[to] {
                    continue;
                }
                owner[slot] = to;
                owned[from] -= 1;
                owned[to] += 1;
                balanced += 1;
            }
        }

        let ring: Vec<RealIndex> = owner.iter().map(|o| eligible[*o].index).collect();
        let moved = previous
            .filter(|prev| prev.len() == size)
            .map(|prev| prev.iter().zip(&ring).filter(|(a, b)| a != b).count());
        debug!(
            "ring built: {} reals, {} slots rebalanced, {:?} slots moved",
            eligible.len(),
            balanced,
            moved
        );
        Ok(ring)
    }

    fn ring_size(&self) -> u32 {
        self.ring_size
    }
}

fn lowest(scorers: &[Scorer], candidates: impl Iterator<Item = usize>, slot: usize) -> usize {
    let mut best = (f64::INFINITY, 0usize);
    for pos in candidates {
        let score = scorers[pos].score(slot);
        if score < best.0 {
            best = (score, pos);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SIZE: u32 = 4096;

    fn endpoints(weights: &[u32]) -> Vec<Endpoint> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| Endpoint {
                index: i as RealIndex,
                address: IpAddr::from([10, 0, (i / 256) as u8, (i % 256) as u8]),
                weight: *w,
            })
            .collect()
    }

    fn counts(ring: &[RealIndex], n: usize) -> Vec<u32> {
        let mut c = vec![0u32; n];
        for slot in ring {
            c[*slot as usize] += 1;
        }
        c
    }

    #[test]
    fn rejects_bad_ring_sizes() {
        assert!(RendezvousHasher::new(1000).is_err());
        assert!(RendezvousHasher::new(8).is_err());
        assert!(RendezvousHasher::new(65536).is_ok());
    }

    #[test]
    fn quotas_sum_to_size() {
        assert_eq!(quotas(&[1, 1, 1], 16), vec![6, 5, 5]);
        assert_eq!(quotas(&[1, 3], 16), vec![4, 12]);
        assert_eq!(quotas(&[0, 0], 16), vec![0, 0]);
    }

    #[test]
    fn empty_membership_yields_empty_ring() {
        let hasher = RendezvousHasher::new(SIZE).unwrap();
        let ring = hasher.generate_hash_ring(7, &endpoints(&[0, 0]), None).unwrap();
        assert!(ring.iter().all(|s| *s == NO_REAL));
    }

    #[test]
    fn too_many_reals_for_ring() {
        let hasher = RendezvousHasher::new(MIN_RING_SIZE).unwrap();
        let eps = endpoints(&[1; 17]);
        assert!(matches!(
            hasher.generate_hash_ring(1, &eps, None),
            Err(LbError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn build_is_independent_of_input_order() {
        let hasher = RendezvousHasher::new(SIZE).unwrap();
        let eps = endpoints(&[1, 2, 3, 4]);
        let mut reversed = eps.clone();
        reversed.reverse();
        let a = hasher.generate_hash_ring(42, &eps, None).unwrap();
        let b = hasher.generate_hash_ring(42, &reversed, None).unwrap();
        assert_eq!(a, b);
    }

    fn moved(a: &[RealIndex], b: &[RealIndex]) -> usize {
        a.iter().zip(b).filter(|(x, y)| x != y).count()
    }

    #[test]
    fn removing_one_real_moves_about_its_share() {
        let hasher = RendezvousHasher::new(SIZE).unwrap();
        let eps = endpoints(&[1, 1, 1, 1]);
        let before = hasher.generate_hash_ring(3, &eps, None).unwrap();
        let after = hasher.generate_hash_ring(3, &eps[..3], Some(&before)).unwrap();
        let share = (SIZE / 4) as usize;
        let n = moved(&before, &after);
        assert!(n >= share && n < share * 3 / 2, "moved {}", n);
        assert!(after.iter().all(|s| *s != 3));
    }

    #[test]
    fn adding_a_real_takes_about_its_share() {
        let hasher = RendezvousHasher::new(SIZE).unwrap();
        let eps = endpoints(&[1, 1, 1, 1]);
        let before = hasher.generate_hash_ring(3, &eps[..3], None).unwrap();
        let after = hasher.generate_hash_ring(3, &eps, Some(&before)).unwrap();
        assert_eq!(counts(&after, 4), vec![1024; 4]);
        let n = moved(&before, &after);
        assert!(n >= 1024 && n < 1024 * 3 / 2, "moved {}", n);
    }

    #[test]
    fn zero_weight_and_back_restores_the_ring() {
        let hasher = RendezvousHasher::new(SIZE).unwrap();
        let mut eps = endpoints(&[3, 1, 2]);
        let original = hasher.generate_hash_ring(9, &eps, None).unwrap();
        eps[1].weight = 0;
        let down = hasher.generate_hash_ring(9, &eps, Some(&original)).unwrap();
        assert!(down.iter().all(|s| *s != 1));
        eps[1].weight = 1;
        let up = hasher.generate_hash_ring(9, &eps, Some(&down)).unwrap();
        assert_eq!(up, original);
    }

    #[test]
    fn previous_ring_does_not_change_the_result() {
        let hasher = RendezvousHasher::new(SIZE).unwrap();
        let eps = endpoints(&[2, 5, 1, 1]);
        let fresh = hasher.generate_hash_ring(5, &eps, None).unwrap();
        let unrelated = vec![0; SIZE as usize];
        let reused = hasher.generate_hash_ring(5, &eps, Some(&unrelated)).unwrap();
        assert_eq!(fresh, reused);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn every_slot_is_assigned_within_rounding(weights in prop::collection::vec(1u32..100, 1..24), seed in any::<u32>()) {
            let hasher = RendezvousHasher::new(SIZE).unwrap();
            let eps = endpoints(&weights);
            let ring = hasher.generate_hash_ring(seed, &eps, None).unwrap();
            let c = counts(&ring, eps.len());
            prop_assert_eq!(c.iter().map(|x| *x as u64).sum::<u64>(), SIZE as u64);
            let total: f64 = weights.iter().map(|w| *w as f64).sum();
            for (i, w) in weights.iter().enumerate() {
                let ideal = *w as f64 / total * SIZE as f64;
                prop_assert!((c[i] as f64 - ideal).abs() < 1.0);
            }
        }

        #[test]
        fn ring_depends_only_on_membership(weights in prop::collection::vec(1u32..10, 2..16), removed in any::<prop::sample::Index>()) {
            let hasher = RendezvousHasher::new(SIZE).unwrap();
            let eps = endpoints(&weights);
            let gone = removed.index(eps.len());
            let rest: Vec<Endpoint> = eps.iter().copied().filter(|e| e.index as usize != gone).collect();
            let full = hasher.generate_hash_ring(11, &eps, None).unwrap();
            let shrunk = hasher.generate_hash_ring(11, &rest, Some(&full)).unwrap();
            prop_assert!(shrunk.iter().all(|s| *s as usize != gone));
            prop_assert_eq!(&shrunk, &hasher.generate_hash_ring(11, &rest, None).unwrap());
            let regrown = hasher.generate_hash_ring(11, &eps, Some(&shrunk)).unwrap();
            prop_assert_eq!(regrown, full);
        }
    }
}
