//! Consistent-hash ring shared by the Grain Directory (ownership, spec.md
//! §4.2), the Membership Oracle (deterministic probe-target selection,
//! spec.md §4.1), and the Placement Director's hash-based strategy
//! (spec.md §4.3). Grounded on the deterministic-ordering idea in
//! `knhk-consensus::gossip::topology::PeerSampler`, generalized from random
//! sampling to a sorted hash ring so that membership changes only remap a
//! small fraction of keys.

use std::hash::Hash;

/// 64-bit hash used to place both silos and grains on the ring. Not
/// cryptographic; stability and uniform distribution are what matter here.
pub fn ring_hash<T: Hash>(value: &T) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A sorted ring of `(hash, member)` pairs. The owner of a key is the
/// member whose position immediately succeeds the key's hash, wrapping
/// around to the first member past the maximum hash.
#[derive(Clone, Debug, Default)]
pub struct HashRing<T> {
    sorted: Vec<(u64, T)>,
}

impl<T: Clone> HashRing<T> {
    pub fn new() -> Self {
        Self { sorted: Vec::new() }
    }

    pub fn from_members<I: IntoIterator<Item = (u64, T)>>(members: I) -> Self {
        let mut sorted: Vec<_> = members.into_iter().collect();
        sorted.sort_by_key(|(h, _)| *h);
        Self { sorted }
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// The member whose ring position immediately succeeds `key_hash`.
    pub fn owner(&self, key_hash: u64) -> Option<&T> {
        if self.sorted.is_empty() {
            return None;
        }
        match self.sorted.binary_search_by_key(&key_hash, |(h, _)| *h) {
            Ok(idx) => Some(&self.sorted[idx].1),
            Err(idx) => {
                let idx = if idx == self.sorted.len() { 0 } else { idx };
                Some(&self.sorted[idx].1)
            }
        }
    }

    /// The `n` distinct members following `key_hash` around the ring,
    /// starting at the owner. Used by the Membership Oracle to pick a
    /// deterministic probe subset ("successors on a hash ring of
    /// addresses").
    pub fn successors(&self, key_hash: u64, n: usize) -> Vec<&T> {
        if self.sorted.is_empty() || n == 0 {
            return Vec::new();
        }
        let start = match self.sorted.binary_search_by_key(&key_hash, |(h, _)| *h) {
            Ok(idx) => idx,
            Err(idx) => {
                if idx == self.sorted.len() {
                    0
                } else {
                    idx
                }
            }
        };
        let n = n.min(self.sorted.len());
        (0..n).map(|i| &self.sorted[(start + i) % self.sorted.len()].1).collect()
    }
}

/// Rendezvous (highest random weight) hashing: deterministically picks the
/// member that scores highest for a given key, stable under membership
/// change because adding/removing one member only changes that member's
/// assignments, not everyone else's (spec.md §4.3 "Hash-based" strategy).
pub fn rendezvous_pick<'a, T: Hash>(key_hash: u64, members: &'a [T]) -> Option<&'a T> {
    members.iter().max_by_key(|m| {
        let mut combined = ring_hash(m);
        combined ^= key_hash.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ring_hash(&combined)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_wraps_to_first_member_past_max_hash() {
        let ring = HashRing::from_members(vec![(10u64, "a"), (20, "b"), (30, "c")]);
        assert_eq!(ring.owner(25), Some(&"c"));
        assert_eq!(ring.owner(35), Some(&"a"));
        assert_eq!(ring.owner(10), Some(&"a"));
    }

    #[test]
    fn successors_wrap_and_are_distinct() {
        let ring = HashRing::from_members(vec![(10u64, "a"), (20, "b"), (30, "c")]);
        let succ = ring.successors(25, 2);
        assert_eq!(succ, vec![&"c", &"a"]);
    }

    #[test]
    fn rendezvous_pick_is_deterministic() {
        let members = vec!["silo-a".to_string(), "silo-b".to_string(), "silo-c".to_string()];
        let p1 = rendezvous_pick(42, &members);
        let p2 = rendezvous_pick(42, &members);
        assert_eq!(p1, p2);
    }

    #[test]
    fn rendezvous_pick_is_stable_when_a_member_is_removed() {
        let members = vec!["silo-a".to_string(), "silo-b".to_string(), "silo-c".to_string()];
        let picked = rendezvous_pick(42, &members).unwrap().clone();
        if picked != "silo-c" {
            let fewer = vec!["silo-a".to_string(), "silo-b".to_string()];
            assert_eq!(rendezvous_pick(42, &fewer).unwrap(), &picked);
        }
    }
}
