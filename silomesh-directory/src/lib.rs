//! Grain Directory — spec.md §4.2.
//!
//! Ownership ring grounded on `knhk-consensus::gossip::topology::PeerSampler`
//! (deterministic peer ordering by hashed distance), generalized from random
//! sampling to a sorted consistent-hash ring shared with the Membership
//! Oracle's probe-subset selection.

mod lru;

use dashmap::DashMap;
use silomesh_core::address::{ActivationAddress, GrainId, SiloAddress};
use silomesh_core::directory::DirectoryEntry;
use silomesh_core::error::{RuntimeError, RuntimeResult};
use silomesh_core::ring::{ring_hash, HashRing};
use std::sync::Mutex;
use tracing::{debug, info};

pub use lru::LruCache;

pub struct GrainDirectory {
    self_silo: SiloAddress,
    ring: Mutex<HashRing<SiloAddress>>,
    authoritative: DashMap<GrainId, DirectoryEntry>,
    cache: Mutex<LruCache<GrainId, DirectoryEntry>>,
}

impl GrainDirectory {
    pub fn new(self_silo: SiloAddress, non_owned_cache_capacity: usize) -> Self {
        Self {
            self_silo,
            ring: Mutex::new(HashRing::new()),
            authoritative: DashMap::new(),
            cache: Mutex::new(LruCache::new(non_owned_cache_capacity)),
        }
    }

    /// Recompute ownership from the current active-silo set. Called whenever
    /// the Membership Oracle reports a membership change (spec.md §4.2
    /// "Partitioning": "when membership changes, ownership migrates").
    pub fn update_ring(&self, active_silos: impl IntoIterator<Item = SiloAddress>) {
        let members: Vec<(u64, SiloAddress)> = active_silos.into_iter().map(|s| (ring_hash(&s), s)).collect();
        *self.ring.lock().unwrap() = HashRing::from_members(members);
    }

    pub fn owner(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.ring.lock().unwrap().owner(ring_hash(grain)).cloned()
    }

    fn is_self_owner(&self, grain: &GrainId) -> bool {
        self.owner(grain).as_ref() == Some(&self.self_silo)
    }

    /// Register a new activation. Exactly-once in the steady state: a
    /// second concurrent register for the same grain returns the same
    /// winner, chosen by [`ActivationAddress::tie_break_key`] (spec.md §4.2
    /// "Tie-breaking on concurrent create").
    pub fn register(&self, activation: ActivationAddress) -> RuntimeResult<ActivationAddress> {
        let grain = activation.grain.clone();
        if !self.is_self_owner(&grain) {
            return Err(RuntimeError::StaleActivation(format!(
                "not owner of {grain}; owner is {:?}",
                self.owner(&grain)
            )));
        }

        let winner = match self.authoritative.get(&grain) {
            Some(existing) => {
                if activation.tie_break_key() < existing.activation.tie_break_key() {
                    activation.clone()
                } else {
                    existing.activation.clone()
                }
            }
            None => activation.clone(),
        };

        self.authoritative
            .insert(grain.clone(), DirectoryEntry::new(winner.clone()));
        info!(grain = %grain, winner = %winner, "directory: registration settled");
        Ok(winner)
    }

    pub fn unregister(&self, activation: &ActivationAddress) {
        if let Some((_, entry)) = self.authoritative.remove_if(&activation.grain, |_, e| e.activation == *activation) {
            debug!(grain = %activation.grain, activation = %entry.activation, "directory: unregistered");
        }
    }

    /// Resolve a grain id to its activation address. Non-owners consult
    /// their bounded cache; a cache miss or non-ownership surfaces a
    /// [`RuntimeError::StaleActivation`] routing signal telling the caller
    /// to ask the owner (spec.md §4.2 "Partitioning").
    pub fn lookup(&self, grain: &GrainId) -> RuntimeResult<Option<ActivationAddress>> {
        if self.is_self_owner(grain) {
            return Ok(self.authoritative.get(grain).map(|e| e.activation.clone()));
        }
        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get(grain) {
            return Ok(Some(entry.activation.clone()));
        }
        Err(RuntimeError::StaleActivation(format!(
            "not cached locally; owner is {:?}",
            self.owner(grain)
        )))
    }

    /// Populate the non-owned cache after asking the owner directly
    /// (spec.md §4.2 "Cache").
    pub fn cache_insert(&self, entry: DirectoryEntry) {
        self.cache.lock().unwrap().put(entry.activation.grain.clone(), entry);
    }

    /// Drop a cached entry named in an incoming cache-invalidation header
    /// (spec.md §4.2 and §6 "Wire framing" invalidation list).
    pub fn invalidate(&self, grain: &GrainId) {
        if self.cache.lock().unwrap().invalidate(grain) {
            debug!(grain = %grain, "directory: cache entry invalidated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silomesh_core::address::{ActivationId, PrimaryKey};

    fn grain(id: i64) -> GrainId {
        GrainId::new("Account", PrimaryKey::Long(id))
    }

    fn silo(n: u64) -> SiloAddress {
        SiloAddress::new(format!("10.0.0.{n}:8080"), 1)
    }

    #[test]
    fn concurrent_registration_settles_on_tie_break_winner() {
        let dir = GrainDirectory::new(silo(1), 16);
        dir.update_ring(vec![silo(1)]);
        let g = grain(1);
        let low = ActivationAddress::new(g.clone(), silo(1), ActivationId(uuid::Uuid::nil()));
        let high = ActivationAddress::new(g.clone(), silo(2), ActivationId::new());

        let w1 = dir.register(high).unwrap();
        let w2 = dir.register(low.clone()).unwrap();
        assert_eq!(w1, low);
        assert_eq!(w2, low);
        assert_eq!(dir.lookup(&g).unwrap(), Some(low));
    }

    #[test]
    fn non_owner_lookup_signals_stale_until_cached() {
        let dir = GrainDirectory::new(silo(1), 16);
        dir.update_ring(vec![silo(1), silo(2)]);
        // Find a grain id owned by silo(2) rather than silo(1).
        let g = (0..50)
            .map(|i| grain(i))
            .find(|g| dir.owner(g) == Some(silo(2)))
            .expect("ring should route some grain to silo 2");

        assert!(dir.lookup(&g).is_err());
        let addr = ActivationAddress::new(g.clone(), silo(2), ActivationId::new());
        dir.cache_insert(DirectoryEntry::new(addr.clone()));
        assert_eq!(dir.lookup(&g).unwrap(), Some(addr));

        dir.invalidate(&g);
        assert!(dir.lookup(&g).is_err());
    }
}
