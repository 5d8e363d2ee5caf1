//! Placement Director — spec.md §4.3.
//!
//! Strategy selection grounded on `knhk-consensus::validator::ValidatorSet`'s
//! reputation-weighted candidate scoring, generalized from Byzantine-node
//! reputation to grain-placement load scoring. Placement is advisory only:
//! the final owner is whoever wins Grain Directory registration (spec.md
//! §4.3 "Placement is advisory").

use rand::seq::SliceRandom;
use silomesh_core::address::{GrainId, SiloAddress};
use silomesh_core::ring::rendezvous_pick;
use tracing::debug;

/// Load signal reported by the Deployment Load Publisher for one silo
/// (spec.md §4.3 "Activity-count / load-aware").
#[derive(Clone, Debug)]
pub struct SiloLoad {
    pub silo: SiloAddress,
    pub activation_count: u32,
    pub cpu_load: f64,
    pub mem_load: f64,
    pub load_shed_headroom: f64,
    pub overloaded: bool,
}

impl SiloLoad {
    /// Lower is more preferred. Weights mirror the teacher's
    /// `ValidatorMetrics::reputation_score` blend of several normalized
    /// signals into one scalar.
    fn weighted_score(&self) -> f64 {
        self.activation_count as f64 * 0.4 + self.cpu_load * 0.3 + self.mem_load * 0.2
            - self.load_shed_headroom * 0.1
    }
}

pub struct PlacementContext<'a> {
    pub grain: &'a GrainId,
    pub caller_silo: Option<&'a SiloAddress>,
    pub candidates: &'a [SiloLoad],
}

impl<'a> PlacementContext<'a> {
    fn eligible(&self) -> Vec<&'a SiloLoad> {
        self.candidates.iter().filter(|c| !c.overloaded).collect()
    }
}

pub trait PlacementStrategy: Send + Sync {
    fn choose(&self, ctx: &PlacementContext) -> Option<SiloAddress>;
}

/// Uniform over active, non-overloaded silos.
pub struct RandomActive;

impl PlacementStrategy for RandomActive {
    fn choose(&self, ctx: &PlacementContext) -> Option<SiloAddress> {
        let eligible = ctx.eligible();
        eligible.choose(&mut rand::thread_rng()).map(|c| c.silo.clone())
    }
}

/// Caller's own silo if eligible, else falls back to [`RandomActive`].
pub struct PreferLocal;

impl PlacementStrategy for PreferLocal {
    fn choose(&self, ctx: &PlacementContext) -> Option<SiloAddress> {
        if let Some(caller) = ctx.caller_silo {
            if ctx.eligible().iter().any(|c| &c.silo == caller) {
                return Some(caller.clone());
            }
        }
        RandomActive.choose(ctx)
    }
}

/// Deterministic hash of the grain id over active silos via rendezvous
/// (highest-random-weight) hashing, stable under membership change
/// (spec.md §4.3 "Hash-based").
pub struct HashBased;

impl PlacementStrategy for HashBased {
    fn choose(&self, ctx: &PlacementContext) -> Option<SiloAddress> {
        let eligible: Vec<SiloAddress> = ctx.eligible().into_iter().map(|c| c.silo.clone()).collect();
        let key_hash = silomesh_core::ring::ring_hash(ctx.grain);
        rendezvous_pick(key_hash, &eligible).cloned()
    }
}

/// Prefers the silo with the lowest weighted (activation count, CPU,
/// memory, load-shed headroom) score (spec.md §4.3 "Activity-count /
/// load-aware").
pub struct LoadAware;

impl PlacementStrategy for LoadAware {
    fn choose(&self, ctx: &PlacementContext) -> Option<SiloAddress> {
        ctx.eligible()
            .into_iter()
            .min_by(|a, b| a.weighted_score().partial_cmp(&b.weighted_score()).unwrap())
            .map(|c| c.silo.clone())
    }
}

/// A local pool up to `multiplier * cpu_count`; no cluster-wide uniqueness
/// guarantee (spec.md §4.3 "Stateless worker").
pub struct StatelessWorker {
    pub cpu_count: usize,
    pub multiplier: usize,
}

impl StatelessWorker {
    pub fn pool_size(&self) -> usize {
        self.cpu_count.max(1) * self.multiplier.max(1)
    }
}

impl PlacementStrategy for StatelessWorker {
    fn choose(&self, ctx: &PlacementContext) -> Option<SiloAddress> {
        ctx.caller_silo.cloned()
    }
}

pub fn strategy_for(name: &str, cpu_count: usize) -> Box<dyn PlacementStrategy> {
    match name {
        "prefer_local" => Box::new(PreferLocal),
        "hash_based" => Box::new(HashBased),
        "load_aware" => Box::new(LoadAware),
        "stateless_worker" => Box::new(StatelessWorker { cpu_count, multiplier: 8 }),
        other => {
            debug!(strategy = other, "placement: unrecognized strategy name, defaulting to random_active");
            Box::new(RandomActive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silomesh_core::address::PrimaryKey;

    fn silo(n: u64) -> SiloAddress {
        SiloAddress::new(format!("10.0.0.{n}:8080"), 1)
    }

    fn load(n: u64, overloaded: bool) -> SiloLoad {
        SiloLoad {
            silo: silo(n),
            activation_count: n as u32,
            cpu_load: 0.1,
            mem_load: 0.1,
            load_shed_headroom: 1.0,
            overloaded,
        }
    }

    #[test]
    fn prefer_local_picks_caller_when_eligible() {
        let grain = GrainId::new("Account", PrimaryKey::Long(1));
        let candidates = vec![load(1, false), load(2, false)];
        let caller = silo(2);
        let ctx = PlacementContext {
            grain: &grain,
            caller_silo: Some(&caller),
            candidates: &candidates,
        };
        assert_eq!(PreferLocal.choose(&ctx), Some(caller));
    }

    #[test]
    fn hash_based_is_stable_when_a_candidate_is_removed() {
        let grain = GrainId::new("Account", PrimaryKey::Long(42));
        let three = vec![load(1, false), load(2, false), load(3, false)];
        let ctx3 = PlacementContext {
            grain: &grain,
            caller_silo: None,
            candidates: &three,
        };
        let picked = HashBased.choose(&ctx3);

        if picked != Some(silo(3)) {
            let two = vec![load(1, false), load(2, false)];
            let ctx2 = PlacementContext {
                grain: &grain,
                caller_silo: None,
                candidates: &two,
            };
            assert_eq!(HashBased.choose(&ctx2), picked);
        }
    }

    #[test]
    fn load_aware_prefers_lowest_weighted_score() {
        let grain = GrainId::new("Account", PrimaryKey::Long(1));
        let candidates = vec![load(5, false), load(1, false)];
        let ctx = PlacementContext {
            grain: &grain,
            caller_silo: None,
            candidates: &candidates,
        };
        assert_eq!(LoadAware.choose(&ctx), Some(silo(1)));
    }

    #[test]
    fn overloaded_candidates_are_excluded() {
        let grain = GrainId::new("Account", PrimaryKey::Long(1));
        let candidates = vec![load(1, true), load(2, false)];
        let ctx = PlacementContext {
            grain: &grain,
            caller_silo: None,
            candidates: &candidates,
        };
        assert_eq!(RandomActive.choose(&ctx), Some(silo(2)));
    }
}
