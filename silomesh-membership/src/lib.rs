//! Membership Oracle — spec.md §4.1.
//!
//! Grounded on `knhk-consensus::raft` for the version-guarded mutation
//! idiom (a table version row is bumped atomically with every accepted
//! insert/update, exactly like a Raft term is bumped on an accepted
//! election) and on `knhk-consensus::gossip` for the probe-subset /
//! suspicion-accumulation shape of failure detection.

use async_trait::async_trait;
use silomesh_core::error::{RuntimeError, RuntimeResult};
use silomesh_core::membership::{MembershipEntry, MembershipTable, SiloStatus, Suspicion};
use silomesh_core::ring::{ring_hash, HashRing};
use silomesh_core::{interfaces::MembershipBackend, SiloAddress};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A peer probe, implemented by whatever transport the silo uses. Kept
/// decoupled from `silomesh-transport` so the Oracle never depends on a
/// concrete network stack (spec.md §9: route by identity, not by object).
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &SiloAddress) -> bool;
}

/// How many bounded retries an optimistic-concurrency mutation gets before
/// giving up, per spec.md §4.1 "Failure semantics".
const MAX_CONTENTION_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct MembershipConfig {
    pub heartbeat_period: Duration,
    pub probe_period: Duration,
    pub probe_fanout: usize,
    pub suspicion_threshold_k: u32,
    pub suspicion_window: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(10),
            probe_period: Duration::from_secs(10),
            probe_fanout: 3,
            suspicion_threshold_k: 3,
            suspicion_window: Duration::from_secs(60),
        }
    }
}

pub struct MembershipOracle {
    backend: Arc<dyn MembershipBackend>,
    self_address: SiloAddress,
    config: MembershipConfig,
    cached: RwLock<MembershipTable>,
}

impl MembershipOracle {
    pub fn new(backend: Arc<dyn MembershipBackend>, self_address: SiloAddress, config: MembershipConfig) -> Self {
        Self {
            backend,
            self_address,
            config,
            cached: RwLock::new(MembershipTable::empty()),
        }
    }

    pub async fn read_all(&self) -> RuntimeResult<MembershipTable> {
        let table = self.backend.read_all().await?;
        *self.cached.write().await = table.clone();
        Ok(table)
    }

    pub async fn read_row(&self, silo: &SiloAddress) -> RuntimeResult<MembershipTable> {
        self.backend.read_row(silo).await
    }

    /// Insert self as `Joining`, then transition to `Active`. Spec.md
    /// §4.1 "Protocol": done once, at silo start.
    pub async fn join(&self, host_name: &str, role: &str) -> RuntimeResult<()> {
        let mut version = self.read_all().await?.version;
        let entry = MembershipEntry::new_joining(self.self_address.clone(), host_name, role);

        for attempt in 0..MAX_CONTENTION_RETRIES {
            match self.backend.insert_row(entry.clone(), version.clone()).await? {
                true => {
                    info!(silo = %self.self_address, "membership: joined as Joining");
                    break;
                }
                false => {
                    warn!(silo = %self.self_address, attempt, "membership: insert contended, re-reading version");
                    version = self.read_all().await?.version;
                    if attempt + 1 == MAX_CONTENTION_RETRIES {
                        return Err(RuntimeError::MembershipContention);
                    }
                }
            }
        }

        self.transition_self(SiloStatus::Active).await
    }

    /// Move the local silo row to a new status, version-guarded. Used for
    /// `Joining -> Active` on start and `Active -> ShuttingDown -> Stopping`
    /// on graceful shutdown.
    pub async fn transition_self(&self, to: SiloStatus) -> RuntimeResult<()> {
        for attempt in 0..MAX_CONTENTION_RETRIES {
            let table = self.read_all().await?;
            let mut entry = table
                .row(&self.self_address)
                .cloned()
                .ok_or_else(|| RuntimeError::Internal("self row missing from membership table".into()))?;

            if !entry.status.can_transition_to(to) {
                return Err(RuntimeError::Internal(format!(
                    "illegal membership transition {:?} -> {:?}",
                    entry.status, to
                )));
            }
            let from = entry.status;
            entry.status = to;

            if self
                .backend
                .update_row(entry, table.version.clone(), table.version.bump())
                .await?
            {
                info!(silo = %self.self_address, from_status = ?from, to_status = ?to, "membership: status transition");
                return Ok(());
            }
            warn!(silo = %self.self_address, attempt, "membership: update contended, retrying");
        }
        Err(RuntimeError::MembershipContention)
    }

    /// Fast-path heartbeat: writes IAmAlive without bumping the table
    /// version (spec.md §4.1 "non-contentious").
    pub async fn heartbeat_once(&self) -> RuntimeResult<()> {
        let table = self.read_all().await?;
        let mut entry = match table.row(&self.self_address) {
            Some(e) => e.clone(),
            None => return Ok(()), // not yet joined; nothing to heartbeat
        };
        entry.iam_alive_time = SystemTime::now();
        self.backend.update_iam_alive(entry).await?;
        debug!(silo = %self.self_address, "membership: heartbeat sent");
        Ok(())
    }

    /// Deterministic probe-target subset: successors of self on a hash
    /// ring of all known silo addresses (spec.md §4.1 "Protocol").
    pub fn probe_targets(&self, table: &MembershipTable) -> Vec<SiloAddress> {
        let members: Vec<(u64, SiloAddress)> = table
            .entries
            .iter()
            .filter(|e| e.address != self.self_address)
            .map(|e| (ring_hash(&e.address), e.address.clone()))
            .collect();
        let ring = HashRing::from_members(members);
        ring.successors(ring_hash(&self.self_address), self.config.probe_fanout)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Probe the deterministic subset once; failures add a suspicion vote
    /// against the target (spec.md §4.1 "Protocol").
    pub async fn probe_once(&self, prober: &dyn Prober) -> RuntimeResult<()> {
        let table = self.read_all().await?;
        for target in self.probe_targets(&table) {
            if !prober.probe(&target).await {
                self.add_suspicion(&target).await?;
            }
        }
        Ok(())
    }

    async fn add_suspicion(&self, target: &SiloAddress) -> RuntimeResult<()> {
        for attempt in 0..MAX_CONTENTION_RETRIES {
            let table = self.read_all().await?;
            let Some(mut entry) = table.row(target).cloned() else {
                return Ok(());
            };
            if entry.is_dead() {
                return Ok(());
            }

            let now = SystemTime::now();
            entry.suspectors.retain(|s| {
                now.duration_since(s.suspect_time)
                    .map(|age| age <= self.config.suspicion_window)
                    .unwrap_or(true)
            });
            entry.suspectors.push(Suspicion {
                suspector: self.self_address.clone(),
                suspect_time: now,
            });

            let should_kill = count_distinct_suspectors(&entry.suspectors) >= self.config.suspicion_threshold_k;
            if should_kill {
                entry.status = SiloStatus::Dead;
            }

            if self
                .backend
                .update_row(entry, table.version.clone(), table.version.bump())
                .await?
            {
                if should_kill {
                    warn!(silo = %target, "membership: marked Dead after suspicion threshold reached");
                }
                return Ok(());
            }
            debug!(attempt, target = %target, "membership: suspicion update contended, retrying");
        }
        Err(RuntimeError::MembershipContention)
    }

    /// Whether the local silo has been marked Dead by a peer; if so it
    /// must exit and never rejoin with the same generation (spec.md §4.1).
    pub async fn self_observed_dead(&self) -> RuntimeResult<bool> {
        let table = self.read_all().await?;
        Ok(table.row(&self.self_address).map(|e| e.is_dead()).unwrap_or(false))
    }

    pub async fn cleanup_defunct(&self, before: SystemTime) -> RuntimeResult<()> {
        self.backend.cleanup_defunct_silo_entries(before).await
    }
}

fn count_distinct_suspectors(suspicions: &[Suspicion]) -> u32 {
    let mut seen = std::collections::HashSet::new();
    for s in suspicions {
        seen.insert(&s.suspector);
    }
    seen.len() as u32
}
