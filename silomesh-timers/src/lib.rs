//! Timer/Reminder Service — spec.md §6 "Reminder store" (the service was
//! only visible through that external interface; SPEC_FULL.md §4.9 gives it
//! a concrete owning component).
//!
//! Grounded on the periodic-tick idiom in `knhk-sidecar::health` (a
//! background interval loop publishing liveness), generalized here to
//! "tick, scan store range, dispatch" for reminders, and reused unmodified
//! for the local one-shot/periodic timer loop.

use dashmap::DashMap;
use silomesh_core::address::SiloAddress;
use silomesh_core::interfaces::{hash_in_range, ReminderRow, ReminderStore};
use silomesh_core::ring::ring_hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a registered local timer, used to cancel it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(pub u64);

/// Local one-shot/periodic timer registry, scoped to activations on this
/// silo. Not durable: these do not survive a silo restart (that's what the
/// reminder subsystem below is for).
pub struct LocalTimerService {
    next_id: AtomicU64,
    handles: DashMap<TimerId, JoinHandle<()>>,
}

impl Default for LocalTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTimerService {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    fn alloc_id(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire `callback` once after `due`.
    pub fn register_one_shot<F>(&self, due: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.alloc_id();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(due).await;
            callback();
        });
        self.handles.insert(id, handle);
        id
    }

    /// Fire `callback` first after `due`, then every `period` until
    /// cancelled.
    pub fn register_periodic<F>(&self, due: Duration, period: Duration, mut callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.alloc_id();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(due).await;
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately; already waited `due`
            loop {
                callback();
                ticker.tick().await;
            }
        });
        self.handles.insert(id, handle);
        id
    }

    /// Cancel a registered timer; a no-op if it already fired (one-shot) or
    /// was already cancelled.
    pub fn cancel(&self, id: TimerId) {
        if let Some((_, handle)) = self.handles.remove(&id) {
            handle.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.handles.len()
    }
}

/// Where a woken reminder is delivered. Injected so the reminder scanner
/// never depends on a concrete router/transport stack, the same seam used
/// by `silomesh_membership::Prober` and `silomesh_router::RouterTransport`.
pub trait ReminderSink: Send + Sync {
    fn wake(&self, row: &ReminderRow);
}

/// Tracks which 32-bit hash range this silo currently owns within the
/// reminder ring, recomputed whenever membership changes (spec.md §6
/// "Reminder store", ownership shared with the Grain Directory's
/// consistent-hash ring per SPEC_FULL.md §4.9).
#[derive(Default)]
struct ReminderRing {
    sorted: Vec<(u32, SiloAddress)>,
}

impl ReminderRing {
    fn update(&mut self, members: Vec<SiloAddress>) {
        let mut sorted: Vec<_> = members.into_iter().map(|s| (silo_hash(&s), s)).collect();
        sorted.sort_by_key(|(h, _)| *h);
        self.sorted = sorted;
    }

    /// The half-open `(begin, end]` range owned by `self_silo`: `end` is
    /// this silo's own position, `begin` is its predecessor's (wrapping).
    fn owned_range(&self, self_silo: &SiloAddress) -> Option<(u32, u32)> {
        if self.sorted.is_empty() {
            return None;
        }
        let idx = self.sorted.iter().position(|(_, s)| s == self_silo)?;
        let end = self.sorted[idx].0;
        let begin = if self.sorted.len() == 1 {
            end // single silo: owns the whole ring, begin == end wraps to all
        } else {
            let prev = (idx + self.sorted.len() - 1) % self.sorted.len();
            self.sorted[prev].0
        };
        Some((begin, end))
    }
}

fn silo_hash(addr: &SiloAddress) -> u32 {
    (ring_hash(addr) & 0xFFFF_FFFF) as u32
}

pub struct ReminderConfig {
    pub service_id: String,
    pub scan_period: Duration,
}

/// Periodically scans this silo's owned hash-range partition of the
/// reminder store and wakes the owning grain for every due reminder
/// (SPEC_FULL.md §4.9). The store's persistence is external (spec.md §6);
/// this component only implements the range scan, wrap arithmetic, and
/// dispatch.
pub struct ReminderDispatcher<S: ReminderStore> {
    self_silo: SiloAddress,
    config: ReminderConfig,
    store: Arc<S>,
    sink: Arc<dyn ReminderSink>,
    ring: RwLock<ReminderRing>,
}

impl<S: ReminderStore> ReminderDispatcher<S> {
    pub fn new(self_silo: SiloAddress, config: ReminderConfig, store: Arc<S>, sink: Arc<dyn ReminderSink>) -> Self {
        Self {
            self_silo,
            config,
            store,
            sink,
            ring: RwLock::new(ReminderRing::default()),
        }
    }

    pub fn update_ring(&self, active_silos: Vec<SiloAddress>) {
        self.ring.write().unwrap().update(active_silos);
    }

    /// Scan the currently owned hash range once, waking every row found.
    /// Returns the rows dispatched this pass.
    pub async fn scan_once(&self) -> silomesh_core::error::RuntimeResult<Vec<ReminderRow>> {
        let Some((begin, end)) = self.ring.read().unwrap().owned_range(&self.self_silo) else {
            debug!("timers: no owned reminder range yet, skipping scan");
            return Ok(Vec::new());
        };
        let rows = self.store.read_rows_for_hash_range(&self.config.service_id, begin, end).await?;
        for row in &rows {
            debug_assert!(hash_in_range(row.grain_hash, begin, end));
            self.sink.wake(row);
        }
        Ok(rows)
    }

    pub fn scan_period(&self) -> Duration {
        self.config.scan_period
    }
}

/// Background loop driving `scan_once` on `config.scan_period`, matching
/// the router's timeout-sweeper and membership's heartbeat loop shape.
pub async fn run_reminder_scanner<S: ReminderStore + 'static>(dispatcher: Arc<ReminderDispatcher<S>>) {
    let mut ticker = tokio::time::interval(dispatcher.scan_period());
    loop {
        ticker.tick().await;
        if let Err(e) = dispatcher.scan_once().await {
            warn!(error = %e, "timers: reminder scan failed");
        }
    }
}
