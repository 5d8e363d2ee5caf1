//! Transactional Lock Manager (per grain) — spec.md §4.8.
//!
//! Grounded on `knhk-lockchain::quorum::QuorumManager`: a manager owning an
//! ordered structure of participants with a threshold/exit condition. The
//! *mechanism* (ordered groups, a fill threshold, an exit rule) is kept; the
//! teacher's domain (BFT quorum over Merkle roots) is replaced with the
//! spec's per-grain lock-ordering domain — groups of non-conflicting
//! transactions rather than vote tallies over a hash root.

use silomesh_core::error::RuntimeError;
use silomesh_core::txn::{CommitRole, PriorityTimestamp, TransactionRecord, TxId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

type DeferredTask = Box<dyn FnOnce() + Send>;

/// A non-conflicting batch of transactions acquiring a grain's
/// transactional state together (spec.md §3 "LockGroup").
pub struct LockGroup {
    records: HashMap<TxId, TransactionRecord>,
    /// Grows only on insert, never decremented on rollback — spec.md §9
    /// open question (c), kept as specified.
    fill_count: u32,
    deadline: Option<SystemTime>,
    deferred: Vec<(TxId, DeferredTask)>,
    min_pending_cache: Option<PriorityTimestamp>,
}

impl LockGroup {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            fill_count: 0,
            deadline: None,
            deferred: Vec::new(),
            min_pending_cache: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn invalidate_cache(&mut self) {
        self.min_pending_cache = None;
    }

    fn min_pending_timestamp(&mut self) -> Option<PriorityTimestamp> {
        if self.min_pending_cache.is_none() {
            self.min_pending_cache = self
                .records
                .values()
                .filter(|r| !r.role.is_determined())
                .map(|r| r.priority)
                .min();
        }
        self.min_pending_cache
    }

    /// Conflict rule (spec.md §4.8): a read never conflicts with another
    /// read; anything involving a write conflicts.
    fn conflicts_with_incoming(is_read: bool, existing: &TransactionRecord) -> bool {
        !(is_read && existing.is_read_only())
    }

    fn conflicting_siblings(&self, exclude: TxId, is_read: bool) -> Vec<TxId> {
        self.records
            .values()
            .filter(|r| r.tx_id != exclude && Self::conflicts_with_incoming(is_read, r))
            .map(|r| r.tx_id)
            .collect()
    }
}

pub enum EnterOutcome {
    Immediate,
    Queued,
}

pub struct LockManager {
    max_group_size: usize,
    default_deadline: Duration,
    groups: VecDeque<LockGroup>,
    location: HashMap<TxId, usize>, // tx id -> index into groups (0 = head)
}

impl LockManager {
    pub fn new(max_group_size: usize, default_deadline: Duration) -> Self {
        Self {
            max_group_size,
            default_deadline,
            groups: VecDeque::new(),
            location: HashMap::new(),
        }
    }

    fn ensure_head(&mut self, now: SystemTime) -> usize {
        if self.groups.is_empty() {
            let mut g = LockGroup::new();
            g.deadline = Some(now + self.default_deadline);
            self.groups.push_back(g);
        }
        0
    }

    /// `enter(txId, priority, accessCount, isRead, task)` (spec.md §4.8).
    pub fn enter(
        &mut self,
        tx_id: TxId,
        priority: PriorityTimestamp,
        access_count: u32,
        is_read: bool,
        task: DeferredTask,
        now: SystemTime,
    ) -> Result<EnterOutcome, RuntimeError> {
        if let Some(&idx) = self.location.get(&tx_id) {
            return self.enter_existing(idx, tx_id, access_count, is_read, task);
        }

        self.ensure_head(now);
        let target_idx = self.groups.iter().enumerate().find_map(|(idx, group)| {
            let has_room = group.fill_count < self.max_group_size as u32;
            let no_conflict = group
                .records
                .values()
                .all(|r| !LockGroup::conflicts_with_incoming(is_read, r));
            (has_room && no_conflict).then_some(idx)
        });

        let idx = match target_idx {
            Some(idx) => idx,
            None => {
                let mut g = LockGroup::new();
                g.deadline = Some(now + self.default_deadline);
                self.groups.push_back(g);
                self.groups.len() - 1
            }
        };

        let mut record = TransactionRecord::new(tx_id, priority);
        if is_read {
            record.read_count = access_count;
        } else {
            record.write_count = access_count;
        }
        let group = &mut self.groups[idx];
        group.records.insert(tx_id, record);
        group.fill_count += 1;
        group.invalidate_cache();
        self.location.insert(tx_id, idx);

        debug!(tx_id = tx_id.0, group = idx, "txnlock: entered group");
        if idx == 0 {
            task();
            Ok(EnterOutcome::Immediate)
        } else {
            self.groups[idx].deferred.push((tx_id, task));
            Ok(EnterOutcome::Queued)
        }
    }

    fn enter_existing(
        &mut self,
        idx: usize,
        tx_id: TxId,
        access_count: u32,
        is_read: bool,
        task: DeferredTask,
    ) -> Result<EnterOutcome, RuntimeError> {
        let existing_access = self.groups[idx]
            .records
            .get(&tx_id)
            .map(|r| r.access_count())
            .ok_or(RuntimeError::BrokenLock(tx_id.0))?;
        if existing_access != access_count {
            return Err(RuntimeError::BrokenLock(tx_id.0));
        }

        let (incoming_priority, conflicting) = {
            let group = &self.groups[idx];
            let priority = group.records[&tx_id].priority;
            (priority, group.conflicting_siblings(tx_id, is_read))
        };

        if !conflicting.is_empty() {
            let group = &self.groups[idx];
            let all_lower_priority = conflicting
                .iter()
                .all(|sib| group.records[sib].priority > incoming_priority);
            if !all_lower_priority {
                return Err(RuntimeError::LockUpgrade(tx_id.0));
            }
            let group = &mut self.groups[idx];
            for sib in &conflicting {
                group.records.remove(sib);
                self.location.remove(sib);
                warn!(tx_id = sib.0, winner = tx_id.0, "txnlock: rolled back lower-priority conflicting sibling");
            }
            group.invalidate_cache();
        }

        let group = &mut self.groups[idx];
        let record = group.records.get_mut(&tx_id).unwrap();
        if is_read {
            record.read_count = access_count;
        } else {
            record.write_count = access_count;
        }
        group.invalidate_cache();

        if idx == 0 {
            task();
            Ok(EnterOutcome::Immediate)
        } else {
            group.deferred.push((tx_id, task));
            Ok(EnterOutcome::Queued)
        }
    }

    /// `validate(txId, accessCount) -> (status, record)` (spec.md §4.8).
    pub fn validate(&mut self, tx_id: TxId, access_count: u32) -> Result<TransactionRecord, RuntimeError> {
        let Some(&idx) = self.location.get(&tx_id) else {
            return Err(RuntimeError::BrokenLock(tx_id.0));
        };
        if idx != 0 {
            return Err(RuntimeError::BrokenLock(tx_id.0));
        }
        let group = &mut self.groups[0];
        let Some(record) = group.records.get(&tx_id) else {
            return Err(RuntimeError::BrokenLock(tx_id.0));
        };
        if record.access_count() != access_count {
            let record = record.clone();
            group.records.remove(&tx_id);
            group.invalidate_cache();
            self.location.remove(&tx_id);
            return Err(RuntimeError::LockValidationFailed(record.tx_id.0));
        }
        Ok(record.clone())
    }

    /// `rollback(txId, notify)` (spec.md §4.8).
    pub fn rollback(&mut self, tx_id: TxId, notify: bool) {
        let Some(idx) = self.location.remove(&tx_id) else {
            return;
        };
        self.groups[idx].records.remove(&tx_id);
        self.groups[idx].invalidate_cache();
        if notify {
            info!(tx_id = tx_id.0, "txnlock: rolled back, notifying participants");
        }
    }

    /// `abortAll(exception)` (spec.md §4.8): break every record in the
    /// current (head) group by marking its role `Abort`.
    pub fn abort_all(&mut self) -> Vec<TxId> {
        let Some(head) = self.groups.front_mut() else {
            return Vec::new();
        };
        let mut aborted = Vec::new();
        for record in head.records.values_mut() {
            if !record.role.is_determined() {
                record.role = CommitRole::Abort;
                aborted.push(record.tx_id);
            }
        }
        head.invalidate_cache();
        aborted
    }

    /// Set the commit role of a record once it has been determined by the
    /// caller (local commit decision, remote vote, or read-only shortcut).
    pub fn set_role(&mut self, tx_id: TxId, role: CommitRole) {
        if let Some(&idx) = self.location.get(&tx_id) {
            if let Some(record) = self.groups[idx].records.get_mut(&tx_id) {
                record.role = role;
                self.groups[idx].invalidate_cache();
            }
        }
    }

    /// Lock-exit algorithm tick (spec.md §4.8 "Lock-exit algorithm").
    /// Returns records that exited the lock this tick, in commit order
    /// (ascending priority timestamp).
    pub fn tick(&mut self, now: SystemTime) -> Vec<TransactionRecord> {
        let mut exited = Vec::new();

        if let Some(head) = self.groups.front_mut() {
            if !head.is_empty() {
                let min_pending = head.min_pending_timestamp();
                let eligible: Vec<TxId> = head
                    .records
                    .values()
                    .filter(|r| r.role.is_determined())
                    .filter(|r| min_pending.map(|m| r.priority < m).unwrap_or(true))
                    .map(|r| r.tx_id)
                    .collect();
                for tx_id in eligible {
                    if let Some(record) = head.records.remove(&tx_id) {
                        self.location.remove(&tx_id);
                        exited.push(record);
                    }
                }
                head.invalidate_cache();

                if let Some(deadline) = head.deadline {
                    if now >= deadline && head.records.values().any(|r| !r.role.is_determined()) {
                        warn!("txnlock: head group deadline exceeded, aborting remaining transactions");
                        for record in head.records.values_mut() {
                            if !record.role.is_determined() {
                                record.role = CommitRole::Abort;
                            }
                        }
                        return exited;
                    }
                }
            }
        }

        exited.sort_by_key(|r| r.priority);

        if self.groups.front().map(|g| g.is_empty()).unwrap_or(false) {
            self.advance_head(now);
        }

        exited
    }

    fn advance_head(&mut self, now: SystemTime) {
        self.groups.pop_front();
        if let Some(next) = self.groups.front_mut() {
            next.deadline = Some(now + self.default_deadline);
            let deferred = std::mem::take(&mut next.deferred);
            for (tx_id, task) in deferred {
                debug!(tx_id = tx_id.0, "txnlock: running deferred task for newly-head group");
                task();
            }
        }
        for loc in self.location.values_mut() {
            if *loc > 0 {
                *loc -= 1;
            }
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn head_len(&self) -> usize {
        self.groups.front().map(|g| g.len()).unwrap_or(0)
    }

    /// Lock safety invariant (spec.md §4.8): no group may ever hold two
    /// records that conflict under [`LockGroup::conflicts_with_incoming`].
    #[cfg(test)]
    fn groups_are_conflict_free(&self) -> bool {
        self.groups.iter().all(|g| {
            let records: Vec<&TransactionRecord> = g.records.values().collect();
            records.iter().enumerate().all(|(i, a)| {
                records[i + 1..]
                    .iter()
                    .all(|b| !LockGroup::conflicts_with_incoming(a.is_read_only(), b))
            })
        })
    }
}
