//! Transaction record data model — spec.md §3 "Transaction record", §4.8.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Lower value == higher priority, matching the teacher's convention of
/// treating a monotonically increasing sequence number as a priority
/// timestamp (earlier wins ties).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PriorityTimestamp(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommitRole {
    NotYetDetermined,
    LocalCommit,
    RemoteCommit,
    ReadOnly,
    Abort,
}

impl CommitRole {
    pub fn is_determined(self) -> bool {
        !matches!(self, CommitRole::NotYetDetermined)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_id: TxId,
    pub priority: PriorityTimestamp,
    pub read_count: u32,
    pub write_count: u32,
    pub role: CommitRole,
    pub deadline: Option<SystemTime>,
    pub commit_timestamp: Option<SystemTime>,
}

impl TransactionRecord {
    pub fn new(tx_id: TxId, priority: PriorityTimestamp) -> Self {
        Self {
            tx_id,
            priority,
            read_count: 0,
            write_count: 0,
            role: CommitRole::NotYetDetermined,
            deadline: None,
            commit_timestamp: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.write_count == 0
    }

    /// Total (read, write) access count, used by `validate`/`enter` to
    /// detect a caller presenting a stale count (spec.md §4.8 `BrokenLock`).
    pub fn access_count(&self) -> u32 {
        self.read_count + self.write_count
    }
}
