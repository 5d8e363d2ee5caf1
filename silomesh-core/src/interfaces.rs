//! External collaborator interfaces — spec.md §6. These are the only
//! seams through which the core touches persistent-state, reminder, and
//! stream-cache backends; no concrete cloud/SQL/queue implementation lives
//! in this workspace (`silomesh-testkit` supplies in-memory ones for
//! tests only).

use crate::address::{GrainId, SiloAddress};
use crate::membership::{MembershipEntry, MembershipTable, TableVersion};
use async_trait::async_trait;
use std::time::SystemTime;

/// Cluster membership backend — spec.md §6 "Cluster membership backend".
/// All mutating operations are optimistic: `insert_row`/`update_row` return
/// `false` on a version/etag mismatch instead of raising.
#[async_trait]
pub trait MembershipBackend: Send + Sync {
    async fn initialize(&self, try_init_version: TableVersion) -> crate::error::RuntimeResult<()>;
    async fn read_all(&self) -> crate::error::RuntimeResult<MembershipTable>;
    async fn read_row(&self, silo: &SiloAddress) -> crate::error::RuntimeResult<MembershipTable>;
    async fn insert_row(
        &self,
        entry: MembershipEntry,
        table_version: TableVersion,
    ) -> crate::error::RuntimeResult<bool>;
    async fn update_row(
        &self,
        entry: MembershipEntry,
        etag: TableVersion,
        table_version: TableVersion,
    ) -> crate::error::RuntimeResult<bool>;
    async fn update_iam_alive(&self, entry: MembershipEntry) -> crate::error::RuntimeResult<()>;
    async fn delete_membership_table_entries(&self, cluster_id: &str) -> crate::error::RuntimeResult<()>;
    async fn cleanup_defunct_silo_entries(&self, before: SystemTime) -> crate::error::RuntimeResult<()>;
}

/// Persistent-state backend — spec.md §6 "Persistent state backend".
#[async_trait]
pub trait PersistentStateBackend: Send + Sync {
    async fn read(&self, grain: &GrainId, state_name: &str) -> crate::error::RuntimeResult<(Vec<u8>, String)>;
    async fn write(
        &self,
        grain: &GrainId,
        state_name: &str,
        state: Vec<u8>,
        etag: String,
    ) -> crate::error::RuntimeResult<String>;
    async fn clear(&self, grain: &GrainId, state_name: &str, etag: String) -> crate::error::RuntimeResult<()>;
}

/// A durable reminder row, spec.md §6 "Reminder store".
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReminderRow {
    pub service_id: String,
    pub grain: GrainId,
    pub name: String,
    pub grain_hash: u32,
    pub etag: String,
}

/// Reminder store — spec.md §6. `read_rows_for_hash_range` implements the
/// ring semantics: `begin < end` is the half-open interval `(begin, end]`;
/// `begin >= end` is the two-sided wrap union of `(begin, u32::MAX]` and
/// `[0, end]`.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn read_row(
        &self,
        service_id: &str,
        grain: &GrainId,
        name: &str,
    ) -> crate::error::RuntimeResult<Option<ReminderRow>>;
    async fn read_rows_for_grain(&self, service_id: &str, grain: &GrainId) -> crate::error::RuntimeResult<Vec<ReminderRow>>;
    async fn read_rows_for_hash_range(
        &self,
        service_id: &str,
        begin: u32,
        end: u32,
    ) -> crate::error::RuntimeResult<Vec<ReminderRow>>;
    async fn upsert(&self, row: ReminderRow) -> crate::error::RuntimeResult<String>;
    async fn remove(&self, service_id: &str, grain: &GrainId, name: &str, etag: &str) -> crate::error::RuntimeResult<()>;
}

/// A position in a stream, opaque outside the provider.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SequenceToken(pub u64);

/// Stream/queue cache adapter — spec.md §6 "Stream/queue cache".
#[async_trait]
pub trait StreamQueueCache: Send + Sync {
    async fn add_messages(&self, batch: Vec<Vec<u8>>, dequeue_time: SystemTime) -> crate::error::RuntimeResult<Vec<SequenceToken>>;
    async fn get_cursor(&self, stream_id: &str, sequence_token: SequenceToken) -> crate::error::RuntimeResult<u64>;
    async fn try_get_next(&self, cursor: u64) -> crate::error::RuntimeResult<Option<Vec<Vec<u8>>>>;
    async fn signal_purge(&self, before: SystemTime) -> crate::error::RuntimeResult<()>;
    async fn is_under_pressure(&self) -> bool;
}

/// Ring-wrap arithmetic shared by the Grain Directory's consistent-hash
/// ring and the Timer/Reminder Service's hash-range scan. See spec.md §6
/// and the scenario 7 ("reminder wrap") test.
pub fn hash_in_range(hash: u32, begin: u32, end: u32) -> bool {
    if begin < end {
        hash > begin && hash <= end
    } else {
        hash > begin || hash <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_open_interval_excludes_begin_includes_end() {
        assert!(!hash_in_range(10, 10, 20));
        assert!(hash_in_range(20, 10, 20));
        assert!(hash_in_range(15, 10, 20));
        assert!(!hash_in_range(25, 10, 20));
    }

    #[test]
    fn wrap_range_is_two_disjoint_halves() {
        // begin=0xC000_0000, end=0x1000_0000 (wrap)
        let begin = 0xC000_0000u32;
        let end = 0x1000_0000u32;
        assert!(hash_in_range(0x0000_0010, begin, end));
        assert!(hash_in_range(0xFFFF_FFF0, begin, end));
        assert!(hash_in_range(0x1000_0000, begin, end)); // end boundary included
        assert!(!hash_in_range(0x8000_0000, begin, end));
        assert!(!hash_in_range(0xC000_0000, begin, end)); // begin excluded
    }
}
