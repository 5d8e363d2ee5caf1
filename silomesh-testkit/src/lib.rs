//! In-memory collaborator backends and a multi-silo harness, used only by
//! tests (spec.md §6: "in-memory (primary-silo hosted)" is one of the
//! observed `MembershipBackend` implementations; the others here follow the
//! same idiom for the remaining external interfaces).
//!
//! Grounded on the teacher's own `#[cfg(test)]` mock collaborators (e.g.
//! `knhk-sidecar`'s test doubles for `ConnectorError`-returning
//! dependencies): a thin `Mutex`/`RwLock`-guarded `Vec`/`HashMap` standing in
//! for the real network/storage round trip.

use async_trait::async_trait;
use silomesh_core::address::{GrainId, SiloAddress};
use silomesh_core::error::{RuntimeError, RuntimeResult};
use silomesh_core::interfaces::{hash_in_range, MembershipBackend, PersistentStateBackend, ReminderRow, ReminderStore, SequenceToken, StreamQueueCache};
use silomesh_core::membership::{MembershipEntry, MembershipTable, TableVersion};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::debug;

/// Shared, process-wide in-memory membership table: every silo in a test
/// cluster hands this same instance to its own `MembershipOracle`.
pub struct InMemoryMembershipBackend {
    table: RwLock<MembershipTable>,
}

impl Default for InMemoryMembershipBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMembershipBackend {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(MembershipTable::empty()),
        }
    }
}

#[async_trait]
impl MembershipBackend for InMemoryMembershipBackend {
    async fn initialize(&self, try_init_version: TableVersion) -> RuntimeResult<()> {
        let mut table = self.table.write().await;
        if table.entries.is_empty() {
            table.version = try_init_version;
        }
        Ok(())
    }

    async fn read_all(&self) -> RuntimeResult<MembershipTable> {
        Ok(self.table.read().await.clone())
    }

    async fn read_row(&self, silo: &SiloAddress) -> RuntimeResult<MembershipTable> {
        let table = self.table.read().await;
        Ok(MembershipTable {
            entries: table.row(silo).cloned().into_iter().collect(),
            version: table.version.clone(),
        })
    }

    async fn insert_row(&self, entry: MembershipEntry, table_version: TableVersion) -> RuntimeResult<bool> {
        let mut table = self.table.write().await;
        if table.version != table_version {
            debug!(silo = %entry.address, "testkit membership: insert contended on version mismatch");
            return Ok(false);
        }
        if table.row(&entry.address).is_some() {
            return Ok(false);
        }
        let bumped = table.version.bump();
        table.entries.push(entry);
        table.version = bumped;
        Ok(true)
    }

    async fn update_row(&self, entry: MembershipEntry, etag: TableVersion, table_version: TableVersion) -> RuntimeResult<bool> {
        let mut table = self.table.write().await;
        if table.version != etag {
            return Ok(false);
        }
        let Some(pos) = table.entries.iter().position(|e| e.address == entry.address) else {
            return Ok(false);
        };
        table.entries[pos] = entry;
        table.version = table_version;
        Ok(true)
    }

    async fn update_iam_alive(&self, entry: MembershipEntry) -> RuntimeResult<()> {
        let mut table = self.table.write().await;
        if let Some(pos) = table.entries.iter().position(|e| e.address == entry.address) {
            table.entries[pos].iam_alive_time = entry.iam_alive_time;
        }
        Ok(())
    }

    async fn delete_membership_table_entries(&self, _cluster_id: &str) -> RuntimeResult<()> {
        *self.table.write().await = MembershipTable::empty();
        Ok(())
    }

    async fn cleanup_defunct_silo_entries(&self, before: SystemTime) -> RuntimeResult<()> {
        let mut table = self.table.write().await;
        table.entries.retain(|e| !(e.is_dead() && e.iam_alive_time < before));
        Ok(())
    }
}

/// In-memory persistent-state backend, spec.md §6 "Persistent state
/// backend". A wrong etag surfaces `InconsistentState`, matching the
/// contract's "write with wrong etag ... may auto-deactivate".
pub struct InMemoryPersistentStateBackend {
    rows: StdMutex<HashMap<(GrainId, String), (Vec<u8>, String)>>,
    next_etag: StdMutex<u64>,
}

impl Default for InMemoryPersistentStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersistentStateBackend {
    pub fn new() -> Self {
        Self {
            rows: StdMutex::new(HashMap::new()),
            next_etag: StdMutex::new(1),
        }
    }

    fn fresh_etag(&self) -> String {
        let mut n = self.next_etag.lock().unwrap();
        let etag = format!("etag-{n}");
        *n += 1;
        etag
    }
}

#[async_trait]
impl PersistentStateBackend for InMemoryPersistentStateBackend {
    async fn read(&self, grain: &GrainId, state_name: &str) -> RuntimeResult<(Vec<u8>, String)> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .get(&(grain.clone(), state_name.to_string()))
            .cloned()
            .unwrap_or_else(|| (Vec::new(), "etag-0".to_string())))
    }

    async fn write(&self, grain: &GrainId, state_name: &str, state: Vec<u8>, etag: String) -> RuntimeResult<String> {
        let mut rows = self.rows.lock().unwrap();
        let key = (grain.clone(), state_name.to_string());
        let current_etag = rows.get(&key).map(|(_, e)| e.clone()).unwrap_or_else(|| "etag-0".to_string());
        if current_etag != etag {
            return Err(RuntimeError::InconsistentState(format!(
                "expected etag {etag}, found {current_etag} for {grain}/{state_name}"
            )));
        }
        drop(rows);
        let new_etag = self.fresh_etag();
        self.rows.lock().unwrap().insert(key, (state, new_etag.clone()));
        Ok(new_etag)
    }

    async fn clear(&self, grain: &GrainId, state_name: &str, etag: String) -> RuntimeResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let key = (grain.clone(), state_name.to_string());
        let current_etag = rows.get(&key).map(|(_, e)| e.clone()).unwrap_or_else(|| "etag-0".to_string());
        if current_etag != etag {
            return Err(RuntimeError::InconsistentState(format!("expected etag {etag}, found {current_etag}")));
        }
        rows.remove(&key);
        Ok(())
    }
}

/// In-memory reminder store, spec.md §6 "Reminder store".
pub struct InMemoryReminderStore {
    rows: StdMutex<Vec<ReminderRow>>,
    next_etag: StdMutex<u64>,
}

impl Default for InMemoryReminderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReminderStore {
    pub fn new() -> Self {
        Self {
            rows: StdMutex::new(Vec::new()),
            next_etag: StdMutex::new(1),
        }
    }

    fn fresh_etag(&self) -> String {
        let mut n = self.next_etag.lock().unwrap();
        let etag = format!("etag-{n}");
        *n += 1;
        etag
    }
}

#[async_trait]
impl ReminderStore for InMemoryReminderStore {
    async fn read_row(&self, service_id: &str, grain: &GrainId, name: &str) -> RuntimeResult<Option<ReminderRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.service_id == service_id && &r.grain == grain && r.name == name)
            .cloned())
    }

    async fn read_rows_for_grain(&self, service_id: &str, grain: &GrainId) -> RuntimeResult<Vec<ReminderRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.service_id == service_id && &r.grain == grain)
            .cloned()
            .collect())
    }

    async fn read_rows_for_hash_range(&self, service_id: &str, begin: u32, end: u32) -> RuntimeResult<Vec<ReminderRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.service_id == service_id && hash_in_range(r.grain_hash, begin, end))
            .cloned()
            .collect())
    }

    async fn upsert(&self, row: ReminderRow) -> RuntimeResult<String> {
        let etag = self.fresh_etag();
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|r| !(r.service_id == row.service_id && r.grain == row.grain && r.name == row.name));
        let mut row = row;
        row.etag = etag.clone();
        rows.push(row);
        Ok(etag)
    }

    async fn remove(&self, service_id: &str, grain: &GrainId, name: &str, etag: &str) -> RuntimeResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| !(r.service_id == service_id && &r.grain == grain && r.name == name && r.etag == etag));
        if rows.len() == before {
            return Err(RuntimeError::InconsistentState(format!("no reminder row matched etag {etag}")));
        }
        Ok(())
    }
}

/// In-memory stream/queue cache, spec.md §6 "Stream/queue cache".
/// Eviction is chronological with a time-purge predicate, as specified;
/// pressure is a simple configurable threshold on queue depth.
pub struct InMemoryStreamQueueCache {
    messages: StdMutex<Vec<(SequenceToken, SystemTime, Vec<u8>)>>,
    next_token: StdMutex<u64>,
    pressure_threshold: usize,
}

impl InMemoryStreamQueueCache {
    pub fn new(pressure_threshold: usize) -> Self {
        Self {
            messages: StdMutex::new(Vec::new()),
            next_token: StdMutex::new(0),
            pressure_threshold,
        }
    }
}

#[async_trait]
impl StreamQueueCache for InMemoryStreamQueueCache {
    async fn add_messages(&self, batch: Vec<Vec<u8>>, dequeue_time: SystemTime) -> RuntimeResult<Vec<SequenceToken>> {
        let mut messages = self.messages.lock().unwrap();
        let mut tokens = Vec::with_capacity(batch.len());
        let mut next = self.next_token.lock().unwrap();
        for item in batch {
            let token = SequenceToken(*next);
            *next += 1;
            messages.push((token.clone(), dequeue_time, item));
            tokens.push(token);
        }
        Ok(tokens)
    }

    async fn get_cursor(&self, _stream_id: &str, sequence_token: SequenceToken) -> RuntimeResult<u64> {
        Ok(sequence_token.0)
    }

    async fn try_get_next(&self, cursor: u64) -> RuntimeResult<Option<Vec<Vec<u8>>>> {
        let messages = self.messages.lock().unwrap();
        let next: Vec<Vec<u8>> = messages
            .iter()
            .filter(|(token, _, _)| token.0 >= cursor)
            .map(|(_, _, payload)| payload.clone())
            .collect();
        Ok(if next.is_empty() { None } else { Some(next) })
    }

    async fn signal_purge(&self, before: SystemTime) -> RuntimeResult<()> {
        self.messages.lock().unwrap().retain(|(_, dequeued_at, _)| *dequeued_at >= before);
        Ok(())
    }

    async fn is_under_pressure(&self) -> bool {
        self.messages.lock().unwrap().len() >= self.pressure_threshold
    }
}
