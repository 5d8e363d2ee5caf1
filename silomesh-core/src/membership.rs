//! Membership table data model — spec.md §3, §4.1.

use crate::address::SiloAddress;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-silo lifecycle state. Ordered as spec.md §3 requires:
/// `Created < Joining < Active < ShuttingDown < Stopping < Dead`.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub enum SiloStatus {
    Created,
    Joining,
    Active,
    ShuttingDown,
    Stopping,
    Dead,
}

impl SiloStatus {
    /// Whether `self -> next` is one of the transitions spec.md §4.1
    /// allows: the normal forward chain, or a forced jump to `Dead` from
    /// any state.
    pub fn can_transition_to(self, next: SiloStatus) -> bool {
        use SiloStatus::*;
        if next == Dead {
            return self != Dead;
        }
        matches!(
            (self, next),
            (Created, Joining) | (Joining, Active) | (Active, ShuttingDown) | (ShuttingDown, Stopping)
        )
    }
}

/// A suspicion vote: `suspector` observed `suspect_time` as the moment it
/// failed to reach the owning silo.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suspicion {
    pub suspector: SiloAddress,
    pub suspect_time: SystemTime,
}

/// One row of the membership table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub address: SiloAddress,
    pub host_name: String,
    pub role: String,
    pub status: SiloStatus,
    pub start_time: SystemTime,
    pub iam_alive_time: SystemTime,
    pub update_zone: u32,
    pub fault_zone: u32,
    pub suspectors: Vec<Suspicion>,
}

impl MembershipEntry {
    pub fn new_joining(address: SiloAddress, host_name: impl Into<String>, role: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            address,
            host_name: host_name.into(),
            role: role.into(),
            status: SiloStatus::Joining,
            start_time: now,
            iam_alive_time: now,
            update_zone: 0,
            fault_zone: 0,
            suspectors: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SiloStatus::Active
    }

    pub fn is_dead(&self) -> bool {
        self.status == SiloStatus::Dead
    }
}

/// Opaque optimistic-concurrency tag for a table version row. `None` means
/// the backing store returned a null etag for an absent row — spec.md §9
/// open question (a); implementations must decide whether to accept that
/// as "version 0" (this runtime does: [`TableVersion::initial`]) or refuse
/// to mutate (a backend may instead surface an error before one is ever
/// constructed).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableVersion {
    pub version: u64,
    pub etag: String,
}

impl TableVersion {
    pub fn initial() -> Self {
        Self {
            version: 0,
            etag: "0".to_string(),
        }
    }

    /// The version/etag pair an update that strictly increases `version`
    /// must produce (testable property: "table version monotonicity").
    pub fn bump(&self) -> Self {
        let next = self.version + 1;
        Self {
            version: next,
            etag: next.to_string(),
        }
    }
}

/// The full versioned roster returned by `readAll`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipTable {
    pub entries: Vec<MembershipEntry>,
    pub version: TableVersion,
}

impl MembershipTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            version: TableVersion::initial(),
        }
    }

    pub fn row(&self, address: &SiloAddress) -> Option<&MembershipEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }

    pub fn active_silos(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.entries.iter().filter(|e| e.is_active())
    }
}

pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
