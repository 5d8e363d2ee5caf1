//! Directory entry data model — spec.md §3 "Directory entry", §4.2.

use crate::address::{ActivationAddress, SiloAddress};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub activation: ActivationAddress,
    pub registered_at: SystemTime,
    pub owner_hint: Option<SiloAddress>,
}

impl DirectoryEntry {
    pub fn new(activation: ActivationAddress) -> Self {
        Self {
            activation,
            registered_at: SystemTime::now(),
            owner_hint: None,
        }
    }
}
