//! Silo, grain and activation identity — spec.md §3 "Data model".

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable identifier for a silo process: network endpoint plus a
/// monotonic generation assigned at silo start. Two silos are equal only
/// when both fields match; the same endpoint restarted later is a distinct
/// silo because its generation differs.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    pub endpoint: String,
    pub generation: u64,
}

impl SiloAddress {
    pub fn new(endpoint: impl Into<String>, generation: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            generation,
        }
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.generation)
    }
}

/// The typed, opaque primary key half of a [`GrainId`]. Spec.md §3 allows
/// five shapes; system grains additionally pin a silo address into the
/// string suffix forms by convention (not a distinct variant).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum PrimaryKey {
    Guid(u128),
    Long(i64),
    String(String),
    LongWithString(i64, String),
    GuidWithString(u128, String),
}

/// A typed, opaque grain key: (type tag, primary key).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct GrainId {
    pub type_tag: String,
    pub key: PrimaryKey,
}

impl GrainId {
    pub fn new(type_tag: impl Into<String>, key: PrimaryKey) -> Self {
        Self {
            type_tag: type_tag.into(),
            key,
        }
    }

    pub fn long(type_tag: impl Into<String>, id: i64) -> Self {
        Self::new(type_tag, PrimaryKey::Long(id))
    }

    pub fn string(type_tag: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(type_tag, PrimaryKey::String(id.into()))
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.type_tag, self.key)
    }
}

/// A silo-unique identity disambiguating successive activations of the
/// same grain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub uuid::Uuid);

impl ActivationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ActivationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// (Grain identity, silo address, activation identity) — identifies one
/// physical in-memory instance of a grain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActivationAddress {
    pub grain: GrainId,
    pub silo: SiloAddress,
    pub activation: ActivationId,
}

impl ActivationAddress {
    pub fn new(grain: GrainId, silo: SiloAddress, activation: ActivationId) -> Self {
        Self {
            grain,
            silo,
            activation,
        }
    }

    /// The deterministic tie-break key used when two activations of the
    /// same grain are registered concurrently (spec.md §4.2): lower
    /// (silo address, activation identity) lexicographic tuple wins.
    pub fn tie_break_key(&self) -> (&SiloAddress, ActivationId) {
        (&self.silo, self.activation)
    }
}

impl fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.grain, self.silo, self.activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silo_address_equality_requires_generation_match() {
        let a = SiloAddress::new("10.0.0.1:8080", 1);
        let b = SiloAddress::new("10.0.0.1:8080", 2);
        assert_ne!(a, b);
        assert_eq!(a, SiloAddress::new("10.0.0.1:8080", 1));
    }

    #[test]
    fn tie_break_is_lexicographic_on_silo_then_activation() {
        let grain = GrainId::long("Account", 1);
        let silo_lo = SiloAddress::new("10.0.0.1:8080", 1);
        let silo_hi = SiloAddress::new("10.0.0.2:8080", 1);
        let a1 = ActivationAddress::new(grain.clone(), silo_lo, ActivationId::new());
        let a2 = ActivationAddress::new(grain, silo_hi, ActivationId::new());
        assert!(a1.tie_break_key() < a2.tie_break_key());
    }
}
