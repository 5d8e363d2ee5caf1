//! Activation Catalog — spec.md §4.4.
//!
//! Grounded on `knhk-sidecar::service::SidecarService`: a long-lived
//! per-resource struct holding explicit lifecycle state plus hooks that run
//! before/after dispatch, generalized here to one entry per activation with
//! `onActivate`/`onDeactivate` hooks and a deactivation-reason cool-down.

use async_trait::async_trait;
use dashmap::DashMap;
use silomesh_core::address::{ActivationAddress, ActivationId, GrainId, SiloAddress};
use silomesh_core::error::{RuntimeError, RuntimeResult};
use silomesh_directory::GrainDirectory;
use silomesh_placement::{PlacementContext, PlacementStrategy, SiloLoad};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Why an activation was deactivated (spec.md §4.4 "surfaced in logs").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeactivationReason {
    Idle,
    ShuttingDown,
    ApplicationError,
    InconsistentState,
}

impl DeactivationReason {
    /// Reasons that must suppress immediate reactivation (spec.md §4.4).
    fn cooldown(self) -> Option<Duration> {
        match self {
            DeactivationReason::ApplicationError | DeactivationReason::InconsistentState => {
                Some(Duration::from_secs(5))
            }
            DeactivationReason::Idle | DeactivationReason::ShuttingDown => None,
        }
    }
}

/// User-supplied lifecycle hooks for one grain type, run by the Catalog
/// around activation creation/removal (spec.md §4.4 "Lifecycle hooks").
#[async_trait]
pub trait ActivationHooks: Send + Sync {
    async fn on_activate(&self, grain: &GrainId) -> RuntimeResult<()>;
    async fn on_deactivate(&self, grain: &GrainId, reason: DeactivationReason);
}

pub struct NoopHooks;

#[async_trait]
impl ActivationHooks for NoopHooks {
    async fn on_activate(&self, _grain: &GrainId) -> RuntimeResult<()> {
        Ok(())
    }
    async fn on_deactivate(&self, _grain: &GrainId, _reason: DeactivationReason) {}
}

struct CatalogEntry {
    address: ActivationAddress,
    cooldown_until: Option<Instant>,
}

pub struct ActivationCatalog {
    self_silo: SiloAddress,
    directory: Arc<GrainDirectory>,
    hooks: Arc<dyn ActivationHooks>,
    entries: DashMap<GrainId, Arc<AsyncMutex<Option<CatalogEntry>>>>,
}

impl ActivationCatalog {
    pub fn new(self_silo: SiloAddress, directory: Arc<GrainDirectory>, hooks: Arc<dyn ActivationHooks>) -> Self {
        Self {
            self_silo,
            directory,
            hooks,
            entries: DashMap::new(),
        }
    }

    /// `getOrCreate(grainId) -> (address, existing?)` (spec.md §4.4).
    /// Idempotent under concurrent callers: the per-grain `AsyncMutex`
    /// serializes creation so two concurrent callers observe one
    /// activation, matching `SidecarService`'s single-flight dispatch lock.
    pub async fn get_or_create(
        &self,
        grain: GrainId,
        placement: &dyn PlacementStrategy,
        candidates: &[SiloLoad],
    ) -> RuntimeResult<(ActivationAddress, bool)> {
        let slot = self
            .entries
            .entry(grain.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone();
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if let Some(until) = entry.cooldown_until {
                if Instant::now() < until {
                    return Err(RuntimeError::Overloaded);
                }
            } else {
                return Ok((entry.address.clone(), true));
            }
        }

        let ctx = PlacementContext {
            grain: &grain,
            caller_silo: Some(&self.self_silo),
            candidates,
        };
        let target = placement.choose(&ctx).unwrap_or_else(|| self.self_silo.clone());
        let address = ActivationAddress::new(grain.clone(), target, ActivationId::new());

        if let Err(e) = self.hooks.on_activate(&grain).await {
            warn!(grain = %grain, error = %e, "catalog: onActivate failed, discarding partial activation");
            *guard = None;
            return Err(RuntimeError::ActivationFailed(e.to_string()));
        }

        let winner = self.directory.register(address)?;
        *guard = Some(CatalogEntry {
            address: winner.clone(),
            cooldown_until: None,
        });
        info!(grain = %grain, activation = %winner, "catalog: activation created");
        Ok((winner, false))
    }

    pub async fn find(&self, grain: &GrainId) -> Option<ActivationAddress> {
        let slot = self.entries.get(grain)?.clone();
        let guard = slot.lock().await;
        guard.as_ref().map(|e| e.address.clone())
    }

    /// `deactivate(address, reason)` (spec.md §4.4). Caller must have
    /// already drained the activation's scheduler queue.
    pub async fn deactivate(&self, grain: &GrainId, reason: DeactivationReason) {
        let Some(slot) = self.entries.get(grain).map(|e| e.clone()) else {
            return;
        };
        let mut guard = slot.lock().await;
        let Some(entry) = guard.take() else { return };

        self.directory.unregister(&entry.address);
        self.hooks.on_deactivate(grain, reason).await;
        info!(grain = %grain, reason = ?reason, "catalog: activation deactivated");

        if let Some(cooldown) = reason.cooldown() {
            *guard = Some(CatalogEntry {
                address: entry.address,
                cooldown_until: Some(Instant::now() + cooldown),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silomesh_placement::RandomActive;

    fn silo(n: u64) -> SiloAddress {
        SiloAddress::new(format!("10.0.0.{n}:8080"), 1)
    }

    fn grain(id: i64) -> GrainId {
        GrainId::long("Account", id)
    }

    fn catalog() -> ActivationCatalog {
        let dir = Arc::new(GrainDirectory::new(silo(1), 16));
        dir.update_ring(vec![silo(1)]);
        ActivationCatalog::new(silo(1), dir, Arc::new(NoopHooks))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_for_concurrent_callers() {
        let catalog = Arc::new(catalog());
        let g = grain(1);
        let candidates = vec![];

        let mut handles = Vec::new();
        for _ in 0..10 {
            let catalog = catalog.clone();
            let g = g.clone();
            let candidates = candidates.clone();
            handles.push(tokio::spawn(async move {
                catalog.get_or_create(g, &RandomActive, &candidates).await.unwrap()
            }));
        }
        let mut addresses = Vec::new();
        for h in handles {
            addresses.push(h.await.unwrap().0);
        }
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn deactivate_with_application_error_blocks_immediate_reactivation() {
        let catalog = catalog();
        let g = grain(2);
        let (addr, _) = catalog.get_or_create(g.clone(), &RandomActive, &[]).await.unwrap();
        catalog.deactivate(&g, DeactivationReason::ApplicationError).await;

        let err = catalog.get_or_create(g.clone(), &RandomActive, &[]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Overloaded));
        let _ = addr;
    }

    #[tokio::test]
    async fn deactivate_idle_allows_immediate_reactivation() {
        let catalog = catalog();
        let g = grain(3);
        catalog.get_or_create(g.clone(), &RandomActive, &[]).await.unwrap();
        catalog.deactivate(&g, DeactivationReason::Idle).await;

        let (_, existing) = catalog.get_or_create(g.clone(), &RandomActive, &[]).await.unwrap();
        assert!(!existing);
    }
}
