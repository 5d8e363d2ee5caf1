//! End-to-end scenario tests — spec.md §8 "Scenarios". Scenarios 4 (scheduler
//! serialization), 6 (prefix writer overflow), and 7 (reminder wrap) are
//! exercised as unit tests alongside the components they belong to
//! (`silomesh-scheduler`, `silomesh-transport`, `silomesh-timers`); this file
//! covers the scenarios that genuinely span multiple crates.

use async_trait::async_trait;
use silomesh_catalog::{ActivationCatalog, NoopHooks};
use silomesh_core::address::{ActivationAddress, ActivationId, GrainId, SiloAddress};
use silomesh_core::directory::DirectoryEntry;
use silomesh_core::error::RuntimeResult;
use silomesh_core::membership::SiloStatus;
use silomesh_core::message::{CorrelationId, Direction, Message, MessageBody, MessageHeader, RejectionKind, RequestContext};
use silomesh_core::txn::{CommitRole, PriorityTimestamp, TxId};
use silomesh_directory::GrainDirectory;
use silomesh_membership::{MembershipConfig, MembershipOracle, Prober};
use silomesh_placement::RandomActive;
use silomesh_router::{InboundSink, MessageRouter, RouterConfig, RouterTransport};
use silomesh_testkit::InMemoryMembershipBackend;
use silomesh_txnlock::LockManager;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn addr(n: u64) -> SiloAddress {
    SiloAddress::new(format!("10.0.0.{n}:8080"), 1)
}

fn cfg_with(threshold_k: u32, fanout: usize) -> MembershipConfig {
    MembershipConfig {
        suspicion_threshold_k: threshold_k,
        probe_fanout: fanout,
        ..MembershipConfig::default()
    }
}

struct AlwaysFailProber;

#[async_trait]
impl Prober for AlwaysFailProber {
    async fn probe(&self, _target: &SiloAddress) -> bool {
        false
    }
}

/// Scenario 1: membership join/leave. 3 silos join; every probe of S2 from
/// its peers fails (standing in for "S2's process exited"). Within one
/// probe round, S1 and S3 must observe S2 as Dead with the table version
/// strictly increased.
#[tokio::test]
async fn membership_join_leave_marks_dead_after_suspicion_threshold() {
    let backend = Arc::new(InMemoryMembershipBackend::new());
    let cfg = cfg_with(2, 2);

    let s1 = MembershipOracle::new(backend.clone(), addr(1), cfg.clone());
    let s2 = MembershipOracle::new(backend.clone(), addr(2), cfg.clone());
    let s3 = MembershipOracle::new(backend.clone(), addr(3), cfg.clone());
    s1.join("h1", "default").await.unwrap();
    s2.join("h2", "default").await.unwrap();
    s3.join("h3", "default").await.unwrap();

    let v0 = s1.read_all().await.unwrap().version.version;

    s1.probe_once(&AlwaysFailProber).await.unwrap();
    s3.probe_once(&AlwaysFailProber).await.unwrap();

    let table = s1.read_all().await.unwrap();
    assert_eq!(table.row(&addr(2)).unwrap().status, SiloStatus::Dead);
    assert!(table.version.version > v0);
}

/// Scenario 2: registration race. Two concurrent callers request an
/// activation for the same grain on its owning silo; exactly one activation
/// must result and both callers must observe the same address.
#[tokio::test]
async fn registration_race_settles_on_one_activation() {
    let self_silo = addr(1);
    let dir = Arc::new(GrainDirectory::new(self_silo.clone(), 16));
    dir.update_ring(vec![self_silo.clone()]);
    let catalog = Arc::new(ActivationCatalog::new(self_silo, dir, Arc::new(NoopHooks)));
    let grain = GrainId::long("Account", 42);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let catalog = catalog.clone();
        let grain = grain.clone();
        handles.push(tokio::spawn(async move { catalog.get_or_create(grain, &RandomActive, &[]).await.unwrap() }));
    }
    let mut addresses = Vec::new();
    for h in handles {
        addresses.push(h.await.unwrap().0);
    }
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
}

struct NoopTransport;

#[async_trait]
impl RouterTransport for NoopTransport {
    async fn send(&self, _target: &SiloAddress, _msg: Message) -> RuntimeResult<()> {
        Ok(())
    }
}

struct NoopSink;

impl InboundSink for NoopSink {
    fn deliver(&self, _msg: Message) {}
}

/// Scenario 3: cache invalidation on silo death. A stale cached entry for a
/// grain owned elsewhere must be dropped the moment a `CacheInvalidation`
/// rejection naming it arrives at the Router.
#[tokio::test]
async fn cache_invalidation_rejection_drops_stale_directory_entry() {
    let self_silo = addr(1);
    let owner = addr(2);
    let dir = Arc::new(GrainDirectory::new(self_silo.clone(), 16));
    dir.update_ring(vec![self_silo.clone(), owner.clone()]);

    let grain = (0..64)
        .map(|i| GrainId::long("Account", i))
        .find(|g| dir.owner(g) == Some(owner.clone()))
        .expect("ring should route some grain to the owner silo");

    let stale = ActivationAddress::new(grain.clone(), owner, ActivationId::new());
    dir.cache_insert(DirectoryEntry::new(stale.clone()));
    assert!(dir.lookup(&grain).is_ok());

    let router = MessageRouter::new(self_silo.clone(), RouterConfig::default(), dir.clone(), Arc::new(NoopTransport));

    let rejection = Message {
        header: MessageHeader {
            sending_grain: None,
            sending_silo: stale.silo.clone(),
            target_grain: grain.clone(),
            target_silo: Some(self_silo),
            correlation_id: CorrelationId(1),
            direction: Direction::Response,
            interface_type: "IAccount".into(),
            interface_version: 1,
            expires_at: SystemTime::now() + Duration::from_secs(30),
            retry_count: 0,
            cache_invalidation: vec![stale],
            context: RequestContext::default(),
            rejection: Some(RejectionKind::CacheInvalidation),
        },
        body: MessageBody::Response { payload: vec![] },
    };
    router.receive(rejection, &NoopSink).await.unwrap();

    assert!(dir.lookup(&grain).is_err());
}

/// Scenario 5: transactional concurrency. Two coordinators both touch a
/// grain shared between disjoint transactions; writer/writer conflict keeps
/// them in separate lock groups, and each exits (committing its delta) only
/// once its commit role is determined and it is the group's minimum pending
/// timestamp, producing a deterministic total order.
#[test]
fn transactional_concurrency_on_shared_grain_commits_in_priority_order() {
    let mut shared_lock = LockManager::new(4, Duration::from_secs(10));
    let now = SystemTime::now();
    let mut shared_value: i64 = 0;

    shared_lock.enter(TxId(1), PriorityTimestamp(1), 1, false, Box::new(|| {}), now).unwrap();
    shared_lock.enter(TxId(2), PriorityTimestamp(2), 1, false, Box::new(|| {}), now).unwrap();
    assert_eq!(shared_lock.group_count(), 2, "two writers on the same grain must never share a group");

    shared_lock.set_role(TxId(1), CommitRole::LocalCommit);
    let exited = shared_lock.tick(now);
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].tx_id, TxId(1));
    shared_value += 5;

    shared_lock.set_role(TxId(2), CommitRole::LocalCommit);
    let exited = shared_lock.tick(now);
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].tx_id, TxId(2));
    shared_value += 5;

    assert_eq!(shared_value, 10);
}
