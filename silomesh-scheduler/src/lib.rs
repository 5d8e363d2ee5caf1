//! Activation Scheduler — spec.md §4.5.
//!
//! Grounded on `knhk-sidecar::batching`'s per-key FIFO batching queue,
//! generalized from "batch window" semantics to "one in-flight item per
//! activation," and on the teacher's pervasive `tokio::sync::mpsc`
//! single-consumer-queue idiom for serialized work.

use silomesh_core::error::{RuntimeError, RuntimeResult};
use silomesh_core::message::CallChainId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub type BoxedTurn = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-grain-type reentrancy policy (spec.md §4.5 "Reentrancy policies").
#[derive(Clone)]
pub enum ReentrancyPolicy {
    NonReentrant,
    Reentrant,
    MayInterleave(Arc<dyn Fn(&WorkItemMeta) -> bool + Send + Sync>),
    CallChain,
}

#[derive(Clone, Debug, Default)]
pub struct WorkItemMeta {
    pub call_chain_root: Option<CallChainId>,
    pub is_continuation: bool,
}

pub struct WorkItem {
    pub meta: WorkItemMeta,
    pub turn: BoxedTurn,
}

/// Owns the FIFO queue and drain loop for one activation. New externally
/// queued messages are rejected once `stop()` has been called; continuations
/// posted by the currently running turn still execute to drain (spec.md
/// §4.5 "Stop semantics").
pub struct ActivationScheduler {
    tx: mpsc::UnboundedSender<WorkItem>,
    stopped: Arc<AtomicBool>,
    drain_handle: tokio::task::JoinHandle<()>,
}

impl ActivationScheduler {
    pub fn spawn(policy: ReentrancyPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let drain_handle = tokio::spawn(drain_loop(rx, policy));
        Self { tx, stopped, drain_handle }
    }

    /// Submit an externally-delivered message. Rejected with a retryable
    /// failure once the activation has started stopping.
    pub fn submit(&self, item: WorkItem) -> RuntimeResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RuntimeError::Overloaded);
        }
        self.tx
            .send(item)
            .map_err(|_| RuntimeError::Internal("scheduler drain loop has exited".into()))
    }

    /// Submit a continuation posted from within the currently running
    /// turn. Bypasses the stop gate (spec.md §4.5).
    pub fn submit_continuation(&self, mut item: WorkItem) -> RuntimeResult<()> {
        item.meta.is_continuation = true;
        self.tx
            .send(item)
            .map_err(|_| RuntimeError::Internal("scheduler drain loop has exited".into()))
    }

    /// Begin stopping: new external submissions are rejected from now on.
    pub fn begin_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Drop the sole sender so the drain loop exits once the queue empties,
    /// then await full drain.
    pub async fn stop_and_drain(self) {
        self.begin_stop();
        drop(self.tx);
        let _ = self.drain_handle.await;
    }
}

async fn drain_loop(mut rx: mpsc::UnboundedReceiver<WorkItem>, policy: ReentrancyPolicy) {
    let in_flight_chains: Arc<Mutex<HashMap<CallChainId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let chain_idle = Arc::new(tokio::sync::Notify::new());
    let mut reentrant_tasks = JoinSet::new();

    while let Some(item) = rx.recv().await {
        let should_interleave = match &policy {
            ReentrancyPolicy::NonReentrant => false,
            ReentrancyPolicy::Reentrant => true,
            ReentrancyPolicy::MayInterleave(pred) => pred(&item.meta),
            ReentrancyPolicy::CallChain => item
                .meta
                .call_chain_root
                .map(|root| in_flight_chains.lock().unwrap().contains_key(&root))
                .unwrap_or(false),
        };

        if should_interleave {
            debug!("scheduler: turn spawned reentrant");
            enter_chain(&in_flight_chains, item.meta.call_chain_root);
            spawn_turn(&mut reentrant_tasks, item, in_flight_chains.clone(), chain_idle.clone());
        } else if matches!(policy, ReentrancyPolicy::CallChain) {
            // A call-chain turn must never block this loop in place: it may
            // itself post a same-root continuation that has to be dequeued
            // and run concurrently with it to avoid self-deadlock (spec.md
            // §4.5 "call-chain reentrancy"). Wait for any unrelated chain
            // currently in flight to drain, then run this one as its own
            // task so a later same-root sibling can still interleave with
            // it without ever being stuck behind this loop.
            let root = item.meta.call_chain_root;
            loop {
                let notified = chain_idle.notified();
                let clear = {
                    let set = in_flight_chains.lock().unwrap();
                    set.is_empty() || root.map(|r| set.contains_key(&r)).unwrap_or(false)
                };
                if clear {
                    break;
                }
                notified.await;
            }
            enter_chain(&in_flight_chains, root);
            spawn_turn(&mut reentrant_tasks, item, in_flight_chains.clone(), chain_idle.clone());
        } else {
            // Exclusivity guarantee: await the turn in place before the
            // next queue item is even dequeued.
            item.turn.await;
        }
    }

    while let Some(res) = reentrant_tasks.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "scheduler: reentrant turn panicked");
        }
    }
}

fn enter_chain(chains: &Mutex<HashMap<CallChainId, usize>>, root: Option<CallChainId>) {
    if let Some(root) = root {
        *chains.lock().unwrap().entry(root).or_insert(0) += 1;
    }
}

fn spawn_turn(
    tasks: &mut JoinSet<()>,
    item: WorkItem,
    chains: Arc<Mutex<HashMap<CallChainId, usize>>>,
    idle: Arc<tokio::sync::Notify>,
) {
    let root = item.meta.call_chain_root;
    tasks.spawn(async move {
        item.turn.await;
        if let Some(root) = root {
            let mut guard = chains.lock().unwrap();
            if let Some(count) = guard.get_mut(&root) {
                *count -= 1;
                if *count == 0 {
                    guard.remove(&root);
                }
            }
        }
        idle.notify_waiters();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn item(turn: BoxedTurn) -> WorkItem {
        WorkItem {
            meta: WorkItemMeta::default(),
            turn,
        }
    }

    fn item_with_chain(turn: BoxedTurn, root: CallChainId) -> WorkItem {
        WorkItem {
            meta: WorkItemMeta {
                call_chain_root: Some(root),
                is_continuation: false,
            },
            turn,
        }
    }

    #[tokio::test]
    async fn reentrant_turns_do_observe_overlap() {
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::Reentrant);
        let flag = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));

        let flag1 = flag.clone();
        scheduler
            .submit(item(Box::pin(async move {
                flag1.store(true, Ordering::SeqCst);
                let rx = rx.lock().await.take().unwrap();
                let _ = rx.await;
            })))
            .unwrap();

        // Give the first turn a chance to start and block on the channel.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let flag2 = flag.clone();
        let overlapped2 = overlapped.clone();
        scheduler
            .submit(item(Box::pin(async move {
                if flag2.load(Ordering::SeqCst) {
                    overlapped2.store(true, Ordering::SeqCst);
                }
                let _ = tx.send(());
            })))
            .unwrap();

        scheduler.stop_and_drain().await;
        assert!(overlapped.load(Ordering::SeqCst), "reentrant turns must be able to interleave");
    }

    #[tokio::test]
    async fn may_interleave_predicate_gates_overlap() {
        // The predicate is evaluated per-message, independent of anything
        // already in flight, so both messages need to satisfy it for either
        // to be admitted to run concurrently.
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::MayInterleave(Arc::new(|meta| meta.is_continuation)));
        let flag = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));

        let flag1 = flag.clone();
        let mut first = item(Box::pin(async move {
            flag1.store(true, Ordering::SeqCst);
            let rx = rx.lock().await.take().unwrap();
            let _ = rx.await;
        }));
        first.meta.is_continuation = true;
        scheduler.submit(first).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let flag2 = flag.clone();
        let overlapped2 = overlapped.clone();
        let mut second = item(Box::pin(async move {
            if flag2.load(Ordering::SeqCst) {
                overlapped2.store(true, Ordering::SeqCst);
            }
            let _ = tx.send(());
        }));
        second.meta.is_continuation = true;
        scheduler.submit(second).unwrap();

        scheduler.stop_and_drain().await;
        assert!(overlapped.load(Ordering::SeqCst), "predicate-admitted turns must be able to interleave");
    }

    #[tokio::test]
    async fn call_chain_turns_with_same_root_interleave() {
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::CallChain);
        let root = CallChainId(42);
        let flag = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));

        let flag1 = flag.clone();
        scheduler
            .submit(item_with_chain(
                Box::pin(async move {
                    flag1.store(true, Ordering::SeqCst);
                    // Blocks until the same-chain sibling below acknowledges
                    // it ran; if the drain loop were still stuck awaiting
                    // this turn in place, the sibling could never be
                    // dequeued and this would hang forever.
                    let rx = rx.lock().await.take().unwrap();
                    let _ = rx.await;
                }),
                root,
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let flag2 = flag.clone();
        let overlapped2 = overlapped.clone();
        scheduler
            .submit(item_with_chain(
                Box::pin(async move {
                    if flag2.load(Ordering::SeqCst) {
                        overlapped2.store(true, Ordering::SeqCst);
                    }
                    let _ = tx.send(());
                }),
                root,
            ))
            .unwrap();

        scheduler.stop_and_drain().await;
        assert!(
            overlapped.load(Ordering::SeqCst),
            "a second message sharing the in-flight turn's call chain root must interleave with it"
        );
    }

    #[tokio::test]
    async fn call_chain_turns_with_different_roots_stay_exclusive() {
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::CallChain);
        let flag = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        for n in 0..10u64 {
            let flag = flag.clone();
            let violations = violations.clone();
            let completed = completed.clone();
            scheduler
                .submit(item_with_chain(
                    Box::pin(async move {
                        if flag.swap(true, Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        flag.store(false, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                    }),
                    CallChainId(n),
                ))
                .unwrap();
        }

        scheduler.stop_and_drain().await;
        assert_eq!(violations.load(Ordering::SeqCst), 0, "messages from different call chains must not overlap");
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn non_reentrant_turns_never_observe_overlap() {
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::NonReentrant);
        let flag = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let flag = flag.clone();
            let violations = violations.clone();
            let completed = completed.clone();
            scheduler
                .submit(item(Box::pin(async move {
                    if flag.swap(true, Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    flag.store(false, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })))
                .unwrap();
        }

        scheduler.stop_and_drain().await;
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn external_submission_after_stop_is_rejected() {
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::NonReentrant);
        scheduler.begin_stop();
        let (_tx, rx) = oneshot::channel::<()>();
        let result = scheduler.submit(item(Box::pin(async move {
            let _ = rx.await;
        })));
        assert!(matches!(result, Err(RuntimeError::Overloaded)));
        scheduler.stop_and_drain().await;
    }

    #[tokio::test]
    async fn continuation_bypasses_stop_gate() {
        let scheduler = ActivationScheduler::spawn(ReentrancyPolicy::NonReentrant);
        scheduler.begin_stop();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        scheduler
            .submit_continuation(item(Box::pin(async move {
                ran2.store(true, Ordering::SeqCst);
            })))
            .unwrap();
        scheduler.stop_and_drain().await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
