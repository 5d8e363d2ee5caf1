//! Message Router — spec.md §4.6.
//!
//! Grounded on `knhk-sidecar::client` for the send/await-response shape,
//! `knhk-sidecar::retry::RetryExecutor`'s bounded exponential-backoff idiom
//! (reused for the MAX_RETRIES-bounded reroute loop), and the
//! `knhk-sidecar::circuit_breaker` pattern adapted into per-target
//! `GatewayTooBusy` backoff bookkeeping.

use async_trait::async_trait;
use dashmap::DashMap;
use silomesh_core::address::{GrainId, SiloAddress};
use silomesh_core::error::{RuntimeError, RuntimeResult};
use silomesh_core::message::{CorrelationId, Message, RejectionKind};
use silomesh_directory::GrainDirectory;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

/// Outbound network send, injected so the Router never depends on a
/// concrete connection stack (same seam as `silomesh_membership::Prober`).
#[async_trait]
pub trait RouterTransport: Send + Sync {
    async fn send(&self, target: &SiloAddress, msg: Message) -> RuntimeResult<()>;
}

/// Inbound requests/one-way messages not addressed to an outstanding
/// callback are handed to this sink (the Scheduler/Catalog's entry point).
pub trait InboundSink: Send + Sync {
    fn deliver(&self, msg: Message);
}

pub struct RouterConfig {
    pub response_timeout: Duration,
    pub system_response_timeout: Duration,
    pub max_retries: u32,
    pub sweep_period: Duration,
    /// Delay before the first `GatewayTooBusy` retry to a given target.
    pub gateway_backoff_initial: Duration,
    /// Backoff delay ceiling, regardless of how many consecutive times a
    /// target has reported itself busy.
    pub gateway_backoff_max: Duration,
    /// Per-busy-report growth factor, mirroring `RetryExecutor`'s multiplier.
    pub gateway_backoff_multiplier: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            system_response_timeout: Duration::from_secs(10),
            max_retries: 3,
            sweep_period: Duration::from_secs(1),
            gateway_backoff_initial: Duration::from_millis(100),
            gateway_backoff_max: Duration::from_secs(5),
            gateway_backoff_multiplier: 2.0,
        }
    }
}

struct Callback {
    message: Message,
    completion: oneshot::Sender<RuntimeResult<Message>>,
}

/// Per-target `GatewayTooBusy` bookkeeping, adapted from
/// `knhk-sidecar::circuit_breaker`'s per-endpoint state into a plain
/// consecutive-busy-report counter driving exponential backoff rather than
/// an open/half-open/closed trip.
#[derive(Default)]
struct GatewayBackoff {
    consecutive_busy: u32,
}

pub struct MessageRouter {
    self_silo: SiloAddress,
    config: RouterConfig,
    directory: Arc<GrainDirectory>,
    transport: Arc<dyn RouterTransport>,
    callbacks: DashMap<(GrainId, CorrelationId), Callback>,
    next_correlation: AtomicU64,
    gateway_backoff: DashMap<SiloAddress, GatewayBackoff>,
}

impl MessageRouter {
    pub fn new(
        self_silo: SiloAddress,
        config: RouterConfig,
        directory: Arc<GrainDirectory>,
        transport: Arc<dyn RouterTransport>,
    ) -> Self {
        Self {
            self_silo,
            config,
            directory,
            transport,
            callbacks: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            gateway_backoff: DashMap::new(),
        }
    }

    /// Records another busy report for `target` and returns how long to
    /// wait before retrying it, growing exponentially up to
    /// `gateway_backoff_max`.
    fn record_gateway_busy(&self, target: &SiloAddress) -> Duration {
        let mut entry = self.gateway_backoff.entry(target.clone()).or_default();
        entry.consecutive_busy = entry.consecutive_busy.saturating_add(1);
        let exponent = entry.consecutive_busy.min(16) - 1;
        let scaled = self.config.gateway_backoff_initial.as_millis() as f64
            * self.config.gateway_backoff_multiplier.powi(exponent as i32);
        let delay_ms = scaled.min(self.config.gateway_backoff_max.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// A target that answered normally is no longer considered busy.
    fn clear_gateway_backoff(&self, target: &SiloAddress) {
        self.gateway_backoff.remove(target);
    }

    fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId(self.next_correlation.fetch_add(1, Ordering::Relaxed))
    }

    /// `sendRequest(target, invokable, opts) -> pending` (spec.md §4.6).
    pub async fn send_request(&self, mut msg: Message, is_system: bool) -> RuntimeResult<Message> {
        let timeout = if is_system {
            self.config.system_response_timeout
        } else {
            self.config.response_timeout
        };
        msg.header.correlation_id = self.next_correlation_id();
        msg.header.expires_at = Message::expiry_from(SystemTime::now(), timeout);

        let sending_grain = msg
            .header
            .sending_grain
            .clone()
            .ok_or_else(|| RuntimeError::Internal("send_request requires a sending grain".into()))?;
        let key = (sending_grain, msg.header.correlation_id);

        let (tx, rx) = oneshot::channel();
        self.callbacks.insert(
            key.clone(),
            Callback {
                message: msg.clone(),
                completion: tx,
            },
        );

        if let Err(e) = self.dispatch(msg).await {
            self.callbacks.remove(&key);
            return Err(e);
        }

        rx.await
            .map_err(|_| RuntimeError::Internal("callback dropped without completion".into()))?
    }

    /// `sendResponse(request, response)` (spec.md §4.6).
    pub async fn send_response(&self, mut response: Message) -> RuntimeResult<()> {
        if response.is_expired(SystemTime::now()) {
            debug!(correlation_id = response.header.correlation_id.0, "router: response expired before send, dropped");
            return Ok(());
        }
        let target = response
            .header
            .target_silo
            .clone()
            .ok_or_else(|| RuntimeError::Internal("response has no target silo".into()))?;
        response.header.sending_silo = self.self_silo.clone();
        self.transport.send(&target, response).await
    }

    /// Resolve the current target silo and send, expiring at every handoff
    /// point per spec.md §4.6 "Expiration".
    async fn dispatch(&self, mut msg: Message) -> RuntimeResult<()> {
        if msg.is_expired(SystemTime::now()) {
            return Err(RuntimeError::Timeout);
        }
        if msg.header.target_silo.is_none() {
            match self.directory.lookup(&msg.header.target_grain) {
                Ok(Some(addr)) => msg.header.target_silo = Some(addr.silo),
                Ok(None) => return Err(RuntimeError::StaleActivation("no known activation".into())),
                Err(e) => return Err(e),
            }
        }
        let target = msg.header.target_silo.clone().unwrap();
        self.transport.send(&target, msg).await
    }

    /// `receive(msg)` (spec.md §4.6): any arriving message, routed either to
    /// a waiting callback (response/rejection) or to the inbound sink
    /// (request/one-way).
    pub async fn receive(&self, msg: Message, inbound: &dyn InboundSink) -> RuntimeResult<()> {
        if msg.is_expired(SystemTime::now()) {
            if !msg.is_one_way() {
                self.fail_correlated(&msg, RuntimeError::Timeout);
            }
            return Ok(());
        }

        if let Some(kind) = msg.header.rejection.clone() {
            return self.handle_rejection(msg, kind).await;
        }

        let key = (msg.header.target_grain.clone(), msg.header.correlation_id);
        if self.callbacks.contains_key(&key) {
            self.clear_gateway_backoff(&msg.header.sending_silo);
            self.complete(&key, Ok(msg));
            return Ok(());
        }

        inbound.deliver(msg);
        Ok(())
    }

    async fn handle_rejection(&self, msg: Message, kind: RejectionKind) -> RuntimeResult<()> {
        match kind {
            RejectionKind::CacheInvalidation => {
                for stale in &msg.header.cache_invalidation {
                    self.directory.invalidate(&stale.grain);
                }
                Ok(())
            }
            RejectionKind::DuplicateRequest => Ok(()),
            RejectionKind::Transient | RejectionKind::Unrecoverable => self.retry(msg).await,
            RejectionKind::GatewayTooBusy => self.retry_after_gateway_backoff(msg).await,
        }
    }

    /// `GatewayTooBusy` is retryable, but only after waiting out that
    /// target's current backoff (spec.md §4.6 "GatewayTooBusy (retryable
    /// after backoff)"). The backoff grows with each consecutive busy
    /// report and resets the moment the target answers normally again.
    async fn retry_after_gateway_backoff(&self, msg: Message) -> RuntimeResult<()> {
        if let Some(target) = msg.header.target_silo.clone() {
            let delay = self.record_gateway_busy(&target);
            debug!(target = %target, delay_ms = delay.as_millis(), "router: backing off before gateway-too-busy retry");
            tokio::time::sleep(delay).await;
        }
        self.retry(msg).await
    }

    /// `retry(msg)` (spec.md §4.6 "Rejection kinds"). Per spec.md §9 open
    /// question (b), the retry counter is never reset on reroute.
    pub async fn retry(&self, mut msg: Message) -> RuntimeResult<()> {
        msg.header.retry_count += 1;
        if msg.header.retry_count > self.config.max_retries {
            let err = RuntimeError::RetryExhausted(format!(
                "correlation {} exceeded {} retries",
                msg.header.correlation_id.0, self.config.max_retries
            ));
            self.fail_correlated(&msg, err.clone());
            return Err(err);
        }
        msg.header.target_silo = None; // re-address via the directory
        if let Err(e) = self.dispatch(msg.clone()).await {
            self.fail_correlated(&msg, e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// `fail(msg, reason)` (spec.md §4.6).
    pub fn fail(&self, msg: &Message, reason: RuntimeError) {
        self.fail_correlated(msg, reason);
    }

    fn fail_correlated(&self, msg: &Message, reason: RuntimeError) {
        if let Some(sending_grain) = &msg.header.sending_grain {
            self.complete(&(sending_grain.clone(), msg.header.correlation_id), Err(reason));
        }
    }

    fn complete(&self, key: &(GrainId, CorrelationId), result: RuntimeResult<Message>) {
        if let Some((_, cb)) = self.callbacks.remove(key) {
            let _ = cb.completion.send(result);
        } else {
            debug!(grain = %key.0, correlation_id = key.1 .0, "router: completion for unknown or already-resolved correlation id");
        }
    }

    /// Gateway reroute (spec.md §4.6 "Gateway reroute").
    pub fn reroute_gateway_inbound(&self, mut msg: Message, known_backend: Option<SiloAddress>, is_system_target: bool) -> Message {
        if is_system_target {
            msg.header.target_silo = Some(self.self_silo.clone());
        } else if let Some(backend) = known_backend {
            msg.header.target_silo = Some(backend);
        } else {
            msg.header.target_silo = None;
        }
        msg
    }

    /// Periodic pass completing expired callbacks with a timeout failure
    /// (spec.md §4.6 "Timeout sweeper").
    pub async fn sweep_once(&self) {
        let now = SystemTime::now();
        let expired: Vec<(GrainId, CorrelationId)> = self
            .callbacks
            .iter()
            .filter(|entry| entry.value().message.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            warn!(grain = %key.0, correlation_id = key.1 .0, "router: callback timed out");
            self.complete(&key, Err(RuntimeError::Timeout));
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_period.min(Duration::from_secs(1))
    }
}

pub async fn run_timeout_sweeper(router: Arc<MessageRouter>) {
    let mut ticker = tokio::time::interval_at(TokioInstant::now(), router.sweep_interval());
    loop {
        ticker.tick().await;
        router.sweep_once().await;
    }
}
