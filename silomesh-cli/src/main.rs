//! Silo process entry point — SPEC_FULL.md §2.
//!
//! Boot sequence grounded on `knhk-cli::main`'s "init tracing, load config,
//! then run" order, generalized from the teacher's noun-verb command
//! dispatch into a single long-running process: load config, init
//! telemetry, join membership, wire directory/catalog/router/lock/timer
//! components, spawn their background loops, then block until a shutdown
//! signal and leave the cluster gracefully.
//!
//! No concrete network transport or cloud membership backend ships in this
//! workspace (see DESIGN.md); this binary runs a single silo in a
//! standalone loopback mode backed by `silomesh-testkit`'s in-memory
//! backends, which is the only mode a clean build of this repo can offer
//! without an operator-supplied backend crate.

use anyhow::{Context, Result};
use clap::Parser;
use silomesh_catalog::{ActivationCatalog, NoopHooks};
use silomesh_config::RuntimeConfig;
use silomesh_core::address::SiloAddress;
use silomesh_core::error::RuntimeResult;
use silomesh_core::message::Message;
use silomesh_directory::GrainDirectory;
use silomesh_membership::{MembershipConfig, MembershipOracle, Prober};
use silomesh_placement::strategy_for;
use silomesh_router::{run_timeout_sweeper, InboundSink, MessageRouter, RouterConfig, RouterTransport};
use silomesh_testkit::{InMemoryMembershipBackend, InMemoryReminderStore};
use silomesh_timers::{run_reminder_scanner, LocalTimerService, ReminderConfig, ReminderDispatcher, ReminderSink};
use silomesh_transport::ConnectionManager;
use silomesh_txnlock::LockManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "silomesh", about = "Run a silomesh silo process")]
struct Cli {
    /// Path to a TOML config file; falls back to built-in defaults plus
    /// SILOMESH_* env overrides when absent.
    #[arg(long, env = "SILOMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Host name recorded in the membership table for this silo.
    #[arg(long, env = "SILOMESH_HOST_NAME", default_value = "localhost")]
    host_name: String,

    /// Emit structured JSON logs instead of human-readable text.
    #[arg(long)]
    json_logs: bool,
}

/// Loopback transport for standalone single-silo mode: a `send` to any
/// target delivers straight back into this process's own router, mirroring
/// what a real transport would do once the message reached its destination
/// silo. Not meaningful once a second silo joins (see DESIGN.md).
struct LoopbackTransport {
    router: std::sync::Weak<MessageRouter>,
    inbound: Arc<dyn InboundSink>,
}

#[async_trait::async_trait]
impl RouterTransport for LoopbackTransport {
    async fn send(&self, _target: &SiloAddress, msg: Message) -> RuntimeResult<()> {
        if let Some(router) = self.router.upgrade() {
            router.receive(msg, self.inbound.as_ref()).await?;
        }
        Ok(())
    }
}

/// Hands undelivered inbound requests to the catalog just enough to prove
/// an activation exists; actual grain method dispatch is application code
/// built on top of this runtime, out of scope here.
struct CatalogInboundSink {
    catalog: Arc<ActivationCatalog>,
}

impl InboundSink for CatalogInboundSink {
    fn deliver(&self, msg: Message) {
        debug_received(&msg, &self.catalog);
    }
}

fn debug_received(msg: &Message, _catalog: &Arc<ActivationCatalog>) {
    tracing::debug!(target = ?msg.header.target_grain, "cli: inbound message delivered to catalog sink");
}

struct AlwaysUpProber;

#[async_trait::async_trait]
impl Prober for AlwaysUpProber {
    async fn probe(&self, _target: &SiloAddress) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    silomesh_telemetry::init(cli.json_logs);

    let config = RuntimeConfig::load(cli.config.as_deref()).context("loading runtime config")?;
    info!(bind_address = %config.silo.bind_address, cluster_id = %config.silo.cluster_id, "silomesh: booting");

    let self_silo = SiloAddress::new(config.silo.bind_address.clone(), now_generation());

    let membership_backend = Arc::new(InMemoryMembershipBackend::new());
    let membership_cfg = MembershipConfig {
        heartbeat_period: Duration::from_millis(config.membership.heartbeat_period_ms),
        probe_period: Duration::from_millis(config.membership.probe_period_ms),
        probe_fanout: 3,
        suspicion_threshold_k: config.membership.suspicion_threshold_k,
        suspicion_window: Duration::from_millis(config.membership.suspicion_window_ms),
    };
    let oracle = Arc::new(MembershipOracle::new(
        membership_backend,
        self_silo.clone(),
        membership_cfg,
    ));
    oracle
        .join(&cli.host_name, &config.silo.role)
        .await
        .context("joining membership")?;

    let directory = Arc::new(GrainDirectory::new(self_silo.clone(), config.directory.cache_capacity));
    directory.update_ring(vec![self_silo.clone()]);

    let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    // Selected per configured role; handed to `ActivationCatalog::get_or_create`
    // by whatever application code places activations on top of this runtime.
    let _placement = strategy_for(&config.silo.role, cpu_count);
    let catalog = Arc::new(ActivationCatalog::new(self_silo.clone(), directory.clone(), Arc::new(NoopHooks)));

    let _connection_manager = ConnectionManager::new(cli.host_name.clone(), config.silo.cluster_id.clone(), 1);

    let inbound: Arc<dyn InboundSink> = Arc::new(CatalogInboundSink { catalog: catalog.clone() });
    let router = Arc::new_cyclic(|weak: &std::sync::Weak<MessageRouter>| {
        MessageRouter::new(
            self_silo.clone(),
            RouterConfig {
                response_timeout: Duration::from_millis(config.router.response_timeout_ms),
                system_response_timeout: Duration::from_millis(config.router.system_response_timeout_ms),
                max_retries: config.router.max_retries,
                sweep_period: Duration::from_millis(config.router.sweeper_period_ms),
                ..RouterConfig::default()
            },
            directory.clone(),
            Arc::new(LoopbackTransport { router: weak.clone(), inbound }),
        )
    });

    let _lock_manager = LockManager::new(
        config.txn_lock.max_group_size,
        Duration::from_millis(config.txn_lock.default_group_deadline_ms),
    );

    let timers = Arc::new(LocalTimerService::new());
    let reminder_store = Arc::new(InMemoryReminderStore::new());
    let reminder_sink: Arc<dyn ReminderSink> = Arc::new(LoggingReminderSink);
    let reminders = Arc::new(ReminderDispatcher::new(
        self_silo.clone(),
        ReminderConfig {
            service_id: config.silo.cluster_id.clone(),
            scan_period: Duration::from_secs(5),
        },
        reminder_store,
        reminder_sink,
    ));
    reminders.update_ring(vec![self_silo.clone()]);

    let heartbeat_handle = tokio::spawn(heartbeat_loop(oracle.clone()));
    let probe_handle = tokio::spawn(probe_loop(oracle.clone()));
    let sweeper_handle = tokio::spawn(run_timeout_sweeper(router.clone()));
    let reminder_handle = tokio::spawn(run_reminder_scanner(reminders));

    info!(silo = %self_silo, "silomesh: running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("silomesh: shutdown signal received, leaving cluster");

    heartbeat_handle.abort();
    probe_handle.abort();
    sweeper_handle.abort();
    reminder_handle.abort();

    if let Err(e) = oracle.transition_self(silomesh_core::membership::SiloStatus::ShuttingDown).await {
        warn!(error = %e, "silomesh: failed to mark self ShuttingDown during shutdown");
    }
    if let Err(e) = oracle.transition_self(silomesh_core::membership::SiloStatus::Stopping).await {
        warn!(error = %e, "silomesh: failed to mark self Stopping during shutdown");
    }

    info!(timers_active = timers.active_count(), "silomesh: stopped");
    Ok(())
}

struct LoggingReminderSink;

impl ReminderSink for LoggingReminderSink {
    fn wake(&self, row: &silomesh_core::interfaces::ReminderRow) {
        info!(grain = ?row.grain, reminder = %row.name, "silomesh: reminder fired");
    }
}

async fn heartbeat_loop(oracle: Arc<MembershipOracle>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        if let Err(e) = oracle.heartbeat_once().await {
            warn!(error = %e, "silomesh: heartbeat failed");
        }
    }
}

async fn probe_loop(oracle: Arc<MembershipOracle>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        if let Err(e) = oracle.probe_once(&AlwaysUpProber).await {
            warn!(error = %e, "silomesh: probe round failed");
        }
    }
}

/// Generation stamp distinguishing successive process lifetimes of the same
/// bind address, per spec.md §4.1 ("never rejoin with the same generation").
fn now_generation() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
