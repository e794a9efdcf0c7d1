use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accounts::{Account, AccountStore};
use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::pidfile::ProcessLock;
use crate::rate_limiter::RateLimiter;
use crate::status::StatusService;
use crate::supervisor::AccountSupervisor;
use crate::sync::scheduler::{JobType, Scheduler};
use crate::sync::worker::{JobOutcome, SyncWorker};
use crate::telegram::adapter::{GrammersAdapter, TelegramAdapter};
use crate::telegram::RealtimeHandler;

const TICK_MS: u64 = 1_000;
const HEALTH_PROBE_EVERY_N_TICKS: u64 = 10;
const CLEANUP_EVERY_N_TICKS: u64 = 300;
const JOB_METHOD: &str = "messages.getHistory";
const JOB_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;
const RATE_WINDOW_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;
const ACTIVITY_MAX_AGE_DAYS: i64 = 30;

/// An account whose client connected at boot (or on a later reconnect) and therefore
/// has a sync worker bound to it, per spec §4.9's "create one sync worker per connected
/// supervisor".
struct RunningAccount {
    account_id: i64,
    supervisor: Arc<AccountSupervisor>,
    worker: Arc<SyncWorker>,
    adapter: Arc<dyn TelegramAdapter>,
}

/// Reads and validates the MTProto app credentials from the environment, following the
/// teacher's `dotenv` + `env::var` pattern for the bot token in `main.rs`. Spec.md §1
/// assumes the credential format is opaque to this engine; it still has to be loaded
/// from somewhere to hand to `grammers_client`, so this is the one place that decision
/// is made (see DESIGN.md).
fn load_mtproto_credentials() -> Result<(i32, String)> {
    let api_id = std::env::var("TELEGRAM_API_ID")
        .map_err(|_| EngineError::InvalidArgs("TELEGRAM_API_ID is not set".to_string()))?
        .parse::<i32>()
        .map_err(|e| EngineError::InvalidArgs(format!("TELEGRAM_API_ID is not an integer: {e}")))?;
    let api_hash = std::env::var("TELEGRAM_API_HASH")
        .map_err(|_| EngineError::InvalidArgs("TELEGRAM_API_HASH is not set".to_string()))?;
    if api_hash.is_empty() {
        return Err(EngineError::InvalidArgs("TELEGRAM_API_HASH is empty".to_string()));
    }
    Ok((api_id, api_hash))
}

/// Composition root for `daemon start`, per spec §4.9. Owns every long-lived piece:
/// the two SQLite stores, the scheduler/rate-limiter/status services, one supervisor
/// and (for every account that connected) one sync worker, plus the realtime-ingestion
/// tasks spawned alongside them. Grounded on the teacher's `main()`, which wires a
/// comparable set of long-lived services (bot, queue manager, tier orchestrator,
/// health server) before entering its own `tokio::select!` event loop.
pub struct Daemon {
    data_dir: PathBuf,
    config: Config,
    clock: Arc<dyn Clock>,
    cache: Arc<CacheStore>,
    accounts_store: Arc<AccountStore>,
    scheduler: Arc<Scheduler>,
    rate_limiter: Arc<RateLimiter>,
    status: Arc<StatusService>,
    running: Vec<RunningAccount>,
    realtime_tasks: Vec<JoinHandle<()>>,
    pid_lock: ProcessLock,
    shutdown: Arc<AtomicBool>,
    started_at_ms: i64,
}

impl Daemon {
    /// Validates credentials, loads accounts, acquires the PID file, and connects every
    /// account concurrently, per spec §4.9's startup sequence. Returns
    /// `EngineError::NoAccounts` / `AlreadyRunning` / `AllAccountsFailed` exactly where
    /// the spec names them.
    pub async fn bootstrap(data_dir: PathBuf) -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            if !e.to_string().contains("No such file or directory") {
                warn!(error = %e, "failed to load .env file");
            }
        }

        let config = Config::load(&data_dir)?;
        let (api_id, api_hash) = load_mtproto_credentials()?;

        let accounts_store = Arc::new(AccountStore::open(data_dir.join("data.db")).await?);
        let accounts = accounts_store.list().await?;
        if accounts.is_empty() {
            return Err(EngineError::NoAccounts);
        }

        let pid_lock = ProcessLock::acquire(data_dir.join("daemon.pid"))?;

        let cache = Arc::new(CacheStore::open(data_dir.join("cache.db")).await?);
        let scheduler = Arc::new(Scheduler::new(cache.pool.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(cache.pool.clone()));
        let status = Arc::new(StatusService::new(cache.pool.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let shutdown = Arc::new(AtomicBool::new(false));

        let now_ms = clock.now_ms();
        status.set_state("starting").await?;

        let connected = connect_all_accounts(&accounts, &data_dir, api_id, &api_hash, &clock, &accounts_store, &config, &rate_limiter).await;

        let connected_count = connected.iter().filter(|c| c.is_connected).count();
        if connected_count == 0 {
            drop(pid_lock);
            return Err(EngineError::AllAccountsFailed);
        }
        info!(
            connected = connected_count,
            total = accounts.len(),
            "accounts connected"
        );

        let mut running = Vec::new();
        let mut realtime_tasks = Vec::new();
        let realtime_handler = Arc::new(RealtimeHandler::new(cache.clone(), clock.clone()));

        for account in connected {
            if !account.is_connected {
                continue;
            }
            let worker = Arc::new(SyncWorker::new(
                cache.clone(),
                scheduler.clone(),
                rate_limiter.clone(),
                account.adapter.clone(),
                clock.clone(),
            ));
            realtime_tasks.push(spawn_realtime_loop(
                account.account_id,
                account.adapter.clone(),
                account.supervisor.clone(),
                realtime_handler.clone(),
                shutdown.clone(),
                rate_limiter.clone(),
                clock.clone(),
            ));
            running.push(RunningAccount {
                account_id: account.account_id,
                supervisor: account.supervisor,
                worker,
                adapter: account.adapter,
            });
        }

        // No config surface in spec.md exposes a backward-backfill toggle, so startup
        // always enqueues it; see DESIGN.md.
        scheduler
            .initialize_for_startup(&cache.sync_state, true, now_ms)
            .await?;

        status.set_state("running").await?;

        Ok(Self {
            data_dir,
            config,
            clock,
            cache,
            accounts_store,
            scheduler,
            rate_limiter,
            status,
            running,
            realtime_tasks,
            pid_lock,
            shutdown,
            started_at_ms: now_ms,
        })
    }

    /// Runs the 1-second-tick main loop until a shutdown signal arrives, per spec §4.9
    /// steps 1-6, then drains cleanly. Returns the process exit code to use.
    pub async fn run(mut self) -> i32 {
        self.install_signal_handlers();

        let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
        let mut tick: u64 = 0;
        let mut last_dispatch_ms: i64 = 0;

        loop {
            interval.tick().await;

            // Step 1.
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tick += 1;
            let now_ms = self.clock.now_ms();

            // Step 2 + 3: dispatch the next job, respecting the inter-job delay.
            if now_ms - last_dispatch_ms >= self.config.inter_job_delay_ms as i64 {
                match self.dispatch_once(now_ms).await {
                    Ok(true) => last_dispatch_ms = now_ms,
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "dispatch tick failed"),
                }
            }

            // Step 4: health probes + reconnection dispatch every 10th tick.
            if tick % HEALTH_PROBE_EVERY_N_TICKS == 0 {
                self.run_health_and_reconnect().await;
            }

            // Step 5: status heartbeat every tick.
            if let Err(e) = self.update_status(now_ms).await {
                warn!(error = %e, "failed to update daemon status");
            }

            // Step 6: periodic housekeeping every 300th tick.
            if tick % CLEANUP_EVERY_N_TICKS == 0 {
                self.run_cleanup(now_ms).await;
            }
        }

        self.shutdown().await
    }

    /// Installs SIGTERM/SIGINT handlers exactly once, per spec §4.9, flipping
    /// `shutdownRequested` rather than terminating the process directly so the main
    /// loop can drain in-flight work.
    #[cfg(unix)]
    fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    /// One dispatch attempt: claims the next pending job (if any), finds an eligible
    /// supervisor, runs it, and applies the outcome. Returns whether a dispatch
    /// actually happened, so the caller can track the inter-job delay.
    async fn dispatch_once(&self, now_ms: i64) -> Result<bool> {
        let Some(job) = self.scheduler.get_next_job(now_ms).await? else {
            return Ok(false);
        };

        let Some(account) = self.find_eligible_account(now_ms).await else {
            self.scheduler.requeue_pending(job.id).await?;
            return Ok(false);
        };

        let job_id = job.id;
        let chat_id = job.chat_id.clone();
        let job_type = job.job_type;

        let outcome = account.worker.run_job(job).await?;
        self.apply_job_outcome(job_id, &chat_id, job_type, outcome, now_ms).await?;
        Ok(true)
    }

    /// Connected and not currently rate-blocked on the job's one API method, per spec
    /// §4.9's "eligible supervisor (connected, not rate-blocked)".
    async fn find_eligible_account(&self, now_ms: i64) -> Option<&RunningAccount> {
        if self.rate_limiter.is_blocked(JOB_METHOD, now_ms).await.unwrap_or(false) {
            return None;
        }
        for account in &self.running {
            if account.supervisor.state().await == crate::supervisor::SupervisorState::Connected {
                return Some(account);
            }
        }
        None
    }

    async fn apply_job_outcome(
        &self,
        job_id: i64,
        chat_id: &str,
        job_type: JobType,
        outcome: JobOutcome,
        now_ms: i64,
    ) -> Result<()> {
        match outcome {
            JobOutcome::Completed { messages_fetched, has_more } => {
                info!(job_id, chat_id, messages_fetched, has_more, "job completed");
                if has_more {
                    self.enqueue_followup(chat_id, job_type, now_ms).await?;
                }
            }
            JobOutcome::RateLimited { wait_seconds } => {
                warn!(job_id, chat_id, wait_seconds, "job rate limited, returning to pending");
                self.scheduler.requeue_pending(job_id).await?;
            }
            JobOutcome::Failed { error_message } => {
                error!(job_id, chat_id, error_message, "job failed");
            }
        }
        Ok(())
    }

    /// Re-enqueues the same pagination direction at the chat's configured priority, per
    /// spec §4.6 step 8 ("the worker may enqueue a follow-up job").
    async fn enqueue_followup(&self, chat_id: &str, job_type: JobType, now_ms: i64) -> Result<()> {
        let priority = self
            .cache
            .sync_state
            .get(chat_id)
            .await?
            .map(|s| s.sync_priority)
            .unwrap_or(2);

        match job_type {
            JobType::ForwardCatchup | JobType::InitialLoad => {
                self.scheduler
                    .queue_forward_catchup(chat_id, &self.cache.sync_state, priority, now_ms)
                    .await?;
            }
            JobType::BackwardHistory | JobType::FullSync => {
                self.scheduler
                    .queue_backward_history(chat_id, &self.cache.sync_state, priority + 1, now_ms)
                    .await?;
            }
        }
        Ok(())
    }

    /// Health-probes every connected supervisor and drives reconnection on every
    /// erroring one, per spec §4.8/§4.9 step 4.
    async fn run_health_and_reconnect(&self) {
        for account in &self.running {
            account.supervisor.health_probe().await;
            if let Err(e) = account.supervisor.maybe_reconnect().await {
                warn!(account_id = account.account_id, error = %e, "reconnect attempt failed");
            }
        }
    }

    async fn update_status(&self, now_ms: i64) -> Result<()> {
        let mut connected_accounts = 0i64;
        for account in &self.running {
            if account.supervisor.state().await == crate::supervisor::SupervisorState::Connected {
                connected_accounts += 1;
            }
        }
        let messages_synced = self.cache.messages.count().await?;
        let scheduler_status = self.scheduler.get_status().await?;

        self.status
            .update_counters(
                connected_accounts,
                messages_synced,
                scheduler_status.pending_jobs,
                scheduler_status.running_jobs,
                now_ms,
            )
            .await
    }

    /// Every 300th tick: drops stale terminal jobs, expired rate-limit windows and
    /// activity rows, and stale cached peers, per spec §4.9 step 6.
    async fn run_cleanup(&self, now_ms: i64) {
        if let Err(e) = self.scheduler.cleanup(now_ms, JOB_MAX_AGE_MS).await {
            warn!(error = %e, "job cleanup failed");
        }
        if let Err(e) = self.rate_limiter.clear_expired_flood_waits(now_ms).await {
            warn!(error = %e, "flood-wait cleanup failed");
        }
        if let Err(e) = self.rate_limiter.prune_old_windows(now_ms, RATE_WINDOW_MAX_AGE_MS).await {
            warn!(error = %e, "rate window cleanup failed");
        }
        if let Err(e) = self.rate_limiter.prune_old_activity(now_ms, ACTIVITY_MAX_AGE_DAYS).await {
            warn!(error = %e, "activity log cleanup failed");
        }
        if let Err(e) = self
            .cache
            .prune_stale_peers(now_ms, self.config.cache.staleness_peers.0 as i64)
            .await
        {
            warn!(error = %e, "peer cache cleanup failed");
        }
    }

    /// Races cleanup against `shutdownTimeoutMs`, releases the PID file, and reports
    /// the exit code spec §4.9 names for a clean stop.
    async fn shutdown(mut self) -> i32 {
        info!("shutting down");
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);

        let cleanup = async {
            for task in self.realtime_tasks.drain(..) {
                task.abort();
            }
            for account in &self.running {
                let result = crate::rate_limiter::record_adapter_call(
                    &self.rate_limiter,
                    self.clock.as_ref(),
                    "close",
                    Some(&account.account_id.to_string()),
                    account.adapter.close(),
                )
                .await;
                if let Err(e) = result {
                    warn!(account_id = account.account_id, error = %e, "error closing client");
                }
            }
        };

        if tokio::time::timeout(timeout, cleanup).await.is_err() {
            warn!("shutdown timed out before all connections closed");
        }

        if let Err(e) = self.status.set_state("stopped").await {
            warn!(error = %e, "failed to record stopped state");
        }
        self.pid_lock.release();
        0
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }
}

struct ConnectResult {
    account_id: i64,
    adapter: Arc<dyn TelegramAdapter>,
    supervisor: Arc<AccountSupervisor>,
    is_connected: bool,
}

/// Connects every account's MTProto client concurrently, per spec §4.9. Each account
/// gets its own supervisor regardless of whether the initial connect succeeds, so a
/// later reconnect tick can keep retrying it.
async fn connect_all_accounts(
    accounts: &[Account],
    data_dir: &Path,
    api_id: i32,
    api_hash: &str,
    clock: &Arc<dyn Clock>,
    accounts_store: &Arc<AccountStore>,
    config: &Config,
    rate_limiter: &Arc<RateLimiter>,
) -> Vec<ConnectResult> {
    let tasks = accounts.iter().map(|account| {
        let account_id = account.id;
        let session_path = data_dir.join(format!("session_{account_id}.db"));
        let api_hash = api_hash.to_string();
        let clock = clock.clone();
        let accounts_store = accounts_store.clone();
        let reconnect = config.reconnect.clone();
        let rate_limiter = rate_limiter.clone();

        async move {
            let adapter: Arc<dyn TelegramAdapter> =
                match GrammersAdapter::connect(&session_path, api_id, &api_hash).await {
                    Ok(adapter) => Arc::new(adapter),
                    Err(e) => {
                        error!(account_id, error = %e, "failed to construct telegram client, account left unmanaged this run");
                        return None;
                    }
                };

            let supervisor = Arc::new(AccountSupervisor::new(
                account_id,
                adapter.clone(),
                clock.clone(),
                accounts_store.clone(),
                reconnect,
                rate_limiter,
            ));
            let is_connected = supervisor.connect().await.is_ok();

            Some(ConnectResult {
                account_id,
                adapter,
                supervisor,
                is_connected,
            })
        }
    });

    futures::future::join_all(tasks)
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn spawn_realtime_loop(
    account_id: i64,
    adapter: Arc<dyn TelegramAdapter>,
    supervisor: Arc<AccountSupervisor>,
    handler: Arc<RealtimeHandler>,
    shutdown: Arc<AtomicBool>,
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let update = crate::rate_limiter::record_adapter_call(
                &rate_limiter,
                clock.as_ref(),
                "updates.getDifference",
                Some(&account_id.to_string()),
                adapter.next_update(),
            )
            .await;
            match update {
                Ok(Some(update)) => {
                    supervisor.touch_activity();
                    handler.handle(update).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(account_id, error = %e, "realtime update stream error, backing off");
                    supervisor.enter_error().await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    })
}
