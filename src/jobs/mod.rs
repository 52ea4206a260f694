/// Job manager: owns the template-to-job pipeline for one pool.
///
/// Startup gates the daemon (healthy → connected → synced → post-start
/// checks), then a long-running poll task versions jobs off fresh templates
/// and pushes them onto a broadcast stream. Share submissions resolve
/// against the registry under the job lock and candidates go back upstream.

pub mod job;
pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, PoolEvent, TelemetryCategory, TelemetryEvent};
use crate::config::PoolConfig;
use crate::daemon::responses::{
    methods, BlockTemplate, GetBlockResponse, GetBlockchainInfoResponse, GetInfoResponse,
    ERR_METHOD_NOT_FOUND,
};
use crate::daemon::{DaemonClient, DaemonResponse};
use crate::error::{PoolStartupError, ShareError};
use crate::family::{PoolHandler, Submission};
use crate::shares::{BlockchainStats, Share};

use job::Job;
use registry::JobRegistry;

/// Delay between daemon probes during startup.
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// One emission on the job stream.
#[derive(Clone)]
pub struct JobBroadcast {
    pub job: Arc<Job>,
    /// True on a new chain tip: miners must discard in-flight work.
    pub clean_jobs: bool,
}

/// Parsed `mining.submit` params, Bitcoin family shape.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

struct JobState {
    registry: JobRegistry,
    current: Option<Arc<Job>>,
}

pub struct JobManager {
    pool_id: String,
    config: Arc<PoolConfig>,
    daemon: Arc<DaemonClient>,
    handler: Arc<dyn PoolHandler>,
    bus: Arc<MessageBus>,
    /// The job lock: registry mutation and job lookup only, never I/O.
    state: Mutex<JobState>,
    job_counter: AtomicU64,
    jobs_tx: broadcast::Sender<JobBroadcast>,
    stats: RwLock<BlockchainStats>,
    has_submit_block: AtomicBool,
    last_broadcast: Mutex<Instant>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl JobManager {
    pub fn new(
        config: Arc<PoolConfig>,
        daemon: Arc<DaemonClient>,
        handler: Arc<dyn PoolHandler>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let (jobs_tx, _) = broadcast::channel(1);
        let registry = JobRegistry::new(handler.retention_policy());
        Self {
            pool_id: config.id.clone(),
            config,
            daemon,
            handler,
            bus,
            state: Mutex::new(JobState {
                registry,
                current: None,
            }),
            job_counter: AtomicU64::new(0),
            jobs_tx,
            stats: RwLock::new(BlockchainStats::default()),
            has_submit_block: AtomicBool::new(false),
            last_broadcast: Mutex::new(Instant::now()),
        }
    }

    /// Late subscribers get the first emission after subscribing.
    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobBroadcast> {
        self.jobs_tx.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        lock(&self.state).current.clone()
    }

    pub fn stats(&self) -> BlockchainStats {
        match self.stats.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn next_job_id(&self) -> String {
        format!("{:x}", self.job_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Full asynchronous startup: gate on the daemon, run post-start checks,
    /// build the first job and spawn the poll loop. Errors here are fatal to
    /// the pool.
    pub async fn start(self: &Arc<Self>, ct: &CancellationToken) -> Result<(), PoolStartupError> {
        self.wait_daemon_healthy(ct).await?;
        self.wait_daemon_connected(ct).await?;
        self.wait_daemon_synced(ct).await?;
        self.post_start_init(ct).await?;

        if !self.update_job(true, ct).await {
            return Err(PoolStartupError::Daemon(
                "could not build an initial job from the daemon template".into(),
            ));
        }

        let this = Arc::clone(self);
        let ct = ct.clone();
        tokio::spawn(async move { this.run_poll_loop(ct).await });

        tracing::info!(pool = %self.pool_id, "🚀 job manager online");
        Ok(())
    }

    async fn startup_sleep(&self, ct: &CancellationToken) -> Result<(), PoolStartupError> {
        tokio::select! {
            _ = ct.cancelled() => Err(PoolStartupError::Daemon("cancelled during startup".into())),
            _ = tokio::time::sleep(STARTUP_RETRY_DELAY) => Ok(()),
        }
    }

    async fn wait_daemon_healthy(&self, ct: &CancellationToken) -> Result<(), PoolStartupError> {
        loop {
            let responses: Vec<DaemonResponse<GetInfoResponse>> = self
                .daemon
                .execute_all(methods::GET_INFO, json!([]), ct)
                .await;
            if responses.iter().all(|r| r.is_ok()) {
                return Ok(());
            }
            let failing = responses.iter().filter(|r| !r.is_ok()).count();
            tracing::warn!(
                pool = %self.pool_id,
                "waiting for daemons: {}/{} endpoints unhealthy",
                failing,
                responses.len()
            );
            self.startup_sleep(ct).await?;
        }
    }

    async fn wait_daemon_connected(&self, ct: &CancellationToken) -> Result<(), PoolStartupError> {
        loop {
            let responses: Vec<DaemonResponse<GetInfoResponse>> = self
                .daemon
                .execute_all(methods::GET_INFO, json!([]), ct)
                .await;
            let connected = responses
                .iter()
                .filter_map(|r| r.result.as_ref())
                .any(|info| info.connections > 0);
            if connected {
                return Ok(());
            }
            tracing::warn!(pool = %self.pool_id, "daemon reports no peers, waiting");
            self.startup_sleep(ct).await?;
        }
    }

    async fn wait_daemon_synced(&self, ct: &CancellationToken) -> Result<(), PoolStartupError> {
        loop {
            let resp: DaemonResponse<BlockTemplate> = self
                .daemon
                .execute_any(
                    methods::GET_BLOCK_TEMPLATE,
                    self.handler.block_template_params(),
                    ct,
                )
                .await;

            match resp.error {
                None => return Ok(()),
                Some(err) if self.handler.not_synced_error_codes().contains(&err.code) => {
                    self.log_sync_progress(ct).await;
                }
                Some(err) => {
                    tracing::warn!(pool = %self.pool_id, "daemon not ready: {}", err);
                }
            }
            self.startup_sleep(ct).await?;
        }
    }

    async fn log_sync_progress(&self, ct: &CancellationToken) {
        let resp: DaemonResponse<GetBlockchainInfoResponse> = self
            .daemon
            .execute_any(methods::GET_BLOCKCHAIN_INFO, json!([]), ct)
            .await;
        match resp.result {
            Some(info) => tracing::info!(
                pool = %self.pool_id,
                "daemon syncing: height {} ({:.2}%)",
                info.blocks,
                info.verification_progress * 100.0
            ),
            None => tracing::info!(pool = %self.pool_id, "daemon syncing"),
        }
    }

    /// Validate the pool address, detect the chain, probe `submitblock`.
    async fn post_start_init(&self, ct: &CancellationToken) -> Result<(), PoolStartupError> {
        let valid = self
            .handler
            .validate_address(&self.daemon, &self.config.address, ct)
            .await?;
        if !valid {
            return Err(PoolStartupError::InvalidPoolAddress(
                self.config.address.clone(),
            ));
        }

        let resp: DaemonResponse<GetBlockchainInfoResponse> = self
            .daemon
            .execute_any(methods::GET_BLOCKCHAIN_INFO, json!([]), ct)
            .await;
        let info = match (resp.result, resp.error) {
            (Some(info), None) => info,
            (_, Some(err)) => return Err(PoolStartupError::Daemon(err.to_string())),
            _ => return Err(PoolStartupError::Daemon("empty getblockchaininfo".into())),
        };
        let network_type = match info.chain.as_str() {
            "main" | "mainnet" => "main",
            "test" | "testnet" | "testnet4" => "test",
            "regtest" => "regtest",
            other => return Err(PoolStartupError::UnsupportedNetwork(other.to_string())),
        };

        {
            let mut stats = match self.stats.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            stats.network_type = network_type.to_string();
            stats.block_height = info.blocks;
            stats.network_difficulty = info.difficulty;
            stats.reward_type = "POW".to_string();
        }

        // No args: an unsupported daemon answers "method not found", a
        // supported one complains about parameters (code -1).
        let probe: DaemonResponse<Value> = self
            .daemon
            .execute_any(methods::SUBMIT_BLOCK, json!([]), ct)
            .await;
        let has_submit_block = match &probe.error {
            Some(e) if e.code == ERR_METHOD_NOT_FOUND => false,
            Some(e) if e.message.to_lowercase().contains("method not found") => false,
            _ => true,
        };
        self.has_submit_block.store(has_submit_block, Ordering::Relaxed);
        tracing::info!(
            pool = %self.pool_id,
            network = network_type,
            submitblock = has_submit_block,
            "post-start init complete"
        );
        Ok(())
    }

    /// One poll round: fetch a template, maybe version a new job.
    /// Returns whether a new chain tip was detected.
    pub async fn update_job(&self, force: bool, ct: &CancellationToken) -> bool {
        let started = Instant::now();
        let resp: DaemonResponse<BlockTemplate> = self
            .daemon
            .execute_any(
                methods::GET_BLOCK_TEMPLATE,
                self.handler.block_template_params(),
                ct,
            )
            .await;
        self.bus.publish(PoolEvent::Telemetry(TelemetryEvent {
            pool_id: self.pool_id.clone(),
            category: TelemetryCategory::RpcRequest,
            elapsed: started.elapsed(),
            success: resp.is_ok(),
            total: None,
        }));

        match (resp.result, resp.error) {
            (Some(template), None) => self.apply_template(template, force),
            (_, Some(err)) => {
                tracing::warn!(pool = %self.pool_id, "block template refresh failed: {}", err);
                false
            }
            _ => {
                tracing::warn!(pool = %self.pool_id, "daemon returned an empty block template");
                false
            }
        }
    }

    /// Version a job from a template under the job lock and emit it.
    /// Public so tests and embedders can drive the pipeline without a daemon.
    pub fn apply_template(&self, template: BlockTemplate, force: bool) -> bool {
        let broadcast = {
            let mut state = lock(&self.state);
            let is_new = match &state.current {
                None => true,
                Some(current) => {
                    current.previous_block_hash() != template.previous_block_hash
                        || current.height() < template.height
                }
            };
            if !is_new && !force {
                return false;
            }

            let job = Arc::new(Job::new(
                self.next_job_id(),
                template,
                self.handler.job_builder(),
                self.handler.hash_algorithm(),
            ));

            if is_new {
                let mut stats = match self.stats.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                stats.block_height = job.height();
                stats.network_difficulty = job.network_difficulty();
                stats.last_network_block_time = Some(Utc::now());
            }

            state.registry.insert(job.clone(), is_new);
            state.current = Some(job.clone());
            JobBroadcast {
                job,
                clean_jobs: is_new,
            }
        };

        let is_new = broadcast.clean_jobs;
        let job_id = broadcast.job.id().to_string();
        let height = broadcast.job.height();
        *lock(&self.last_broadcast) = Instant::now();
        let _ = self.jobs_tx.send(broadcast);
        self.bus.publish(PoolEvent::JobBroadcast {
            pool_id: self.pool_id.clone(),
            job_id: job_id.clone(),
            clean_jobs: is_new,
        });

        if is_new {
            tracing::info!(pool = %self.pool_id, job = %job_id, height, "📋 new job for new chain tip");
        } else {
            tracing::debug!(pool = %self.pool_id, job = %job_id, height, "job rebroadcast");
        }
        is_new
    }

    async fn run_poll_loop(self: Arc<Self>, ct: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.block_refresh_interval_ms.max(100),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let rebroadcast_after = Duration::from_secs(self.config.job_rebroadcast_timeout_secs.max(1));

        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                _ = interval.tick() => {
                    let is_new = self.update_job(false, &ct).await;
                    // Watchdog: same tip for too long, push fresh transactions.
                    if !is_new && lock(&self.last_broadcast).elapsed() >= rebroadcast_after {
                        self.update_job(true, &ct).await;
                    }
                }
            }
        }
        tracing::debug!(pool = %self.pool_id, "job poll loop stopped");
    }

    /// Resolve and validate one `mining.submit`, publish the result, and
    /// hand candidates to the daemon.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_submission(
        &self,
        miner_address: &str,
        worker_name: Option<&str>,
        ip_address: &str,
        extranonce1: &str,
        params: &SubmitParams,
        stratum_difficulty: f64,
        ct: &CancellationToken,
    ) -> Result<Share, ShareError> {
        let job = lock(&self.state)
            .registry
            .get(&params.job_id)
            .ok_or(ShareError::JobNotFound)?;

        let network_difficulty = job.network_difficulty();
        if network_difficulty <= 0.0 {
            return Err(ShareError::Other("network difficulty unavailable".into()));
        }
        // Under testnet/regtest the chain may be easier than the stratum target.
        let effective_difficulty = stratum_difficulty.min(network_difficulty);

        let sub = Submission {
            extranonce1: extranonce1.to_lowercase(),
            extranonce2: params.extranonce2.to_lowercase(),
            ntime: params.ntime.to_lowercase(),
            nonce: params.nonce.to_lowercase(),
        };

        let started = Instant::now();
        let outcome = job.process_share(&sub, effective_difficulty, Utc::now());
        self.bus.publish(PoolEvent::Telemetry(TelemetryEvent {
            pool_id: self.pool_id.clone(),
            category: TelemetryCategory::ShareValidation,
            elapsed: started.elapsed(),
            success: outcome.is_ok(),
            total: None,
        }));
        let outcome = outcome?;

        let mut share = Share {
            pool_id: self.pool_id.clone(),
            miner_address: miner_address.to_string(),
            worker: worker_name.map(|s| s.to_string()),
            ip_address: ip_address.to_string(),
            job_id: params.job_id.clone(),
            difficulty: effective_difficulty,
            network_difficulty,
            block_height: job.height(),
            is_block_candidate: outcome.is_block_candidate,
            block_hash: outcome.block_hash,
            block_hex: outcome.block_hex,
            transaction_confirmation_data: None,
            created: Utc::now(),
        };

        if share.is_block_candidate {
            tracing::info!(
                pool = %self.pool_id,
                height = share.block_height,
                hash = share.block_hash.as_deref().unwrap_or(""),
                "🎉 block candidate from {}", miner_address
            );
            let (accepted, coinbase_tx) = self
                .submit_block(
                    share.block_hex.as_deref().unwrap_or(""),
                    share.block_hash.as_deref().unwrap_or(""),
                    ct,
                )
                .await;
            if accepted {
                share.transaction_confirmation_data =
                    coinbase_tx.or(outcome.coinbase_tx_hash);
                self.bus.publish(PoolEvent::BlockFound {
                    pool_id: self.pool_id.clone(),
                    block_height: share.block_height,
                    block_hash: share.block_hash.clone().unwrap_or_default(),
                });
            } else {
                tracing::warn!(
                    pool = %self.pool_id,
                    height = share.block_height,
                    "daemon rejected block candidate"
                );
                share.is_block_candidate = false;
                share.transaction_confirmation_data = None;
            }
        }

        self.bus.publish(PoolEvent::ClientShare {
            pool_id: self.pool_id.clone(),
            share: share.clone(),
        });
        Ok(share)
    }

    /// Submit a candidate and confirm acceptance independently via
    /// `getblock`. Returns (accepted, coinbase tx hash).
    async fn submit_block(
        &self,
        block_hex: &str,
        block_hash: &str,
        ct: &CancellationToken,
    ) -> (bool, Option<String>) {
        let started = Instant::now();
        let resp: DaemonResponse<Value> = if self.has_submit_block.load(Ordering::Relaxed) {
            self.daemon
                .execute_any(methods::SUBMIT_BLOCK, json!([block_hex]), ct)
                .await
        } else {
            self.daemon
                .execute_any(
                    methods::GET_BLOCK_TEMPLATE,
                    json!([{ "mode": "submit", "data": block_hex }]),
                    ct,
                )
                .await
        };

        if let Some(err) = &resp.error {
            tracing::warn!(pool = %self.pool_id, "block submission error: {}", err);
        } else if let Some(Value::String(reason)) = &resp.result {
            if !reason.is_empty() {
                tracing::warn!(pool = %self.pool_id, "daemon rejected block: {}", reason);
            }
        }

        let check: DaemonResponse<GetBlockResponse> = self
            .daemon
            .execute_any(methods::GET_BLOCK, json!([block_hash]), ct)
            .await;
        let accepted = matches!(
            &check.result,
            Some(block) if block.hash.eq_ignore_ascii_case(block_hash)
        );
        self.bus.publish(PoolEvent::Telemetry(TelemetryEvent {
            pool_id: self.pool_id.clone(),
            category: TelemetryCategory::BlockSubmission,
            elapsed: started.elapsed(),
            success: accepted,
            total: None,
        }));

        let coinbase_tx = check
            .result
            .and_then(|block| block.tx.into_iter().next());
        (accepted, coinbase_tx)
    }
}
