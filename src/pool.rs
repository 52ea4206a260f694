/// Pool glue: routes stratum requests into the job manager, fans job
/// broadcasts out to connections, applies queued difficulty changes at
/// notify boundaries and evicts zombie workers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::banning::BanManager;
use crate::bus::MessageBus;
use crate::config::PoolConfig;
use crate::daemon::DaemonClient;
use crate::error::StratumErrorCode;
use crate::family::PoolHandler;
use crate::jobs::{JobBroadcast, JobManager, SubmitParams};
use crate::stratum::connection::{ConnectionPhase, StratumConnection};
use crate::stratum::protocol::{methods, StratumRequest};
use crate::stratum::server::{RequestHandler, StratumServer, TimestampedRequest};

pub struct Pool {
    config: Arc<PoolConfig>,
    server: Arc<StratumServer>,
    jobs: Arc<JobManager>,
    handler: Arc<dyn PoolHandler>,
    bus: Arc<MessageBus>,
    extranonce_counter: AtomicU32,
    shutdown: OnceLock<CancellationToken>,
}

impl Pool {
    pub fn new(
        config: Arc<PoolConfig>,
        daemon: Arc<DaemonClient>,
        handler: Arc<dyn PoolHandler>,
        bus: Arc<MessageBus>,
    ) -> Arc<Self> {
        let bans = Arc::new(BanManager::new());
        let server = Arc::new(StratumServer::new(Arc::clone(&config), bans));
        let jobs = Arc::new(JobManager::new(
            Arc::clone(&config),
            daemon,
            Arc::clone(&handler),
            Arc::clone(&bus),
        ));
        Arc::new(Self {
            config,
            server,
            jobs,
            handler,
            bus,
            extranonce_counter: AtomicU32::new(0),
            shutdown: OnceLock::new(),
        })
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn server(&self) -> &Arc<StratumServer> {
        &self.server
    }

    /// Full bring-up: daemon gates first (fatal on failure), then serve.
    pub async fn run(self: &Arc<Self>, ct: CancellationToken) -> anyhow::Result<()> {
        self.jobs.start(&ct).await?;
        self.serve(ct).await
    }

    /// Start the stratum server, the job fan-out and the vardiff idle pass.
    /// Jobs must be driven into the manager by `run` or by the embedder.
    pub async fn serve(self: &Arc<Self>, ct: CancellationToken) -> anyhow::Result<()> {
        let _ = self.shutdown.set(ct.clone());

        let pool = Arc::clone(self);
        let fanout_ct = ct.clone();
        tokio::spawn(async move { pool.run_job_fanout(fanout_ct).await });

        let pool = Arc::clone(self);
        let vardiff_ct = ct.clone();
        tokio::spawn(async move { pool.run_vardiff_idle_pass(vardiff_ct).await });

        let handler: Arc<dyn RequestHandler> = Arc::clone(self) as Arc<dyn RequestHandler>;
        Arc::clone(&self.server).run(handler, ct).await
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.get().cloned().unwrap_or_default()
    }

    async fn run_job_fanout(self: Arc<Self>, ct: CancellationToken) {
        let mut jobs_rx = self.jobs.subscribe_jobs();
        loop {
            let received = tokio::select! {
                _ = ct.cancelled() => break,
                received = jobs_rx.recv() => received,
            };
            match received {
                Ok(broadcast) => self.broadcast_job(&broadcast).await,
                // Latest-wins stream; skipping straight to the newest job
                // is exactly what a lagging fan-out should do.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn broadcast_job(&self, broadcast: &JobBroadcast) {
        let idle_timeout = self.config.client_connection_timeout_secs;
        let params = broadcast.job.notify_params(broadcast.clean_jobs);

        self.server
            .for_each_connection(|conn| {
                if conn.phase() == ConnectionPhase::New {
                    return;
                }
                if idle_timeout > 0 && conn.idle_for() > Duration::from_secs(idle_timeout) {
                    tracing::info!(
                        conn = %conn.id(),
                        "booting zombie worker {} (idle)", conn.remote_addr()
                    );
                    conn.disconnect();
                    return;
                }
                if conn.apply_pending_difficulty() {
                    conn.notify(
                        methods::SET_DIFFICULTY,
                        json!([conn.current_difficulty()]),
                    );
                }
                conn.notify(methods::NOTIFY, params.clone());
            })
            .await;
    }

    /// Periodic vardiff pass so idle miners drift back toward min_diff.
    async fn run_vardiff_idle_pass(self: Arc<Self>, ct: CancellationToken) {
        let period = Duration::from_secs_f64(self.config.vardiff.retarget_time.max(1.0));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                _ = interval.tick() => {}
            }
            let network_difficulty = self.jobs.stats().network_difficulty;
            let options = &self.config.vardiff;
            self.server
                .for_each_connection(|conn| {
                    let retarget = conn.with_state(|state| {
                        if state.phase != ConnectionPhase::Authorized {
                            return None;
                        }
                        state.vardiff.update(
                            Instant::now(),
                            state.current_difficulty,
                            options,
                            network_difficulty,
                            false,
                        )
                    });
                    if let Some(new_difficulty) = retarget {
                        conn.enqueue_new_difficulty(new_difficulty);
                    }
                })
                .await;
        }
    }

    fn mint_extranonce1(&self) -> String {
        format!(
            "{:08x}",
            self.extranonce_counter.fetch_add(1, Ordering::Relaxed) + 1
        )
    }

    async fn on_subscribe(&self, conn: &Arc<StratumConnection>, request: StratumRequest) {
        let user_agent = request
            .params
            .as_array()
            .and_then(|p| p.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let extranonce1 = conn.with_state(|state| {
            if state.extranonce1.is_empty() {
                state.extranonce1 = self.mint_extranonce1();
            }
            if state.phase == ConnectionPhase::New {
                state.phase = ConnectionPhase::Subscribed;
            }
            state.worker.user_agent = user_agent.clone();
            state.extranonce1.clone()
        });

        let extranonce2_size = self.handler.job_builder().extranonce2_size();
        conn.respond(
            request.id,
            json!([
                [
                    [methods::SET_DIFFICULTY, &extranonce1],
                    [methods::NOTIFY, &extranonce1]
                ],
                &extranonce1,
                extranonce2_size,
            ]),
        );

        // Hand out the current target and job immediately; a subscriber
        // without work is a wasted connection.
        conn.notify(
            methods::SET_DIFFICULTY,
            json!([conn.current_difficulty()]),
        );
        if let Some(job) = self.jobs.current_job() {
            conn.notify(methods::NOTIFY, job.notify_params(true));
        }
    }

    async fn on_authorize(&self, conn: &Arc<StratumConnection>, request: StratumRequest) {
        let params = request.params.as_array().cloned().unwrap_or_default();
        let username = params
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let password = params
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let authorized = self.handler.authorize_worker(&username, &password).await;
        if authorized {
            let (address, worker_name) = match username.split_once('.') {
                Some((address, worker)) => (address.to_string(), Some(worker.to_string())),
                None => (username.clone(), None),
            };
            conn.with_state(|state| {
                state.worker.authorized = true;
                state.worker.miner_address = Some(address);
                state.worker.worker_name = worker_name;
                if state.phase == ConnectionPhase::Subscribed {
                    state.phase = ConnectionPhase::Authorized;
                }
            });
            tracing::debug!(conn = %conn.id(), worker = %username, "worker authorized");
        } else {
            tracing::warn!(conn = %conn.id(), worker = %username, "authorization refused");
        }
        conn.respond(request.id, json!(authorized));
    }

    async fn on_submit(&self, conn: &Arc<StratumConnection>, request: StratumRequest) {
        let (phase, authorized, extranonce1, difficulty, miner_address, worker_name) = conn
            .with_state(|state| {
                (
                    state.phase,
                    state.worker.authorized,
                    state.extranonce1.clone(),
                    state.current_difficulty,
                    state.worker.miner_address.clone(),
                    state.worker.worker_name.clone(),
                )
            });

        if phase == ConnectionPhase::New {
            conn.respond_error(request.id, StratumErrorCode::NotSubscribed, "not subscribed");
            return;
        }
        if !authorized {
            conn.respond_error(
                request.id,
                StratumErrorCode::UnauthorizedWorker,
                "unauthorized worker",
            );
            return;
        }

        let params = match parse_submit_params(&request.params) {
            Some(params) => params,
            None => {
                conn.respond_error(request.id, StratumErrorCode::Other, "invalid submit params");
                return;
            }
        };

        let miner_address = miner_address.unwrap_or_else(|| {
            params
                .worker
                .split_once('.')
                .map(|(address, _)| address.to_string())
                .unwrap_or_else(|| params.worker.clone())
        });

        let ct = self.shutdown_token();
        let result = self
            .jobs
            .process_submission(
                &miner_address,
                worker_name.as_deref(),
                &conn.remote_addr().ip().to_string(),
                &extranonce1,
                &params,
                difficulty,
                &ct,
            )
            .await;

        match result {
            Ok(share) => {
                tracing::debug!(
                    conn = %conn.id(),
                    worker = %share.worker.as_deref().unwrap_or(&miner_address),
                    difficulty = share.difficulty,
                    "share accepted"
                );
                conn.respond(request.id, json!(true));
            }
            Err(err) => {
                tracing::debug!(conn = %conn.id(), "share rejected: {}", err);
                conn.respond_error(request.id, err.stratum_code(), &err.to_string());
            }
        }

        // Retarget window sees every submission, accepted or not.
        let network_difficulty = self.jobs.stats().network_difficulty;
        let retarget = conn.with_state(|state| {
            state.vardiff.update(
                Instant::now(),
                state.current_difficulty,
                &self.config.vardiff,
                network_difficulty,
                true,
            )
        });
        if let Some(new_difficulty) = retarget {
            tracing::debug!(
                conn = %conn.id(),
                from = difficulty,
                to = new_difficulty,
                "vardiff retarget queued"
            );
            conn.enqueue_new_difficulty(new_difficulty);
        }
    }
}

fn parse_submit_params(params: &Value) -> Option<SubmitParams> {
    let arr = params.as_array()?;
    let field = |i: usize| arr.get(i)?.as_str().map(|s| s.to_string());
    Some(SubmitParams {
        worker: field(0)?,
        job_id: field(1)?,
        extranonce2: field(2)?,
        ntime: field(3)?,
        nonce: field(4)?,
    })
}

#[async_trait]
impl RequestHandler for Pool {
    async fn on_request(&self, conn: &Arc<StratumConnection>, request: TimestampedRequest) {
        let request = request.request;
        match request.method.as_str() {
            methods::SUBSCRIBE => self.on_subscribe(conn, request).await,
            methods::AUTHORIZE => self.on_authorize(conn, request).await,
            methods::SUBMIT => self.on_submit(conn, request).await,
            methods::EXTRANONCE_SUBSCRIBE => conn.respond(request.id, json!(true)),
            other => {
                tracing::debug!(conn = %conn.id(), method = other, "unsupported method");
                conn.respond_error(request.id, StratumErrorCode::Other, "Unsupported method");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_params_parse() {
        let params = json!(["wallet.rig", "1f", "00000001", "64b8ca00", "deadbeef"]);
        let parsed = parse_submit_params(&params).unwrap();
        assert_eq!(parsed.worker, "wallet.rig");
        assert_eq!(parsed.job_id, "1f");
        assert_eq!(parsed.nonce, "deadbeef");
    }

    #[test]
    fn submit_params_reject_short_arrays() {
        assert!(parse_submit_params(&json!(["a", "b"])).is_none());
        assert!(parse_submit_params(&json!("not an array")).is_none());
        assert!(parse_submit_params(&json!(["a", "b", "c", "d", 5])).is_none());
    }
}
