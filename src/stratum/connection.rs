/// Connection state for one miner TCP session.
///
/// The socket itself lives in the server's per-connection task; this type
/// owns everything else: the outbound write queue, the subscribe/authorize
/// state machine, difficulty state and the vardiff window. All mutable state
/// sits behind one short-lived mutex that is never held across an await.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StratumErrorCode;
use crate::shares::WorkerContext;
use crate::stratum::protocol::{StratumNotification, StratumResponse};
use crate::vardiff::VarDiffContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Accepted, nothing negotiated yet.
    New,
    Subscribed,
    Authorized,
}

pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub worker: WorkerContext,
    pub extranonce1: String,
    pub current_difficulty: f64,
    pub previous_difficulty: Option<f64>,
    pub pending_difficulty: Option<f64>,
    pub vardiff: VarDiffContext,
    pub last_activity: Instant,
}

pub struct StratumConnection {
    id: String,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    /// Cancelled when either side closes the session.
    closed: CancellationToken,
    state: Mutex<ConnectionState>,
}

impl StratumConnection {
    pub fn new(
        id: String,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<String>,
        initial_difficulty: f64,
    ) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
            closed: CancellationToken::new(),
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::New,
                worker: WorkerContext::default(),
                extranonce1: String::new(),
                current_difficulty: initial_difficulty,
                previous_difficulty: None,
                pending_difficulty: None,
                vardiff: VarDiffContext::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Run a closure against the state under the per-connection lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        f(&mut self.lock_state())
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.lock_state().phase
    }

    pub fn current_difficulty(&self) -> f64 {
        self.lock_state().current_difficulty
    }

    pub fn touch(&self) {
        self.lock_state().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock_state().last_activity.elapsed()
    }

    /// JSON-RPC success response.
    pub fn respond(&self, id: Value, result: Value) {
        self.send_line(&StratumResponse::ok(id, result));
    }

    /// JSON-RPC error response, standard code table.
    pub fn respond_error(&self, id: Value, code: StratumErrorCode, message: &str) {
        self.send_line(&StratumResponse::err(id, code, message));
    }

    /// Server-to-client notification (no id).
    pub fn notify(&self, method: &str, params: Value) {
        self.send_line(&StratumNotification::new(method, params));
    }

    /// Idempotent close: wakes the session task, which tears the socket down.
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    /// Store a difficulty to be applied at the next job notify, so a miner
    /// never observes one job with two targets.
    pub fn enqueue_new_difficulty(&self, difficulty: f64) {
        self.lock_state().pending_difficulty = Some(difficulty);
    }

    /// Atomically promote the pending difficulty. True when a change applied.
    pub fn apply_pending_difficulty(&self) -> bool {
        let mut state = self.lock_state();
        match state.pending_difficulty.take() {
            Some(new_difficulty) if new_difficulty != state.current_difficulty => {
                state.previous_difficulty = Some(state.current_difficulty);
                state.current_difficulty = new_difficulty;
                true
            }
            _ => false,
        }
    }

    /// Serialize as a single line; writes are ordered by the outbound queue
    /// so interleaved notify/respond cannot corrupt the wire.
    fn send_line<T: Serialize>(&self, message: &T) {
        let mut line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(conn = %self.id, "outbound serialization failed: {}", e);
                return;
            }
        };
        line.push('\n');
        // A send error means the writer task is gone; the read side will
        // observe the close shortly.
        let _ = self.outbound.send(line);
    }
}
