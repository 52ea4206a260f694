/// Core share and chain-state data model.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A validated proof-of-work submission, released to the message bus.
/// The core retains nothing once this leaves `process_submission`.
#[derive(Debug, Clone, Serialize)]
pub struct Share {
    pub pool_id: String,
    pub miner_address: String,
    pub worker: Option<String>,
    pub ip_address: String,
    pub job_id: String,
    /// Stratum difficulty the share was validated against.
    pub difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub is_block_candidate: bool,
    pub block_hash: Option<String>,
    pub block_hex: Option<String>,
    /// Coinbase tx hash once a candidate block was accepted upstream.
    pub transaction_confirmation_data: Option<String>,
    pub created: DateTime<Utc>,
}

/// Snapshot of upstream chain state, owned and refreshed by the job manager.
#[derive(Debug, Clone, Default)]
pub struct BlockchainStats {
    pub block_height: u64,
    pub network_difficulty: f64,
    pub network_hashrate: f64,
    pub connected_peers: u32,
    /// "main" / "test" / "regtest".
    pub network_type: String,
    pub reward_type: String,
    pub last_network_block_time: Option<DateTime<Utc>>,
}

/// Per-connection miner identity, populated by authorize.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    pub authorized: bool,
    pub miner_address: Option<String>,
    pub worker_name: Option<String>,
    pub user_agent: Option<String>,
}

impl WorkerContext {
    /// `wallet.worker`, or just the wallet when no worker name was given.
    pub fn worker_id(&self) -> Option<String> {
        match (&self.miner_address, &self.worker_name) {
            (Some(addr), Some(worker)) => Some(format!("{}.{}", addr, worker)),
            (Some(addr), None) => Some(addr.clone()),
            _ => None,
        }
    }
}
