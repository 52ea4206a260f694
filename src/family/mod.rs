/// Coin-family seams.
///
/// The core never hashes or assembles coin-specific bytes itself: a family
/// plugs in a `HashAlgorithm` (digest), a `JobBuilder` (header/block/coinbase
/// encoding and notify shape) and a `PoolHandler` (addresses, policy,
/// authorization). One family implementation ships in-repo: `sha256d`.

pub mod sha256d;

use std::sync::Arc;

use async_trait::async_trait;
use primitive_types::U256;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::daemon::responses::BlockTemplate;
use crate::daemon::DaemonClient;
use crate::error::{PoolStartupError, ShareError};
use crate::jobs::registry::RetentionPolicy;

/// A fully-resolved share submission, ready for validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Submission {
    pub extranonce1: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// 32-byte proof-of-work digest over an opaque input blob.
pub trait HashAlgorithm: Send + Sync {
    fn digest(&self, input: &[u8]) -> [u8; 32];
}

/// Coin-specific job construction and encoding.
pub trait JobBuilder: Send + Sync {
    fn extranonce2_size(&self) -> usize;

    /// Difficulty-1 target of the family.
    fn diff1_target(&self) -> U256;

    /// Normalization factor applied to the raw difficulty quotient.
    fn share_multiplier(&self) -> f64 {
        1.0
    }

    fn network_target(&self, tpl: &BlockTemplate) -> U256;

    fn network_difficulty(&self, tpl: &BlockTemplate) -> f64 {
        let target = self.network_target(tpl);
        if target.is_zero() {
            return 0.0;
        }
        u256_to_f64(self.diff1_target()) / u256_to_f64(target)
    }

    /// Header bytes for hashing a submission against this template.
    fn serialize_header(
        &self,
        tpl: &BlockTemplate,
        sub: &Submission,
    ) -> Result<Vec<u8>, ShareError>;

    /// Full block hex for `submitblock`.
    fn serialize_block(
        &self,
        tpl: &BlockTemplate,
        sub: &Submission,
    ) -> Result<String, ShareError>;

    /// Hash of the coinbase transaction a submission produces, retained as
    /// the pool's proof-of-payout.
    fn coinbase_tx_hash(&self, tpl: &BlockTemplate, sub: &Submission) -> String;

    /// Display encoding of a header digest (big-endian hex by default).
    fn format_block_hash(&self, digest: &[u8; 32]) -> String {
        let mut be = *digest;
        be.reverse();
        hex::encode(be)
    }

    /// Params array for `mining.notify`.
    fn notify_params(&self, job_id: &str, tpl: &BlockTemplate, clean_jobs: bool) -> Value;
}

/// Family-level pool behavior: the tagged abstraction the pool is
/// parameterized on at construction.
#[async_trait]
pub trait PoolHandler: Send + Sync {
    fn job_builder(&self) -> Arc<dyn JobBuilder>;

    fn hash_algorithm(&self) -> Arc<dyn HashAlgorithm>;

    fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::ClearOnNewTip
    }

    /// Params for `getblocktemplate`.
    fn block_template_params(&self) -> Value {
        json!([{ "rules": ["segwit"] }])
    }

    /// Daemon error codes meaning "still syncing".
    fn not_synced_error_codes(&self) -> &'static [i64] {
        &[-10]
    }

    async fn validate_address(
        &self,
        daemon: &DaemonClient,
        address: &str,
        ct: &CancellationToken,
    ) -> Result<bool, PoolStartupError>;

    async fn authorize_worker(&self, username: &str, _password: &str) -> bool {
        !username.is_empty()
    }

    fn format_amount(&self, atomic: u64) -> String;
}

/// Lossy conversion for difficulty quotients. Exact up to 2^128, then the
/// top 128 bits are scaled, which is far beyond f64 precision anyway.
pub fn u256_to_f64(v: U256) -> f64 {
    let bits = v.bits();
    if bits <= 128 {
        return v.low_u128() as f64;
    }
    let shift = bits - 128;
    let top = (v >> shift).low_u128() as f64;
    top * 2f64.powi(shift as i32)
}
