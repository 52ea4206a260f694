/// A versioned work package plus the share-validation path.
///
/// Validation keeps the generic rules here (time window, duplicate tuples,
/// difficulty quotient, candidate determination) and delegates header and
/// block encoding to the family seam. Jobs are shared as `Arc<Job>` so
/// validators never hold the job lock across hashing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde_json::Value;

use crate::daemon::responses::BlockTemplate;
use crate::error::ShareError;
use crate::family::{u256_to_f64, HashAlgorithm, JobBuilder, Submission};

/// Accepted submission timestamps may deviate this far from the template
/// and wall clock, in seconds.
const MAX_NTIME_DRIFT: i64 = 7200;

#[derive(Debug, Clone)]
pub struct ShareOutcome {
    pub share_difficulty: f64,
    pub is_block_candidate: bool,
    pub block_hash: Option<String>,
    pub block_hex: Option<String>,
    pub coinbase_tx_hash: Option<String>,
}

pub struct Job {
    id: String,
    template: BlockTemplate,
    created: DateTime<Utc>,
    network_target: U256,
    network_difficulty: f64,
    builder: Arc<dyn JobBuilder>,
    hasher: Arc<dyn HashAlgorithm>,
    /// Seen (extranonce1, extranonce2, ntime, nonce) tuples.
    submissions: Mutex<HashSet<Submission>>,
}

impl Job {
    pub fn new(
        id: String,
        template: BlockTemplate,
        builder: Arc<dyn JobBuilder>,
        hasher: Arc<dyn HashAlgorithm>,
    ) -> Self {
        let network_target = builder.network_target(&template);
        let network_difficulty = builder.network_difficulty(&template);
        Self {
            id,
            template,
            created: Utc::now(),
            network_target,
            network_difficulty,
            builder,
            hasher,
            submissions: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn height(&self) -> u64 {
        self.template.height
    }

    pub fn previous_block_hash(&self) -> &str {
        &self.template.previous_block_hash
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    pub fn template(&self) -> &BlockTemplate {
        &self.template
    }

    pub fn notify_params(&self, clean_jobs: bool) -> Value {
        self.builder.notify_params(&self.id, &self.template, clean_jobs)
    }

    /// Records the tuple; false means it was already seen.
    fn register_submission(&self, sub: &Submission) -> bool {
        let mut seen = match self.submissions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(sub.clone())
    }

    /// Validate one submission against this job at the given stratum
    /// difficulty. Hashing runs on the caller's thread; no lock is held
    /// while it does.
    pub fn process_share(
        &self,
        sub: &Submission,
        stratum_difficulty: f64,
        now: DateTime<Utc>,
    ) -> Result<ShareOutcome, ShareError> {
        if !(stratum_difficulty > 0.0) {
            return Err(ShareError::Other("invalid stratum difficulty".into()));
        }

        let ntime = i64::from(
            u32::from_str_radix(&sub.ntime, 16)
                .map_err(|_| ShareError::Other("malformed ntime".into()))?,
        );
        let earliest = self.template.cur_time as i64 - MAX_NTIME_DRIFT;
        let latest = now.timestamp() + MAX_NTIME_DRIFT;
        if ntime < earliest || ntime > latest {
            return Err(ShareError::Other("ntime out of range".into()));
        }

        let header = self.builder.serialize_header(&self.template, sub)?;
        let digest = self.hasher.digest(&header);
        let value = U256::from_little_endian(&digest);

        let share_difficulty = if value.is_zero() {
            f64::INFINITY
        } else {
            u256_to_f64(self.builder.diff1_target()) / u256_to_f64(value)
                * self.builder.share_multiplier()
        };

        if !self.register_submission(sub) {
            return Err(ShareError::DuplicateShare);
        }

        if value <= self.network_target {
            let block_hex = self.builder.serialize_block(&self.template, sub)?;
            return Ok(ShareOutcome {
                share_difficulty,
                is_block_candidate: true,
                block_hash: Some(self.builder.format_block_hash(&digest)),
                block_hex: Some(block_hex),
                coinbase_tx_hash: Some(self.builder.coinbase_tx_hash(&self.template, sub)),
            });
        }

        let ratio = share_difficulty / stratum_difficulty;
        if ratio < 0.99 {
            return Err(ShareError::LowDifficultyShare(share_difficulty));
        }

        Ok(ShareOutcome {
            share_difficulty,
            is_block_candidate: false,
            block_hash: None,
            block_hex: None,
            coinbase_tx_hash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Echoes the 32-byte input, letting tests pick the exact hash value.
    struct EchoHasher;

    impl HashAlgorithm for EchoHasher {
        fn digest(&self, input: &[u8]) -> [u8; 32] {
            let mut out = [0u8; 32];
            out[..input.len().min(32)].copy_from_slice(&input[..input.len().min(32)]);
            out
        }
    }

    /// Header = the little-endian hash value encoded in the nonce field.
    struct StubBuilder;

    impl JobBuilder for StubBuilder {
        fn extranonce2_size(&self) -> usize {
            4
        }

        fn diff1_target(&self) -> U256 {
            U256::from(1u64) << 32
        }

        fn network_target(&self, tpl: &BlockTemplate) -> U256 {
            let bytes = hex::decode(&tpl.target).unwrap_or_default();
            if bytes.len() == 32 {
                U256::from_big_endian(&bytes)
            } else {
                U256::zero()
            }
        }

        fn serialize_header(
            &self,
            _tpl: &BlockTemplate,
            sub: &Submission,
        ) -> Result<Vec<u8>, ShareError> {
            hex::decode(&sub.nonce).map_err(|_| ShareError::Other("bad nonce".into()))
        }

        fn serialize_block(
            &self,
            _tpl: &BlockTemplate,
            _sub: &Submission,
        ) -> Result<String, ShareError> {
            Ok("00".repeat(81))
        }

        fn coinbase_tx_hash(&self, _tpl: &BlockTemplate, _sub: &Submission) -> String {
            "cb".repeat(32)
        }

        fn notify_params(&self, job_id: &str, _tpl: &BlockTemplate, clean: bool) -> Value {
            json!([job_id, clean])
        }
    }

    fn template() -> BlockTemplate {
        serde_json::from_value(json!({
            "version": 1,
            "previousblockhash": "00".repeat(32),
            "height": 800000,
            "bits": "207fffff",
            // Unreachable target by default: candidate tests override it.
            "target": "0000000000000000000000000000000000000000000000000000000000000001",
            "curtime": Utc::now().timestamp() as u64
        }))
        .unwrap()
    }

    fn job() -> Job {
        Job::new(
            "1".into(),
            template(),
            Arc::new(StubBuilder),
            Arc::new(EchoHasher),
        )
    }

    /// Nonce hex whose hash value yields the requested share difficulty
    /// against StubBuilder's diff1 of 2^32.
    fn nonce_for_difficulty(diff: f64) -> String {
        let value = (4294967296.0 / diff) as u128;
        let mut le = [0u8; 32];
        le[..16].copy_from_slice(&value.to_le_bytes());
        hex::encode(le)
    }

    fn submission(diff: f64) -> Submission {
        Submission {
            extranonce1: "00000001".into(),
            extranonce2: "00000002".into(),
            ntime: format!("{:08x}", Utc::now().timestamp()),
            nonce: nonce_for_difficulty(diff),
        }
    }

    #[test]
    fn share_below_99_percent_is_rejected() {
        let job = job();
        let err = job
            .process_share(&submission(8.0), 16.0, Utc::now())
            .unwrap_err();
        assert_eq!(err, ShareError::LowDifficultyShare(8.0));
        assert_eq!(err.to_string(), "low difficulty share (8)");
    }

    #[test]
    fn share_in_tolerance_band_is_accepted() {
        let job = job();
        // 15.9 / 16 = 0.99375, inside [0.99, 1.0).
        let outcome = job
            .process_share(&submission(15.9), 16.0, Utc::now())
            .unwrap();
        assert!(!outcome.is_block_candidate);
        assert!(outcome.share_difficulty < 16.0);
        assert!(outcome.share_difficulty / 16.0 >= 0.99);
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let job = job();
        let sub = submission(32.0);
        job.process_share(&sub, 16.0, Utc::now()).unwrap();
        let err = job.process_share(&sub, 16.0, Utc::now()).unwrap_err();
        assert_eq!(err, ShareError::DuplicateShare);
    }

    #[test]
    fn block_candidate_carries_hash_and_hex() {
        let mut tpl = template();
        // Everything beats an all-ff target.
        tpl.target = "ff".repeat(32);
        let job = Job::new("2".into(), tpl, Arc::new(StubBuilder), Arc::new(EchoHasher));

        let outcome = job.process_share(&submission(1.0), 1.0, Utc::now()).unwrap();
        assert!(outcome.is_block_candidate);
        assert!(outcome.block_hash.is_some());
        assert!(outcome.block_hex.is_some());
        assert!(outcome.coinbase_tx_hash.is_some());
    }

    #[test]
    fn stale_ntime_is_rejected() {
        let job = job();
        let mut sub = submission(32.0);
        sub.ntime = "00000001".into(); // 1970
        let err = job.process_share(&sub, 16.0, Utc::now()).unwrap_err();
        assert_eq!(err, ShareError::Other("ntime out of range".into()));
    }

    #[test]
    fn zero_difficulty_never_validates() {
        let job = job();
        let err = job
            .process_share(&submission(32.0), 0.0, Utc::now())
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid stratum difficulty");
    }
}
