/// SHA256d (Bitcoin-family) reference implementation of the family seams.
///
/// Coinbase layout: a single input whose script sig is
/// `[height push][extranonce1 ++ extranonce2 push]`, one output paying the
/// configured script. `cb1`/`cb2` split around the extranonce bytes so
/// miners iterate extranonce2 client-side.

use std::sync::Arc;

use async_trait::async_trait;
use primitive_types::U256;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{HashAlgorithm, JobBuilder, PoolHandler, Submission};
use crate::daemon::responses::{methods, BlockTemplate, ValidateAddressResponse};
use crate::daemon::DaemonClient;
use crate::error::{PoolStartupError, ShareError};

pub const EXTRANONCE1_SIZE: usize = 4;
pub const EXTRANONCE2_SIZE: usize = 4;

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

pub struct Sha256dAlgorithm;

impl HashAlgorithm for Sha256dAlgorithm {
    fn digest(&self, input: &[u8]) -> [u8; 32] {
        sha256d(input)
    }
}

pub struct Sha256dJobBuilder {
    /// scriptPubKey the coinbase output pays to.
    pool_script: Vec<u8>,
}

impl Sha256dJobBuilder {
    pub fn new(pool_script_hex: &str) -> anyhow::Result<Self> {
        let pool_script = hex::decode(pool_script_hex)
            .map_err(|e| anyhow::anyhow!("invalid pool script hex: {}", e))?;
        Ok(Self { pool_script })
    }

    /// BIP34 height push: minimal little-endian integer behind a length byte.
    fn height_script(height: u64) -> Vec<u8> {
        let mut le = height.to_le_bytes().to_vec();
        while le.len() > 1 && le[le.len() - 1] == 0 {
            le.pop();
        }
        // Keep the number positive.
        if le[le.len() - 1] & 0x80 != 0 {
            le.push(0);
        }
        let mut out = Vec::with_capacity(1 + le.len());
        out.push(le.len() as u8);
        out.extend_from_slice(&le);
        out
    }

    /// Coinbase split around the extranonce bytes.
    fn coinbase_parts(&self, tpl: &BlockTemplate) -> (Vec<u8>, Vec<u8>) {
        let height_push = Self::height_script(tpl.height);
        let extranonce_len = EXTRANONCE1_SIZE + EXTRANONCE2_SIZE;
        let script_len = height_push.len() + 1 + extranonce_len;

        let mut cb1 = Vec::with_capacity(64 + height_push.len());
        cb1.extend_from_slice(&1u32.to_le_bytes()); // tx version
        cb1.push(0x01); // input count
        cb1.extend_from_slice(&[0u8; 32]); // null prevout hash
        cb1.extend_from_slice(&[0xff; 4]); // prevout index
        cb1.push(script_len as u8);
        cb1.extend_from_slice(&height_push);
        cb1.push(extranonce_len as u8); // extranonce push opcode

        let mut cb2 = Vec::with_capacity(16 + self.pool_script.len());
        cb2.extend_from_slice(&[0xff; 4]); // sequence
        cb2.push(0x01); // output count
        cb2.extend_from_slice(&tpl.coinbase_value.to_le_bytes());
        cb2.push(self.pool_script.len() as u8);
        cb2.extend_from_slice(&self.pool_script);
        cb2.extend_from_slice(&0u32.to_le_bytes()); // lock time

        (cb1, cb2)
    }

    fn build_coinbase(&self, tpl: &BlockTemplate, sub: &Submission) -> Result<Vec<u8>, ShareError> {
        let en1 = decode_fixed(&sub.extranonce1, EXTRANONCE1_SIZE, "extranonce1")?;
        let en2 = decode_fixed(&sub.extranonce2, EXTRANONCE2_SIZE, "extranonce2")?;
        let (cb1, cb2) = self.coinbase_parts(tpl);
        let mut cb = Vec::with_capacity(cb1.len() + en1.len() + en2.len() + cb2.len());
        cb.extend_from_slice(&cb1);
        cb.extend_from_slice(&en1);
        cb.extend_from_slice(&en2);
        cb.extend_from_slice(&cb2);
        Ok(cb)
    }

    /// Internal-order txids of the non-coinbase template transactions.
    fn tx_hashes(tpl: &BlockTemplate) -> Vec<[u8; 32]> {
        tpl.transactions
            .iter()
            .filter_map(|tx| {
                let id = tx.txid.as_deref().or(tx.hash.as_deref())?;
                let bytes = hex::decode(id).ok()?;
                if bytes.len() != 32 {
                    return None;
                }
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                h.reverse(); // display hex is big-endian
                Some(h)
            })
            .collect()
    }

    /// Merkle steps for the coinbase slot: at each level the sibling the
    /// miner folds the coinbase hash against.
    fn merkle_branch(mut hashes: Vec<[u8; 32]>) -> Vec<[u8; 32]> {
        let mut steps = Vec::new();
        while !hashes.is_empty() {
            steps.push(hashes[0]);
            if hashes.len() == 1 {
                break;
            }
            let rest = &hashes[1..];
            let mut next = Vec::with_capacity((rest.len() + 1) / 2);
            let mut i = 0;
            while i < rest.len() {
                let a = rest[i];
                let b = if i + 1 < rest.len() { rest[i + 1] } else { rest[i] };
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&a);
                buf[32..].copy_from_slice(&b);
                next.push(sha256d(&buf));
                i += 2;
            }
            hashes = next;
        }
        steps
    }

    fn merkle_root(coinbase_hash: [u8; 32], steps: &[[u8; 32]]) -> [u8; 32] {
        let mut root = coinbase_hash;
        for step in steps {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&root);
            buf[32..].copy_from_slice(step);
            root = sha256d(&buf);
        }
        root
    }

    fn prev_hash_internal(tpl: &BlockTemplate) -> Result<[u8; 32], ShareError> {
        let bytes = hex::decode(&tpl.previous_block_hash)
            .map_err(|_| ShareError::Other("malformed previous block hash".into()))?;
        if bytes.len() != 32 {
            return Err(ShareError::Other("malformed previous block hash".into()));
        }
        let mut h = [0u8; 32];
        h.copy_from_slice(&bytes);
        h.reverse();
        Ok(h)
    }

    /// Stratum notify encoding of the previous hash: little-endian overall
    /// with each 4-byte word flipped back to big-endian.
    fn prev_hash_stratum(tpl: &BlockTemplate) -> Result<String, ShareError> {
        let mut le = Self::prev_hash_internal(tpl)?;
        for chunk in le.chunks_mut(4) {
            chunk.reverse();
        }
        Ok(hex::encode(le))
    }

    fn target_from_compact(bits_hex: &str) -> Option<U256> {
        let bits = u32::from_str_radix(bits_hex.trim(), 16).ok()?;
        let exponent = (bits >> 24) as usize;
        let mantissa = U256::from(bits & 0x007f_ffff);
        if exponent <= 3 {
            Some(mantissa >> (8 * (3 - exponent)))
        } else {
            Some(mantissa << (8 * (exponent - 3)))
        }
    }

    fn varint(n: u64) -> Vec<u8> {
        match n {
            0..=0xfc => vec![n as u8],
            0xfd..=0xffff => {
                let mut v = vec![0xfd];
                v.extend_from_slice(&(n as u16).to_le_bytes());
                v
            }
            _ => {
                let mut v = vec![0xfe];
                v.extend_from_slice(&(n as u32).to_le_bytes());
                v
            }
        }
    }
}

fn decode_fixed(hex_str: &str, len: usize, what: &str) -> Result<Vec<u8>, ShareError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| ShareError::Other(format!("malformed {}", what)))?;
    if bytes.len() != len {
        return Err(ShareError::Other(format!("malformed {}", what)));
    }
    Ok(bytes)
}

fn decode_u32_be(hex_str: &str, what: &str) -> Result<u32, ShareError> {
    u32::from_str_radix(hex_str, 16).map_err(|_| ShareError::Other(format!("malformed {}", what)))
}

impl JobBuilder for Sha256dJobBuilder {
    fn extranonce2_size(&self) -> usize {
        EXTRANONCE2_SIZE
    }

    fn diff1_target(&self) -> U256 {
        U256::from(0xffffu64) << 208
    }

    fn network_target(&self, tpl: &BlockTemplate) -> U256 {
        if !tpl.target.is_empty() {
            if let Ok(bytes) = hex::decode(&tpl.target) {
                if bytes.len() == 32 {
                    return U256::from_big_endian(&bytes);
                }
            }
        }
        Self::target_from_compact(&tpl.bits).unwrap_or_else(U256::zero)
    }

    fn serialize_header(
        &self,
        tpl: &BlockTemplate,
        sub: &Submission,
    ) -> Result<Vec<u8>, ShareError> {
        let coinbase = self.build_coinbase(tpl, sub)?;
        let coinbase_hash = sha256d(&coinbase);
        let branch = Self::merkle_branch(Self::tx_hashes(tpl));
        let merkle_root = Self::merkle_root(coinbase_hash, &branch);

        let ntime = decode_u32_be(&sub.ntime, "ntime")?;
        let nonce = decode_u32_be(&sub.nonce, "nonce")?;
        let bits = decode_u32_be(&tpl.bits, "bits")?;

        let mut header = Vec::with_capacity(80);
        header.extend_from_slice(&tpl.version.to_le_bytes());
        header.extend_from_slice(&Self::prev_hash_internal(tpl)?);
        header.extend_from_slice(&merkle_root);
        header.extend_from_slice(&ntime.to_le_bytes());
        header.extend_from_slice(&bits.to_le_bytes());
        header.extend_from_slice(&nonce.to_le_bytes());
        Ok(header)
    }

    fn serialize_block(
        &self,
        tpl: &BlockTemplate,
        sub: &Submission,
    ) -> Result<String, ShareError> {
        let header = self.serialize_header(tpl, sub)?;
        let coinbase = self.build_coinbase(tpl, sub)?;

        let mut block = header;
        block.extend_from_slice(&Self::varint(tpl.transactions.len() as u64 + 1));
        block.extend_from_slice(&coinbase);
        for tx in &tpl.transactions {
            let data = hex::decode(&tx.data)
                .map_err(|_| ShareError::Other("malformed template transaction".into()))?;
            block.extend_from_slice(&data);
        }
        Ok(hex::encode(block))
    }

    fn coinbase_tx_hash(&self, tpl: &BlockTemplate, sub: &Submission) -> String {
        match self.build_coinbase(tpl, sub) {
            Ok(cb) => {
                let mut digest = sha256d(&cb);
                digest.reverse();
                hex::encode(digest)
            }
            Err(_) => String::new(),
        }
    }

    fn notify_params(&self, job_id: &str, tpl: &BlockTemplate, clean_jobs: bool) -> Value {
        let (cb1, cb2) = self.coinbase_parts(tpl);
        let branch: Vec<String> = Self::merkle_branch(Self::tx_hashes(tpl))
            .iter()
            .map(hex::encode)
            .collect();
        let prev = Self::prev_hash_stratum(tpl).unwrap_or_default();

        json!([
            job_id,
            prev,
            hex::encode(cb1),
            hex::encode(cb2),
            branch,
            format!("{:08x}", tpl.version),
            tpl.bits,
            format!("{:08x}", tpl.cur_time),
            clean_jobs,
        ])
    }
}

/// The sha256d pool family: builder + hasher + daemon-backed address checks.
pub struct Sha256dFamily {
    builder: Arc<Sha256dJobBuilder>,
    hasher: Arc<Sha256dAlgorithm>,
}

impl Sha256dFamily {
    pub fn new(pool_script_hex: &str) -> anyhow::Result<Self> {
        Ok(Self {
            builder: Arc::new(Sha256dJobBuilder::new(pool_script_hex)?),
            hasher: Arc::new(Sha256dAlgorithm),
        })
    }
}

#[async_trait]
impl PoolHandler for Sha256dFamily {
    fn job_builder(&self) -> Arc<dyn JobBuilder> {
        self.builder.clone()
    }

    fn hash_algorithm(&self) -> Arc<dyn HashAlgorithm> {
        self.hasher.clone()
    }

    async fn validate_address(
        &self,
        daemon: &DaemonClient,
        address: &str,
        ct: &CancellationToken,
    ) -> Result<bool, PoolStartupError> {
        let resp = daemon
            .execute_any::<ValidateAddressResponse>(
                methods::VALIDATE_ADDRESS,
                json!([address]),
                ct,
            )
            .await;
        match (resp.result, resp.error) {
            (Some(v), None) => Ok(v.isvalid),
            (_, Some(e)) => Err(PoolStartupError::Daemon(e.to_string())),
            _ => Ok(false),
        }
    }

    fn format_amount(&self, atomic: u64) -> String {
        format!("{:.8}", atomic as f64 / 1e8)
    }
}
