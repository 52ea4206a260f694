/// Daemon RPC method names and typed payloads.
///
/// Fields are lenient: daemons across coin families disagree on which keys
/// they populate, so everything non-essential defaults.

use serde::Deserialize;

pub mod methods {
    pub const GET_INFO: &str = "getinfo";
    pub const GET_MINING_INFO: &str = "getmininginfo";
    pub const GET_PEER_INFO: &str = "getpeerinfo";
    pub const GET_DIFFICULTY: &str = "getdifficulty";
    pub const GET_BLOCKCHAIN_INFO: &str = "getblockchaininfo";
    pub const GET_BLOCK_TEMPLATE: &str = "getblocktemplate";
    pub const SUBMIT_BLOCK: &str = "submitblock";
    pub const GET_BLOCK: &str = "getblock";
    pub const VALIDATE_ADDRESS: &str = "validateaddress";
}

/// Daemon error code meaning "method not found" (JSON-RPC reserved).
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Deserialize)]
pub struct GetInfoResponse {
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetMiningInfoResponse {
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default, alias = "networkhashps")]
    pub network_hashps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockchainInfoResponse {
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default, alias = "initialblockdownload")]
    pub initial_block_download: bool,
    #[serde(default, alias = "verificationprogress")]
    pub verification_progress: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAddressResponse {
    #[serde(default)]
    pub isvalid: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub ismine: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockResponse {
    pub hash: String,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub tx: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: i64,
}

/// `getblocktemplate` payload, Bitcoin family shape.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(alias = "previousblockhash")]
    pub previous_block_hash: String,
    pub height: u64,
    #[serde(default)]
    pub bits: String,
    #[serde(default)]
    pub target: String,
    #[serde(alias = "curtime")]
    pub cur_time: u64,
    #[serde(default, alias = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, alias = "default_witness_commitment")]
    pub default_witness_commitment: Option<String>,
}
