/// Pool configuration: JSON file with serde defaults plus a small set of
/// environment overrides for containerized deployments.

use serde::Deserialize;

use crate::error::PoolStartupError;
use crate::vardiff::VarDiffOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct StratumEndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// PKCS#12 certificate path; presence enables TLS on this endpoint.
    #[serde(default)]
    pub tls_pfx_file: Option<String>,
    #[serde(default)]
    pub tls_pfx_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonEndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_http_path")]
    pub http_path: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_daemon_timeout_secs")]
    pub timeout_secs: u64,
}

impl DaemonEndpointConfig {
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.http_path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_id")]
    pub id: String,

    #[serde(default)]
    pub endpoints: Vec<StratumEndpointConfig>,

    #[serde(default)]
    pub daemons: Vec<DaemonEndpointConfig>,

    /// Pool payout address, validated against the daemon at startup.
    #[serde(default)]
    pub address: String,

    /// Output script the reference coinbase pays to, hex. OP_TRUE default is
    /// only suitable for regtest.
    #[serde(default = "default_pool_script_hex")]
    pub pool_script_hex: String,

    #[serde(default = "default_block_refresh_interval_ms")]
    pub block_refresh_interval_ms: u64,

    #[serde(default = "default_job_rebroadcast_timeout_secs")]
    pub job_rebroadcast_timeout_secs: u64,

    /// 0 disables idle eviction.
    #[serde(default)]
    pub client_connection_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub ban_on_junk_receive: bool,

    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: f64,

    #[serde(default)]
    pub vardiff: VarDiffOptions,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_pool_id() -> String {
    "pool1".to_string()
}

fn default_pool_script_hex() -> String {
    // OP_TRUE
    "51".to_string()
}

fn default_daemon_timeout_secs() -> u64 {
    5
}

fn default_block_refresh_interval_ms() -> u64 {
    500
}

fn default_job_rebroadcast_timeout_secs() -> u64 {
    55
}

fn default_ban_duration_secs() -> u64 {
    180
}

fn default_initial_difficulty() -> f64 {
    16.0
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!())
    }
}

impl PoolConfig {
    /// Load from a JSON file, then apply env overrides.
    pub fn load(path: &str) -> Result<Self, PoolStartupError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PoolStartupError::Config(format!("cannot read {}: {}", path, e)))?;
        let mut cfg: PoolConfig = serde_json::from_str(&text)
            .map_err(|e| PoolStartupError::Config(format!("cannot parse {}: {}", path, e)))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("LODE_POOL_LISTEN") {
            if let Some((host, port)) = listen.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    self.endpoints = vec![StratumEndpointConfig {
                        host: host.to_string(),
                        port,
                        tls_pfx_file: None,
                        tls_pfx_password: None,
                    }];
                }
            }
        }
        if let Ok(addr) = std::env::var("LODE_POOL_ADDRESS") {
            self.address = addr;
        }
    }

    pub fn validate(&self) -> Result<(), PoolStartupError> {
        if self.endpoints.is_empty() {
            return Err(PoolStartupError::Config(
                "no stratum endpoints configured".into(),
            ));
        }
        if self.daemons.is_empty() {
            return Err(PoolStartupError::Config(
                "no daemon endpoints configured".into(),
            ));
        }
        if self.address.is_empty() {
            return Err(PoolStartupError::Config("no pool address configured".into()));
        }
        if self.initial_difficulty <= 0.0 {
            return Err(PoolStartupError::Config(
                "initial_difficulty must be positive".into(),
            ));
        }
        if self.vardiff.min_diff <= 0.0 {
            return Err(PoolStartupError::Config(
                "vardiff.min_diff must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_object() {
        let cfg: PoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.id, "pool1");
        assert_eq!(cfg.block_refresh_interval_ms, 500);
        assert!(cfg.ban_on_junk_receive);
        assert_eq!(cfg.initial_difficulty, 16.0);
        assert_eq!(cfg.vardiff.target_time, 15.0);
    }

    #[test]
    fn validate_rejects_empty_sections() {
        let cfg = PoolConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn full_config_parses_and_validates() {
        let cfg: PoolConfig = serde_json::from_str(
            r#"{
                "id": "btc1",
                "address": "bcrt1qexample",
                "endpoints": [{"host": "0.0.0.0", "port": 3333}],
                "daemons": [{"host": "127.0.0.1", "port": 8332, "user": "u", "password": "p"}],
                "vardiff": {"min_diff": 0.5, "target_time": 10.0}
            }"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.daemons[0].url(), "http://127.0.0.1:8332/");
        assert_eq!(cfg.vardiff.target_time, 10.0);
        assert_eq!(cfg.vardiff.retarget_time, 90.0);
    }
}
