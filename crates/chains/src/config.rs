use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use testchain_types::{ChainConfig, ChainKind};

/// Operator configuration for the chain manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root for all chain data directories.
    pub base_path: PathBuf,
    /// Directory snapshot archives are written to.
    pub snapshot_base_path: PathBuf,
    /// Location of the snapshot index store.
    pub snapshot_db_path: PathBuf,
    /// Upper bound in milliseconds on any blocking external operation.
    pub kill_timeout_ms: u64,
    /// Host used when building RPC/WS URLs handed to clients.
    pub front_url: String,
    /// Inclusive TCP port range chains are allocated from.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Per-subscriber notification buffer size.
    pub bus_capacity: usize,
    /// Path of the `geth` executable.
    pub geth_executable: PathBuf,
    /// Password file handed to `geth account new` and `--password`.
    pub geth_password_file: PathBuf,
    /// Path of the `ganache-cli` executable.
    pub ganache_executable: PathBuf,
    /// Wrapper script that launches ganache; receives the executable path
    /// as its first argument.
    pub ganache_wrapper_script: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/tmp/chains"),
            snapshot_base_path: PathBuf::from("/tmp/snapshots"),
            snapshot_db_path: PathBuf::from("/tmp/db/snapshots"),
            kill_timeout_ms: 180_000,
            front_url: "localhost".to_string(),
            port_range_start: 8500,
            port_range_end: 8600,
            bus_capacity: 1024,
            geth_executable: PathBuf::from("geth"),
            geth_password_file: PathBuf::from("/tmp/chains/account_password"),
            ganache_executable: PathBuf::from("ganache-cli"),
            ganache_wrapper_script: PathBuf::from("ganache.sh"),
        }
    }
}

impl ManagerConfig {
    /// Kill timeout as a [`Duration`].
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// HTTP JSON-RPC URL exposed to clients for the given port.
    pub fn http_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.front_url, port)
    }

    /// WebSocket URL exposed to clients for the given port.
    pub fn ws_url(&self, port: u16) -> String {
        format!("ws://{}:{}", self.front_url, port)
    }

    /// Check the config for values that can never work.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.port_range_start > self.port_range_end {
            return Err(ChainError::Validation(format!(
                "port range start {} exceeds end {}",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.kill_timeout_ms == 0 {
            return Err(ChainError::Validation("kill_timeout must be positive".into()));
        }
        if self.front_url.is_empty() {
            return Err(ChainError::Validation("front_url must not be empty".into()));
        }
        Ok(())
    }
}

/// Name of the config file persisted into each chain's data directory.
pub const CHAIN_CONFIG_FILE: &str = "chain.json";

/// A [`ChainConfig`] with every allocator-assigned field filled in.
///
/// Workers and adapters only ever see this form, so the optional fields of
/// the submission type stay at the facade boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedChainConfig {
    pub id: String,
    pub kind: ChainKind,
    pub accounts_requested: u32,
    pub block_mine_time_ms: u64,
    pub network_id: u64,
    pub db_path: PathBuf,
    pub http_port: u16,
    pub ws_port: u16,
    pub clean_on_stop: bool,
    pub output_log_path: Option<PathBuf>,
    pub snapshot_id: Option<String>,
}

impl ResolvedChainConfig {
    /// Build from a submission config whose gaps were already filled.
    pub fn try_from_config(config: ChainConfig) -> Result<Self, ChainError> {
        let id = config
            .id
            .ok_or_else(|| ChainError::Validation("chain id not assigned".into()))?;
        let db_path = config
            .db_path
            .ok_or_else(|| ChainError::Validation("db_path not assigned".into()))?;
        let http_port = config
            .http_port
            .ok_or_else(|| ChainError::Validation("http_port not assigned".into()))?;
        let ws_port = config
            .ws_port
            .ok_or_else(|| ChainError::Validation("ws_port not assigned".into()))?;
        Ok(Self {
            id,
            kind: config.kind,
            accounts_requested: config.accounts_requested,
            block_mine_time_ms: config.block_mine_time_ms,
            network_id: config.network_id,
            db_path,
            http_port,
            ws_port,
            clean_on_stop: config.clean_on_stop,
            output_log_path: config.output_log_path,
            snapshot_id: config.snapshot_id,
        })
    }

    /// The submission-shaped form, persisted as `chain.json` so a stopped
    /// chain can be started again later.
    pub fn to_chain_config(&self) -> ChainConfig {
        ChainConfig {
            id: Some(self.id.clone()),
            kind: self.kind,
            accounts_requested: self.accounts_requested,
            block_mine_time_ms: self.block_mine_time_ms,
            network_id: self.network_id,
            db_path: Some(self.db_path.clone()),
            http_port: Some(self.http_port),
            ws_port: Some(self.ws_port),
            clean_on_stop: self.clean_on_stop,
            output_log_path: self.output_log_path.clone(),
            snapshot_id: self.snapshot_id.clone(),
        }
    }

    /// Write the submission-shaped config into the data directory so the
    /// chain can be started again after a stop.
    pub fn persist(&self) -> Result<(), ChainError> {
        std::fs::create_dir_all(&self.db_path)?;
        std::fs::write(
            self.db_path.join(CHAIN_CONFIG_FILE),
            serde_json::to_vec_pretty(&self.to_chain_config())?,
        )?;
        Ok(())
    }

    /// Mine interval in whole seconds, as both EVMs expect; `None` means
    /// instamine and the flag is omitted.
    pub fn block_time_secs(&self) -> Option<u64> {
        if self.block_mine_time_ms == 0 {
            None
        } else {
            Some((self.block_mine_time_ms / 1000).max(1))
        }
    }
}
