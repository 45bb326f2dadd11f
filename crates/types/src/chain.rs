use crate::account::Account;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Supported EVM implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Geth,
    Ganache,
}

impl ChainKind {
    /// Short lowercase name, matching the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Geth => "geth",
            ChainKind::Ganache => "ganache",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown chain kind.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown chain type: {0}")]
pub struct UnknownChainKind(pub String);

impl FromStr for ChainKind {
    type Err = UnknownChainKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "geth" => Ok(ChainKind::Geth),
            "ganache" => Ok(ChainKind::Ganache),
            other => Err(UnknownChainKind(other.to_string())),
        }
    }
}

/// Lifecycle states of a managed chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Initializing,
    Active,
    SnapshotTaking,
    SnapshotReverting,
    Terminating,
    Stopped,
    Failed,
}

impl ChainStatus {
    /// A live chain still owns its ports, data directory and EVM process.
    pub fn is_live(&self) -> bool {
        !matches!(self, ChainStatus::Stopped | ChainStatus::Failed)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainStatus::Initializing => "initializing",
            ChainStatus::Active => "active",
            ChainStatus::SnapshotTaking => "snapshot_taking",
            ChainStatus::SnapshotReverting => "snapshot_reverting",
            ChainStatus::Terminating => "terminating",
            ChainStatus::Stopped => "stopped",
            ChainStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Request describing one chain. Immutable once the chain has started.
///
/// Missing `id`, `db_path` and ports are filled in by the resource allocator
/// before a worker is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier; assigned by the allocator when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// EVM implementation to launch.
    #[serde(rename = "type")]
    pub kind: ChainKind,
    /// Number of pre-funded accounts to provision.
    #[serde(default = "default_accounts")]
    pub accounts_requested: u32,
    /// Mine interval in milliseconds; 0 means instamine.
    #[serde(default)]
    pub block_mine_time_ms: u64,
    /// EVM network identifier.
    #[serde(default = "default_network_id")]
    pub network_id: u64,
    /// Data directory; assigned under the operator base path when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// HTTP JSON-RPC port; allocated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// WebSocket port; allocated when absent. Ganache requires it to equal
    /// the HTTP port and the config is normalized accordingly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    /// Wipe the data directory after a clean stop.
    #[serde(default)]
    pub clean_on_stop: bool,
    /// File the EVM's output is appended to; absent discards it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log_path: Option<PathBuf>,
    /// Seed the data directory from this snapshot before first launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

fn default_accounts() -> u32 {
    1
}

fn default_network_id() -> u64 {
    999
}

impl ChainConfig {
    /// Minimal config for the given EVM kind, everything else defaulted.
    pub fn new(kind: ChainKind) -> Self {
        Self {
            id: None,
            kind,
            accounts_requested: default_accounts(),
            block_mine_time_ms: 0,
            network_id: default_network_id(),
            db_path: None,
            http_port: None,
            ws_port: None,
            clean_on_stop: false,
            output_log_path: None,
            snapshot_id: None,
        }
    }
}

/// Externally visible description of a running chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDetails {
    /// Chain identifier.
    pub id: String,
    /// EVM implementation.
    #[serde(rename = "type")]
    pub kind: ChainKind,
    /// Current lifecycle status.
    pub status: ChainStatus,
    /// Provisioned accounts, coinbase first.
    pub accounts: Vec<Account>,
    /// Address of the first account; the miner's reward address.
    pub coinbase: String,
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,
    /// WebSocket endpoint.
    pub ws_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_kind_round_trips_through_str() {
        for kind in [ChainKind::Geth, ChainKind::Ganache] {
            assert_eq!(kind.as_str().parse::<ChainKind>().unwrap(), kind);
        }
        assert!("parity".parse::<ChainKind>().is_err());
    }

    #[test]
    fn chain_kind_parse_is_case_insensitive() {
        assert_eq!(" Geth ".parse::<ChainKind>().unwrap(), ChainKind::Geth);
        assert_eq!("GANACHE".parse::<ChainKind>().unwrap(), ChainKind::Ganache);
    }

    #[test]
    fn config_defaults() {
        let config = ChainConfig::new(ChainKind::Geth);
        assert_eq!(config.accounts_requested, 1);
        assert_eq!(config.network_id, 999);
        assert_eq!(config.block_mine_time_ms, 0);
        assert!(!config.clean_on_stop);
        assert!(config.id.is_none());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ChainConfig = serde_json::from_str(r#"{"type":"ganache"}"#).unwrap();
        assert_eq!(config.kind, ChainKind::Ganache);
        assert_eq!(config.accounts_requested, 1);
        assert_eq!(config.network_id, 999);
    }

    #[test]
    fn live_statuses() {
        assert!(ChainStatus::Active.is_live());
        assert!(ChainStatus::SnapshotTaking.is_live());
        assert!(ChainStatus::Terminating.is_live());
        assert!(!ChainStatus::Stopped.is_live());
        assert!(!ChainStatus::Failed.is_live());
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&ChainStatus::SnapshotTaking).unwrap();
        assert_eq!(s, r#""snapshot_taking""#);
    }
}
