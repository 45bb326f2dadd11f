//! Adapter over the supported EVM implementations.
//!
//! A tagged variant per EVM with explicit dispatch; operations an EVM does
//! not support return [`ChainError::Unsupported`] instead of silently
//! succeeding.

use crate::config::{ManagerConfig, ResolvedChainConfig};
use crate::error::ChainError;
use crate::rpc::JsonRpcClient;
use crate::{ganache, geth};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use testchain_types::{Account, ChainKind};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between the cooperative `exit` and a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A live EVM child process and the accounts it was launched with.
pub struct EvmProcess {
    pub child: Child,
    pub accounts: Vec<Account>,
}

impl EvmProcess {
    pub fn new(child: Child, accounts: Vec<Account>) -> Self {
        Self { child, accounts }
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Stderr destination for a chain's EVM output.
pub(crate) fn output_log(path: Option<&Path>) -> Result<Stdio, ChainError> {
    match path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

/// Dispatch handle for one EVM implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvmAdapter {
    Geth,
    Ganache,
}

impl EvmAdapter {
    pub fn for_kind(kind: ChainKind) -> Self {
        match kind {
            ChainKind::Geth => EvmAdapter::Geth,
            ChainKind::Ganache => EvmAdapter::Ganache,
        }
    }

    pub fn kind(&self) -> ChainKind {
        match self {
            EvmAdapter::Geth => ChainKind::Geth,
            EvmAdapter::Ganache => ChainKind::Ganache,
        }
    }

    /// Provision accounts, spawn the EVM and wait until it answers RPC.
    pub async fn start(
        &self,
        config: &ResolvedChainConfig,
        manager: &ManagerConfig,
        kill_timeout: Duration,
    ) -> Result<EvmProcess, ChainError> {
        match self {
            EvmAdapter::Geth => geth::start(config, manager, kill_timeout).await,
            EvmAdapter::Ganache => ganache::start(config, manager, kill_timeout).await,
        }
    }

    /// Cooperative stop: send `exit` on stdin, close it, give the child a
    /// grace period, then kill.
    pub async fn stop(&self, process: &mut EvmProcess) -> Result<(), ChainError> {
        if let Some(stdin) = process.child.stdin.as_mut() {
            let _ = stdin.write_all(b"exit\n").await;
            let _ = stdin.flush().await;
        }
        // EOF on stdin ends the geth console even when `exit` was dropped.
        drop(process.child.stdin.take());
        match tokio::time::timeout(STOP_GRACE, process.child.wait()).await {
            Ok(status) => {
                status?;
                debug!("evm exited cooperatively");
                Ok(())
            }
            Err(_) => {
                warn!("evm ignored exit, killing");
                process.child.kill().await?;
                Ok(())
            }
        }
    }

    /// Forced termination without the cooperative step.
    pub async fn terminate(&self, process: &mut EvmProcess) -> Result<(), ChainError> {
        process.child.kill().await?;
        Ok(())
    }

    pub async fn start_mine(&self, config: &ResolvedChainConfig) -> Result<(), ChainError> {
        JsonRpcClient::localhost(config.http_port).miner_start().await
    }

    pub async fn stop_mine(&self, config: &ResolvedChainConfig) -> Result<(), ChainError> {
        JsonRpcClient::localhost(config.http_port).miner_stop().await
    }

    /// EVM-native snapshot; only ganache supports it.
    pub async fn take_internal_snapshot(
        &self,
        config: &ResolvedChainConfig,
    ) -> Result<String, ChainError> {
        match self {
            EvmAdapter::Geth => Err(ChainError::Unsupported(ChainKind::Geth)),
            EvmAdapter::Ganache => JsonRpcClient::localhost(config.http_port).evm_snapshot().await,
        }
    }

    /// Revert to an EVM-native snapshot; only ganache supports it.
    pub async fn revert_internal_snapshot(
        &self,
        config: &ResolvedChainConfig,
        snapshot: &str,
    ) -> Result<bool, ChainError> {
        match self {
            EvmAdapter::Geth => Err(ChainError::Unsupported(ChainKind::Geth)),
            EvmAdapter::Ganache => {
                JsonRpcClient::localhost(config.http_port)
                    .evm_revert(snapshot)
                    .await
            }
        }
    }

    /// First line of the EVM binary's version output.
    pub async fn version(&self, manager: &ManagerConfig) -> Result<String, ChainError> {
        let (executable, flag) = match self {
            EvmAdapter::Geth => (&manager.geth_executable, "version"),
            EvmAdapter::Ganache => (&manager.ganache_executable, "--version"),
        };
        let output = Command::new(executable)
            .arg(flag)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().next().unwrap_or_default().trim().to_string())
    }
}
