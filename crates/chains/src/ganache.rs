//! Ganache adapter: launches `ganache-cli` through the operator-provided
//! wrapper script with a deterministic account set.

use crate::accounts;
use crate::adapter::EvmProcess;
use crate::config::{ManagerConfig, ResolvedChainConfig};
use crate::error::ChainError;
use crate::rpc;
use std::process::Stdio;
use std::time::Duration;
use testchain_types::Account;
use tokio::process::Command;
use tracing::{debug, info};

/// Build the wrapper argument list. The ganache executable path goes first;
/// the wrapper execs it with the remaining flags.
pub(crate) fn command_args(config: &ResolvedChainConfig, accounts: &[Account]) -> Vec<String> {
    let mut args = Vec::new();
    for account in accounts {
        // priv_key is always set for generated ganache accounts
        let key = account.priv_key.as_deref().unwrap_or_default();
        args.push(format!("--account=0x{key},{}", account.balance));
    }
    args.push("--port".to_string());
    args.push(config.http_port.to_string());
    args.push("--networkId".to_string());
    args.push(config.network_id.to_string());
    args.push("--db".to_string());
    args.push(config.db_path.display().to_string());
    if let Some(block_time) = config.block_time_secs() {
        args.push("--blockTime".to_string());
        args.push(block_time.to_string());
    }
    args
}

/// Spawn ganache and wait for the RPC endpoint.
pub(crate) async fn start(
    config: &ResolvedChainConfig,
    manager: &ManagerConfig,
    kill_timeout: Duration,
) -> Result<EvmProcess, ChainError> {
    tokio::fs::create_dir_all(&config.db_path).await?;

    let accounts = accounts::ganache_accounts(config.accounts_requested);
    let args = command_args(config, &accounts);
    let stderr = crate::adapter::output_log(config.output_log_path.as_deref())?;
    debug!(id = %config.id, "spawning ganache: {}", args.join(" "));
    let mut child = Command::new(&manager.ganache_wrapper_script)
        .arg(&manager.ganache_executable)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()?;

    if let Err(e) = rpc::wait_until_ready(config.http_port, kill_timeout, || {
        matches!(child.try_wait(), Ok(None))
    })
    .await
    {
        let _ = child.kill().await;
        return Err(e);
    }
    info!(id = %config.id, port = config.http_port, "ganache ready");
    Ok(EvmProcess::new(child, accounts))
}
