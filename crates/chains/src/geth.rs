//! Geth adapter: command construction and launch against a `--dev` chain.

use crate::accounts;
use crate::adapter::EvmProcess;
use crate::config::{ManagerConfig, ResolvedChainConfig};
use crate::error::ChainError;
use crate::rpc;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use testchain_types::Account;
use tokio::process::Command;
use tracing::{debug, info};

/// RPC namespaces exposed on the HTTP endpoint.
const RPC_APIS: &str = "admin,personal,eth,miner,debug,txpool,net";
const GAS_PRICE: &str = "2000000000";
const TARGET_GAS_LIMIT: &str = "9000000000000";

/// Build the full geth argument list for a chain.
///
/// The trailing `console` keeps stdin attached so a cooperative stop can
/// send `exit`.
pub(crate) fn command_args(
    config: &ResolvedChainConfig,
    accounts: &[Account],
    password_file: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--dev".to_string(),
        "--datadir".to_string(),
        config.db_path.display().to_string(),
    ];
    if let Some(period) = config.block_time_secs() {
        args.push(format!("--dev.period={period}"));
    }
    args.push("--networkid".to_string());
    args.push(config.network_id.to_string());
    args.push("--ipcdisable".to_string());
    args.push("--rpc".to_string());
    args.push("--rpcport".to_string());
    args.push(config.http_port.to_string());
    args.push("--rpcapi".to_string());
    args.push(RPC_APIS.to_string());
    args.push("--ws".to_string());
    args.push("--wsport".to_string());
    args.push(config.ws_port.to_string());
    args.push("--wsorigins=*".to_string());
    args.push(format!("--gasprice={GAS_PRICE}"));
    args.push(format!("--targetgaslimit={TARGET_GAS_LIMIT}"));
    if !accounts.is_empty() {
        args.push(format!("--password={}", password_file.display()));
        args.push(format!("--etherbase={}", accounts[0].address));
        let unlock: Vec<&str> = accounts.iter().map(|a| a.address.as_str()).collect();
        args.push(format!("--unlock={}", unlock.join(",")));
    }
    args.push("console".to_string());
    args
}

/// Provision accounts, spawn geth and wait for the RPC endpoint.
pub(crate) async fn start(
    config: &ResolvedChainConfig,
    manager: &ManagerConfig,
    kill_timeout: Duration,
) -> Result<EvmProcess, ChainError> {
    tokio::fs::create_dir_all(&config.db_path).await?;

    let accounts = if accounts::has_keystore(&config.db_path) {
        debug!(id = %config.id, "re-reading accounts from existing keystore");
        accounts::list_geth_accounts(&manager.geth_executable, &config.db_path).await?
    } else {
        accounts::create_geth_accounts(
            &manager.geth_executable,
            &config.db_path,
            &manager.geth_password_file,
            config.accounts_requested,
        )
        .await?
    };

    let args = command_args(config, &accounts, &manager.geth_password_file);
    let stderr = crate::adapter::output_log(config.output_log_path.as_deref())?;
    debug!(id = %config.id, "spawning geth: {}", args.join(" "));
    let mut child = Command::new(&manager.geth_executable)
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
    info!(id = %config.id, http_port = config.http_port, "geth ready");
    Ok(EvmProcess::new(child, accounts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use testchain_types::ChainKind;

    fn resolved() -> ResolvedChainConfig {
        ResolvedChainConfig {
            id: "42".into(),
            kind: ChainKind::Geth,
            accounts_requested: 2,
            block_mine_time_ms: 0,
            network_id: 999,
            db_path: "/tmp/chains/42".into(),
            http_port: 8545,
            ws_port: 8546,
            clean_on_stop: false,
            output_log_path: None,
            snapshot_id: None,
        }
    }

    fn accounts() -> Vec<Account> {
        vec![
            Account::from_address("0x7f0d31ef57cfdd1aba302f5fb44cf84f9f80c08d"),
            Account::from_address("0x91bd4b2b5d675977bd52be0d4a1d383a6f2329ab"),
        ]
    }

    #[test]
    fn command_matches_launch_contract() {
        let args = command_args(&resolved(), &accounts(), Path::new("/tmp/pw"));
        let joined = args.join(" ");
        assert_eq!(
            joined,
            "--dev --datadir /tmp/chains/42 --networkid 999 --ipcdisable \
             --rpc --rpcport 8545 --rpcapi admin,personal,eth,miner,debug,txpool,net \
             --ws --wsport 8546 --wsorigins=* --gasprice=2000000000 \
             --targetgaslimit=9000000000000 --password=/tmp/pw \
             --etherbase=0x7f0d31ef57cfdd1aba302f5fb44cf84f9f80c08d \
             --unlock=0x7f0d31ef57cfdd1aba302f5fb44cf84f9f80c08d,0x91bd4b2b5d675977bd52be0d4a1d383a6f2329ab \
             console"
        );
    }

    #[test]
    fn mine_interval_adds_dev_period() {
        let mut config = resolved();
        config.block_mine_time_ms = 3000;
        let args = command_args(&config, &accounts(), Path::new("/tmp/pw"));
        assert!(args.contains(&"--dev.period=3".to_string()));
    }

    #[test]
    fn no_accounts_skips_unlock_flags() {
        let args = command_args(&resolved(), &[], Path::new("/tmp/pw"));
        assert!(!args.iter().any(|a| a.starts_with("--unlock")));
        assert!(!args.iter().any(|a| a.starts_with("--etherbase")));
        assert!(!args.iter().any(|a| a.starts_with("--password")));
        assert_eq!(args.last().unwrap(), "console");
    }
}
