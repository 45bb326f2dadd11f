//! Minimal JSON-RPC 2.0 client for talking to a running EVM: readiness
//! probes, mining toggles and ganache's internal snapshot calls.

use crate::error::ChainError;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, trace};

/// Per-request timeout; the probe's own backoff handles longer waits.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness probe backoff: 100 ms doubling up to 2 s.
const PROBE_INITIAL_DELAY: Duration = Duration::from_millis(100);
const PROBE_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC client bound to one EVM endpoint.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: Client,
    url: String,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    /// Client for an EVM listening on the local host.
    pub fn localhost(port: u16) -> Self {
        Self::new(format!("http://localhost:{port}"))
    }

    /// Issue one JSON-RPC call and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        trace!(url = %self.url, method, "rpc call");
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.error {
            return Err(ChainError::Rpc(format!(
                "{method} failed: {} (code {})",
                error.message, error.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Current block number via `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    /// Begin mining with one miner thread.
    pub async fn miner_start(&self) -> Result<(), ChainError> {
        self.call("miner_start", json!([1])).await.map(|_| ())
    }

    /// Halt mining.
    pub async fn miner_stop(&self) -> Result<(), ChainError> {
        self.call("miner_stop", json!([])).await.map(|_| ())
    }

    /// Ganache-native snapshot; returns the snapshot reference.
    pub async fn evm_snapshot(&self) -> Result<String, ChainError> {
        let result = self.call("evm_snapshot", json!([])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Rpc(format!("unexpected evm_snapshot result: {result}")))
    }

    /// Revert to a ganache-native snapshot reference.
    pub async fn evm_revert(&self, snapshot: &str) -> Result<bool, ChainError> {
        let result = self.call("evm_revert", json!([snapshot])).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Reported client version via `web3_clientVersion`.
    pub async fn client_version(&self) -> Result<String, ChainError> {
        let result = self.call("web3_clientVersion", json!([])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Rpc(format!("unexpected clientVersion result: {result}")))
    }
}

/// Poll `eth_blockNumber` until the EVM answers, with exponential backoff,
/// or until `deadline` from now elapses. `check_alive` is consulted between
/// attempts so a dead child fails fast instead of burning the whole window.
pub async fn wait_until_ready(
    port: u16,
    deadline: Duration,
    mut check_alive: impl FnMut() -> bool,
) -> Result<(), ChainError> {
    let client = JsonRpcClient::localhost(port);
    let started = Instant::now();
    let mut delay = PROBE_INITIAL_DELAY;
    loop {
        match client.block_number().await {
            Ok(block) => {
                debug!(port, block, "evm ready");
                return Ok(());
            }
            Err(e) => trace!(port, "readiness probe: {e}"),
        }
        if !check_alive() {
            return Err(ChainError::StartFailure(
                "EVM process exited before becoming ready".into(),
            ));
        }
        if started.elapsed() + delay > deadline {
            return Err(ChainError::Timeout(deadline));
        }
        sleep(delay).await;
        delay = (delay * 2).min(PROBE_MAX_DELAY);
    }
}

/// Parse an Ethereum hex quantity (`"0x1a"`) or plain integer.
fn parse_quantity(value: &Value) -> Result<u64, ChainError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Rpc(format!("unexpected quantity: {value}")))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| ChainError::Rpc(format!("unexpected quantity: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), 26);
        assert_eq!(parse_quantity(&json!(7)).unwrap(), 7);
        assert!(parse_quantity(&json!("zz")).is_err());
        assert!(parse_quantity(&json!(null)).is_err());
    }

    #[tokio::test]
    async fn readiness_fails_fast_when_process_dies() {
        // Nothing listens on this port and the process reports dead, so the
        // probe must fail on its first liveness check, not after the window.
        let started = Instant::now();
        let err = wait_until_ready(1, Duration::from_secs(30), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::StartFailure(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn readiness_times_out_within_deadline() {
        let started = Instant::now();
        let err = wait_until_ready(1, Duration::from_millis(300), || true)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
