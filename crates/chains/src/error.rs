use std::time::Duration;
use testchain_snapshots::SnapshotError;
use testchain_types::ChainKind;

/// Chain manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid configuration: {0}")]
    Validation(String),
    /// Port or data directory already claimed, observed at allocation time
    /// or when the EVM itself failed to bind at launch.
    #[error("port or path are in use")]
    ResourceConflict,
    #[error("Chain not found: {0}")]
    NotFound(String),
    #[error("Chain already exists: {0}")]
    AlreadyExists(String),
    /// Command arrived while the chain was in a non-`active` state.
    #[error("Chain is busy")]
    Busy,
    #[error("EVM failed to start: {0}")]
    StartFailure(String),
    #[error("Operation not supported by {0}")]
    Unsupported(ChainKind),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("JSON-RPC error: {0}")]
    Rpc(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The worker task is gone; its reply channel closed before answering.
    #[error("Chain worker exited")]
    WorkerGone,
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_conflict_message_is_stable() {
        // Gateway clients match on this exact string.
        assert_eq!(ChainError::ResourceConflict.to_string(), "port or path are in use");
    }
}
