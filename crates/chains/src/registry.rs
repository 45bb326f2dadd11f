use crate::error::ChainError;
use crate::worker::ChainCommand;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testchain_types::{ChainKind, ChainStatus};
use tokio::sync::mpsc;

/// One live chain as seen by the rest of the process: its command queue and
/// the exclusive resources it owns.
#[derive(Clone)]
pub struct ChainEntry {
    pub id: String,
    pub kind: ChainKind,
    pub db_path: PathBuf,
    pub http_port: u16,
    pub ws_port: u16,
    pub commands: mpsc::Sender<ChainCommand>,
    pub status: Arc<RwLock<ChainStatus>>,
}

impl ChainEntry {
    /// Snapshot of the worker's current lifecycle status.
    pub fn status(&self) -> ChainStatus {
        *self.status.read()
    }
}

/// Process-wide map of chain id to live worker.
///
/// Insertion doubles as the uniqueness check for ids; removal releases the
/// entry's port and path claims.
#[derive(Default)]
pub struct ChainRegistry {
    inner: RwLock<HashMap<String, ChainEntry>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live chain. Fails if the id is already taken.
    pub fn insert(&self, entry: ChainEntry) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        if inner.contains_key(&entry.id) {
            return Err(ChainError::AlreadyExists(entry.id));
        }
        inner.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Deregister a chain, releasing its resource claims.
    pub fn remove(&self, id: &str) -> Option<ChainEntry> {
        self.inner.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<ChainEntry> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Replace a chain's command sender after a worker respawn.
    pub fn replace_commands(&self, id: &str, commands: mpsc::Sender<ChainCommand>) {
        if let Some(entry) = self.inner.write().get_mut(id) {
            entry.commands = commands;
        }
    }

    /// Whether any live chain claims the given TCP port.
    pub fn port_claimed(&self, port: u16) -> bool {
        self.inner
            .read()
            .values()
            .any(|entry| entry.http_port == port || entry.ws_port == port)
    }

    /// Whether any live chain claims the given data directory.
    pub fn path_claimed(&self, path: &Path) -> bool {
        self.inner.read().values().any(|entry| entry.db_path == path)
    }

    /// Ids of all registered chains.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, http: u16, ws: u16, path: &str) -> ChainEntry {
        let (tx, _rx) = mpsc::channel(1);
        ChainEntry {
            id: id.to_string(),
            kind: ChainKind::Geth,
            db_path: PathBuf::from(path),
            http_port: http,
            ws_port: ws,
            commands: tx,
            status: Arc::new(RwLock::new(ChainStatus::Initializing)),
        }
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let registry = ChainRegistry::new();
        registry.insert(entry("1", 8500, 8501, "/tmp/chains/1")).unwrap();
        let err = registry
            .insert(entry("1", 8502, 8503, "/tmp/chains/other"))
            .unwrap_err();
        assert!(matches!(err, ChainError::AlreadyExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn claims_cover_both_ports_and_path() {
        let registry = ChainRegistry::new();
        registry.insert(entry("1", 8500, 8501, "/tmp/chains/1")).unwrap();

        assert!(registry.port_claimed(8500));
        assert!(registry.port_claimed(8501));
        assert!(!registry.port_claimed(8502));
        assert!(registry.path_claimed(Path::new("/tmp/chains/1")));
        assert!(!registry.path_claimed(Path::new("/tmp/chains/2")));
    }

    #[test]
    fn remove_releases_claims() {
        let registry = ChainRegistry::new();
        registry.insert(entry("1", 8500, 8501, "/tmp/chains/1")).unwrap();
        assert!(registry.remove("1").is_some());
        assert!(registry.remove("1").is_none());
        assert!(!registry.port_claimed(8500));
        assert!(registry.is_empty());
    }
}
