use crate::config::ManagerConfig;
use crate::error::ChainError;
use crate::registry::ChainRegistry;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Attempts at drawing a fresh random chain id before giving up. Collisions
/// on 64-bit ids mean something else is wrong.
const MAX_ID_ATTEMPTS: usize = 64;

/// Allocates chain ids, TCP ports and data directory paths.
///
/// Allocation is advisory: the probe window closes only when the EVM binds
/// its sockets, so a start can still fail with a resource conflict.
pub struct ResourceAllocator {
    config: Arc<ManagerConfig>,
    registry: Arc<ChainRegistry>,
}

impl ResourceAllocator {
    pub fn new(config: Arc<ManagerConfig>, registry: Arc<ChainRegistry>) -> Self {
        Self { config, registry }
    }

    /// Draw a chain id that is neither registered nor present on disk as a
    /// data directory under the base path.
    pub fn new_id(&self) -> Result<String, ChainError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = rand::random::<u64>().to_string();
            if self.registry.contains(&id) {
                continue;
            }
            if self.config.base_path.join(&id).exists() {
                continue;
            }
            debug!(%id, "allocated chain id");
            return Ok(id);
        }
        Err(ChainError::Validation(
            "unable to allocate a unique chain id".into(),
        ))
    }

    /// Allocate one free port from the configured range, skipping any in
    /// `exclude`.
    pub fn allocate_port(&self, exclude: &[u16]) -> Result<u16, ChainError> {
        for port in self.config.port_range_start..=self.config.port_range_end {
            if exclude.contains(&port) {
                continue;
            }
            if !self.port_in_use(port) {
                debug!(port, "allocated port");
                return Ok(port);
            }
        }
        Err(ChainError::ResourceConflict)
    }

    /// Allocate an (http, ws) port pair. Ganache chains share one port, so
    /// callers normalize before asking.
    pub fn allocate_ports(&self) -> Result<(u16, u16), ChainError> {
        let http = self.allocate_port(&[])?;
        let ws = self.allocate_port(&[http])?;
        Ok((http, ws))
    }

    /// A port is in use when a live chain claims it or something is already
    /// listening on it.
    pub fn port_in_use(&self, port: u16) -> bool {
        if self.registry.port_claimed(port) {
            return true;
        }
        TcpListener::bind(("127.0.0.1", port)).is_err()
    }

    /// A path is in use when a live chain declares it as its data directory.
    pub fn path_in_use(&self, path: &Path) -> bool {
        self.registry.path_claimed(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChainEntry;
    use parking_lot::RwLock;
    use std::path::PathBuf;
    use testchain_types::{ChainKind, ChainStatus};
    use tokio::sync::mpsc;

    fn allocator(base_path: PathBuf, range: (u16, u16)) -> (ResourceAllocator, Arc<ChainRegistry>) {
        let registry = Arc::new(ChainRegistry::new());
        let config = Arc::new(ManagerConfig {
            base_path,
            port_range_start: range.0,
            port_range_end: range.1,
            ..Default::default()
        });
        (ResourceAllocator::new(config, registry.clone()), registry)
    }

    fn entry(id: &str, http: u16, ws: u16, path: &str) -> ChainEntry {
        let (tx, _rx) = mpsc::channel(1);
        ChainEntry {
            id: id.to_string(),
            kind: ChainKind::Geth,
            db_path: PathBuf::from(path),
            http_port: http,
            ws_port: ws,
            commands: tx,
            status: Arc::new(RwLock::new(ChainStatus::Active)),
        }
    }

    #[test]
    fn new_id_is_decimal_and_unused() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, _) = allocator(dir.path().to_path_buf(), (18500, 18509));
        let id = allocator.new_id().unwrap();
        assert!(id.chars().all(|c| c.is_ascii_digit()));
        assert!(!dir.path().join(&id).exists());
    }

    #[test]
    fn new_id_skips_existing_directories_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, registry) = allocator(dir.path().to_path_buf(), (18500, 18509));
        // No way to force a specific random id; exercise the probes directly.
        let id = allocator.new_id().unwrap();
        std::fs::create_dir_all(dir.path().join(&id)).unwrap();
        registry
            .insert(entry(&id, 18500, 18501, dir.path().join(&id).to_str().unwrap()))
            .unwrap();
        let next = allocator.new_id().unwrap();
        assert_ne!(next, id);
    }

    #[test]
    fn allocate_ports_returns_distinct_free_ports() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, _) = allocator(dir.path().to_path_buf(), (18510, 18519));
        let (http, ws) = allocator.allocate_ports().unwrap();
        assert_ne!(http, ws);
        assert!((18510..=18519).contains(&http));
        assert!((18510..=18519).contains(&ws));
    }

    #[test]
    fn bound_socket_marks_port_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, _) = allocator(dir.path().to_path_buf(), (18520, 18521));
        let _listener = TcpListener::bind(("127.0.0.1", 18520)).unwrap();
        assert!(allocator.port_in_use(18520));
        let port = allocator.allocate_port(&[]).unwrap();
        assert_eq!(port, 18521);
    }

    #[test]
    fn registry_claims_exhaust_the_range() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, registry) = allocator(dir.path().to_path_buf(), (18530, 18531));
        registry
            .insert(entry("1", 18530, 18531, "/tmp/chains/1"))
            .unwrap();
        assert!(matches!(
            allocator.allocate_port(&[]),
            Err(ChainError::ResourceConflict)
        ));
    }

    #[test]
    fn path_in_use_tracks_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, registry) = allocator(dir.path().to_path_buf(), (18540, 18549));
        assert!(!allocator.path_in_use(Path::new("/tmp/chains/9")));
        registry
            .insert(entry("9", 18540, 18541, "/tmp/chains/9"))
            .unwrap();
        assert!(allocator.path_in_use(Path::new("/tmp/chains/9")));
    }
}
