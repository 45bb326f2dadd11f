//! Public entry point of the chain manager.
//!
//! The facade validates submissions, fills in ids, ports and paths via the
//! allocator, persists the effective config, and routes every further
//! command through the registry to the owning worker. `start` returns as
//! soon as the supervisor accepts the chain; callers observe `started` on
//! the returned event stream.

use crate::adapter::EvmAdapter;
use crate::allocator::ResourceAllocator;
use crate::bus::{EventStream, NotificationBus, Topic};
use crate::config::{ManagerConfig, ResolvedChainConfig, CHAIN_CONFIG_FILE};
use crate::error::ChainError;
use crate::registry::{ChainEntry, ChainRegistry};
use crate::supervisor::ChainSupervisor;
use crate::worker::ChainCommand;
use std::path::PathBuf;
use std::sync::Arc;
use testchain_snapshots::SnapshotManager;
use testchain_types::{ChainConfig, ChainDetails, ChainKind, SnapshotDetails};
use tokio::sync::oneshot;
use tracing::info;

/// Name of the opaque client metadata file.
const EXTERNAL_DATA_FILE: &str = "external.json";

pub struct ChainManager {
    config: Arc<ManagerConfig>,
    registry: Arc<ChainRegistry>,
    bus: Arc<NotificationBus>,
    snapshots: Arc<SnapshotManager>,
    allocator: ResourceAllocator,
    supervisor: ChainSupervisor,
}

impl ChainManager {
    /// Boot the manager. Fails when the base path is unusable or the
    /// snapshot index cannot be opened; both are fatal conditions.
    pub fn new(config: ManagerConfig) -> Result<Self, ChainError> {
        config.validate()?;
        std::fs::create_dir_all(&config.base_path)?;
        if !config.geth_password_file.exists() {
            if let Some(parent) = config.geth_password_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config.geth_password_file, "")?;
        }
        let snapshots = Arc::new(SnapshotManager::open(
            &config.snapshot_base_path,
            &config.snapshot_db_path,
        )?);
        let config = Arc::new(config);
        let registry = Arc::new(ChainRegistry::new());
        let bus = Arc::new(NotificationBus::new(config.bus_capacity));
        let allocator = ResourceAllocator::new(config.clone(), registry.clone());
        let supervisor = ChainSupervisor::new(
            config.clone(),
            registry.clone(),
            bus.clone(),
            snapshots.clone(),
        );
        info!(base_path = %config.base_path.display(), "chain manager ready");
        Ok(Self {
            config,
            registry,
            bus,
            snapshots,
            allocator,
            supervisor,
        })
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Subscribe to the fan-in of lifecycle events across all chains.
    pub fn subscribe_api(&self) -> EventStream {
        self.bus.subscribe(&Topic::Api)
    }

    /// Subscribe to one chain's events.
    pub fn subscribe_chain(&self, id: &str) -> EventStream {
        self.bus.subscribe(&Topic::chain(id))
    }

    /// Start a new chain. Returns its id and an event stream subscribed
    /// before the worker spawns, so the first event received is `started`.
    pub async fn start(&self, config: ChainConfig) -> Result<(String, EventStream), ChainError> {
        let resolved = self.resolve(config)?;
        if let Some(snapshot_id) = &resolved.snapshot_id {
            // find also accepts transient (unindexed) archives still on disk.
            let details = self.snapshots.find(snapshot_id, resolved.kind)?;
            if details.chain != resolved.kind {
                return Err(ChainError::Validation(format!(
                    "snapshot {snapshot_id} is for {}, chain is {}",
                    details.chain, resolved.kind
                )));
            }
        }
        let existing = resolved.db_path.exists();
        self.spawn(resolved, existing)
    }

    /// Start a chain whose data directory survived an earlier stop.
    pub async fn start_existing(&self, id: &str) -> Result<(String, EventStream), ChainError> {
        if self.registry.contains(id) {
            return Err(ChainError::AlreadyExists(id.to_string()));
        }
        let config_path = self
            .config
            .base_path
            .join(id)
            .join(CHAIN_CONFIG_FILE);
        let raw =
            std::fs::read(&config_path).map_err(|_| ChainError::NotFound(id.to_string()))?;
        let stored: ChainConfig = serde_json::from_slice(&raw)?;
        let resolved = ResolvedChainConfig::try_from_config(stored)?;
        if self.allocator.port_in_use(resolved.http_port)
            || (resolved.ws_port != resolved.http_port
                && self.allocator.port_in_use(resolved.ws_port))
            || self.allocator.path_in_use(&resolved.db_path)
        {
            return Err(ChainError::ResourceConflict);
        }
        self.spawn(resolved, true)
    }

    /// Ask a chain to stop. Completion is observed as `stopped` on the bus;
    /// termination is forced after the kill timeout.
    pub async fn stop(&self, id: &str) -> Result<(), ChainError> {
        self.supervisor.stop_chain(id).await
    }

    /// Archive the chain's data directory. The chain restarts afterwards
    /// and emits `snapshot_taken`, `status_changed` and `started`.
    pub async fn take_snapshot(
        &self,
        id: &str,
        description: &str,
    ) -> Result<SnapshotDetails, ChainError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            id,
            ChainCommand::TakeSnapshot {
                description: description.to_string(),
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| ChainError::WorkerGone)?
    }

    /// Restore the chain's data directory from a snapshot.
    pub async fn revert_snapshot(
        &self,
        id: &str,
        details: SnapshotDetails,
    ) -> Result<(), ChainError> {
        let (reply, rx) = oneshot::channel();
        self.send(id, ChainCommand::RevertSnapshot { details, reply })
            .await?;
        rx.await.map_err(|_| ChainError::WorkerGone)?
    }

    /// Restore from an indexed snapshot by its id.
    pub async fn revert_snapshot_by_id(
        &self,
        id: &str,
        snapshot_id: &str,
    ) -> Result<(), ChainError> {
        let details = self.snapshots.by_id(snapshot_id)?;
        self.revert_snapshot(id, details).await
    }

    pub async fn start_mine(&self, id: &str) -> Result<(), ChainError> {
        let (reply, rx) = oneshot::channel();
        self.send(id, ChainCommand::StartMine { reply }).await?;
        rx.await.map_err(|_| ChainError::WorkerGone)?
    }

    pub async fn stop_mine(&self, id: &str) -> Result<(), ChainError> {
        let (reply, rx) = oneshot::channel();
        self.send(id, ChainCommand::StopMine { reply }).await?;
        rx.await.map_err(|_| ChainError::WorkerGone)?
    }

    /// Current details of a live chain.
    pub async fn details(&self, id: &str) -> Result<ChainDetails, ChainError> {
        let (reply, rx) = oneshot::channel();
        self.send(id, ChainCommand::Details { reply }).await?;
        rx.await.map_err(|_| ChainError::WorkerGone)
    }

    /// Whether the chain is registered and in a live state.
    pub fn alive(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .map(|entry| entry.status().is_live())
            .unwrap_or(false)
    }

    /// Versions of the managed EVM binaries.
    pub async fn version(&self) -> String {
        let geth = EvmAdapter::Geth
            .version(&self.config)
            .await
            .unwrap_or_else(|_| "unavailable".to_string());
        let ganache = EvmAdapter::Ganache
            .version(&self.config)
            .await
            .unwrap_or_else(|_| "unavailable".to_string());
        format!("geth: {geth}\nganache: {ganache}")
    }

    /// Persist opaque client metadata next to the chain's data.
    pub fn write_external_data(
        &self,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<(), ChainError> {
        let dir = self.chain_dir(id)?;
        std::fs::write(
            dir.join(EXTERNAL_DATA_FILE),
            serde_json::to_vec_pretty(data)?,
        )?;
        Ok(())
    }

    /// Read back metadata written by [`write_external_data`].
    pub fn read_external_data(&self, id: &str) -> Result<Option<serde_json::Value>, ChainError> {
        let path = self.chain_dir(id)?.join(EXTERNAL_DATA_FILE);
        match std::fs::read(&path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop all chains and drain the registry, bounded by the kill timeout.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    fn spawn(
        &self,
        resolved: ResolvedChainConfig,
        existing: bool,
    ) -> Result<(String, EventStream), ChainError> {
        resolved.persist()?;
        let id = resolved.id.clone();
        let events = self.bus.subscribe(&Topic::chain(&id));
        self.supervisor.spawn_chain(resolved, existing)?;
        Ok((id, events))
    }

    /// Fill in id, ports and path, normalizing ganache's shared port.
    pub(crate) fn resolve(&self, config: ChainConfig) -> Result<ResolvedChainConfig, ChainError> {
        let kind = config.kind;
        let id = match config.id {
            Some(id) if !id.is_empty() => {
                if self.registry.contains(&id) {
                    return Err(ChainError::AlreadyExists(id));
                }
                id
            }
            _ => self.allocator.new_id()?,
        };

        let db_path = config
            .db_path
            .unwrap_or_else(|| self.config.base_path.join(&id));
        if self.allocator.path_in_use(&db_path) {
            return Err(ChainError::ResourceConflict);
        }

        let (http_port, ws_port) = match kind {
            ChainKind::Ganache => {
                // One socket serves both HTTP and WS.
                let port = match config.http_port.or(config.ws_port) {
                    Some(port) => {
                        if self.allocator.port_in_use(port) {
                            return Err(ChainError::ResourceConflict);
                        }
                        port
                    }
                    None => self.allocator.allocate_port(&[])?,
                };
                (port, port)
            }
            ChainKind::Geth => {
                let http = match config.http_port {
                    Some(port) => {
                        if self.allocator.port_in_use(port) {
                            return Err(ChainError::ResourceConflict);
                        }
                        port
                    }
                    None => self.allocator.allocate_port(&[])?,
                };
                let ws = match config.ws_port {
                    Some(port) => {
                        if port == http || self.allocator.port_in_use(port) {
                            return Err(ChainError::ResourceConflict);
                        }
                        port
                    }
                    None => self.allocator.allocate_port(&[http])?,
                };
                (http, ws)
            }
        };

        Ok(ResolvedChainConfig {
            id,
            kind,
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

    async fn send(&self, id: &str, command: ChainCommand) -> Result<(), ChainError> {
        let entry = self.entry(id)?;
        entry
            .commands
            .send(command)
            .await
            .map_err(|_| ChainError::WorkerGone)
    }

    fn entry(&self, id: &str) -> Result<ChainEntry, ChainError> {
        self.registry
            .get(id)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))
    }

    fn chain_dir(&self, id: &str) -> Result<PathBuf, ChainError> {
        if let Some(entry) = self.registry.get(id) {
            return Ok(entry.db_path);
        }
        let dir = self.config.base_path.join(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ChainError::NotFound(id.to_string()))
        }
    }
}
