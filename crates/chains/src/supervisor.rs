//! Chain supervision: spawns one worker task per chain with a transient
//! restart policy and a bounded kill timeout.
//!
//! A worker that exits on its own (`stopped` or a terminal start failure) is
//! never restarted; an unexpected crash, whether the EVM died under a live
//! chain or the worker task panicked, is respawned under a rate limit.
//! Whatever way a worker ends, the supervisor releases its registry entry
//! and with it the chain's port and path claims.

use crate::bus::NotificationBus;
use crate::config::{ManagerConfig, ResolvedChainConfig};
use crate::error::ChainError;
use crate::registry::{ChainEntry, ChainRegistry};
use crate::worker::{ChainCommand, ChainWorker, WorkerExit};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testchain_types::{ChainEvent, ChainEventKind, ChainStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Rate limit for restarting crashed workers.
const MAX_RESTARTS: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Depth of each worker's command queue; senders briefly block when a chain
/// has this many commands pending.
const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Clone)]
pub struct ChainSupervisor {
    config: Arc<ManagerConfig>,
    registry: Arc<ChainRegistry>,
    bus: Arc<NotificationBus>,
    snapshots: Arc<testchain_snapshots::SnapshotManager>,
    aborts: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl ChainSupervisor {
    pub fn new(
        config: Arc<ManagerConfig>,
        registry: Arc<ChainRegistry>,
        bus: Arc<NotificationBus>,
        snapshots: Arc<testchain_snapshots::SnapshotManager>,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            snapshots,
            aborts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the chain and spawn its worker. Returns as soon as the
    /// worker task is accepted; `started` arrives on the notification bus.
    pub fn spawn_chain(
        &self,
        config: ResolvedChainConfig,
        existing: bool,
    ) -> Result<(), ChainError> {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let status = Arc::new(RwLock::new(ChainStatus::Initializing));
        self.registry.insert(ChainEntry {
            id: config.id.clone(),
            kind: config.kind,
            db_path: config.db_path.clone(),
            http_port: config.http_port,
            ws_port: config.ws_port,
            commands,
            status: status.clone(),
        })?;
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.monitor(config, rx, status, existing).await;
        });
        Ok(())
    }

    /// Ask a chain to stop cooperatively; force-terminate the worker and its
    /// EVM if it has not exited within the kill timeout.
    pub async fn stop_chain(&self, id: &str) -> Result<(), ChainError> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))?;
        let (reply, _observer) = oneshot::channel();
        entry
            .commands
            .send(ChainCommand::Stop { reply })
            .await
            .map_err(|_| ChainError::WorkerGone)?;

        let supervisor = self.clone();
        let id = id.to_string();
        let timeout = self.config.kill_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if supervisor.registry.contains(&id) {
                warn!(%id, "chain ignored stop within kill timeout, aborting worker");
                supervisor.abort_worker(&id);
            }
        });
        Ok(())
    }

    /// Stop every chain and wait (bounded) for the registry to drain.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        info!(chains = ids.len(), "supervisor shutting down");
        for id in &ids {
            let _ = self.stop_chain(id).await;
        }
        let deadline = Instant::now() + self.config.kill_timeout();
        while !self.registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for id in self.registry.ids() {
            warn!(%id, "force-terminating chain at shutdown");
            self.abort_worker(&id);
        }
    }

    fn abort_worker(&self, id: &str) {
        // kill_on_drop on the child reaps the EVM when the task unwinds.
        if let Some(handle) = self.aborts.lock().get(id) {
            handle.abort();
        }
    }

    async fn monitor(
        self,
        config: ResolvedChainConfig,
        rx: mpsc::Receiver<ChainCommand>,
        status: Arc<RwLock<ChainStatus>>,
        existing: bool,
    ) {
        let id = config.id.clone();
        let mut rx_slot = Some(rx);
        let mut existing = existing;
        let mut restarts: Vec<Instant> = Vec::new();

        loop {
            let Some(rx) = rx_slot.take() else { break };
            let worker = ChainWorker::new(
                config.clone(),
                self.config.clone(),
                self.bus.clone(),
                self.snapshots.clone(),
                rx,
                status.clone(),
                existing,
            );
            let handle = tokio::spawn(worker.run());
            self.aborts.lock().insert(id.clone(), handle.abort_handle());

            match handle.await {
                Ok(WorkerExit::Crashed) => {}
                Ok(exit) => {
                    debug!(%id, ?exit, "worker exited");
                    break;
                }
                Err(e) if e.is_panic() => {
                    warn!(%id, "worker task panicked");
                }
                Err(_) => {
                    debug!(%id, "worker aborted");
                    break;
                }
            }

            // The chain crashed under a live worker; restart transiently.
            let now = Instant::now();
            restarts.retain(|at| now.duration_since(*at) < RESTART_WINDOW);
            restarts.push(now);
            if restarts.len() > MAX_RESTARTS {
                warn!(%id, "worker crash loop, giving up");
                *status.write() = ChainStatus::Failed;
                self.bus.publish(ChainEvent::new(
                    id.clone(),
                    ChainEventKind::Error {
                        message: "chain worker crashed repeatedly".into(),
                    },
                ));
                self.bus.publish(ChainEvent::new(
                    id.clone(),
                    ChainEventKind::StatusChanged(ChainStatus::Failed),
                ));
                break;
            }
            warn!(%id, restarts = restarts.len(), "worker crashed, restarting");
            let (commands, new_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
            self.registry.replace_commands(&id, commands);
            *status.write() = ChainStatus::Initializing;
            rx_slot = Some(new_rx);
            // The data directory survived the crash; relaunch over it.
            existing = true;
        }

        self.aborts.lock().remove(&id);
        self.registry.remove(&id);
        self.bus.drop_topic(&id);
        info!(%id, "chain deregistered");
    }
}
