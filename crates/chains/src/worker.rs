//! Per-chain worker: a serialized command processor owning one EVM adapter
//! and the chain's lifecycle state machine.
//!
//! All external commands for a chain funnel through its worker's queue, so
//! submission order equals execution order equals event emission order. The
//! worker also watches its child process and treats an unexpected exit as a
//! crash.

use crate::adapter::{EvmAdapter, EvmProcess};
use crate::bus::NotificationBus;
use crate::config::{ManagerConfig, ResolvedChainConfig};
use crate::error::ChainError;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use testchain_snapshots::SnapshotManager;
use testchain_types::{
    Account, ChainDetails, ChainEvent, ChainEventKind, ChainStatus, SnapshotDetails,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Commands a worker processes, one at a time.
pub enum ChainCommand {
    Stop {
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
    TakeSnapshot {
        description: String,
        reply: oneshot::Sender<Result<SnapshotDetails, ChainError>>,
    },
    RevertSnapshot {
        details: SnapshotDetails,
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
    StartMine {
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
    StopMine {
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
    Details {
        reply: oneshot::Sender<ChainDetails>,
    },
}

/// How a worker's run ended. `Stopped` and `Failed` are clean terminal
/// exits the supervisor never restarts; `Crashed` means the EVM died
/// unexpectedly while the chain was live, which the supervisor may answer
/// with a rate-limited restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Failed,
    Crashed,
}

enum LoopEvent {
    Command(Option<ChainCommand>),
    ChildExited,
}

pub struct ChainWorker {
    config: ResolvedChainConfig,
    manager: Arc<ManagerConfig>,
    bus: Arc<NotificationBus>,
    snapshots: Arc<SnapshotManager>,
    commands: mpsc::Receiver<ChainCommand>,
    status: Arc<RwLock<ChainStatus>>,
    adapter: EvmAdapter,
    process: Option<EvmProcess>,
    accounts: Vec<Account>,
    /// Launching over a surviving data directory: accounts are re-read and
    /// snapshot seeding is skipped.
    existing: bool,
}

impl ChainWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ResolvedChainConfig,
        manager: Arc<ManagerConfig>,
        bus: Arc<NotificationBus>,
        snapshots: Arc<SnapshotManager>,
        commands: mpsc::Receiver<ChainCommand>,
        status: Arc<RwLock<ChainStatus>>,
        existing: bool,
    ) -> Self {
        let adapter = EvmAdapter::for_kind(config.kind);
        Self {
            config,
            manager,
            bus,
            snapshots,
            commands,
            status,
            adapter,
            process: None,
            accounts: Vec::new(),
            existing,
        }
    }

    pub(crate) async fn run(mut self) -> WorkerExit {
        info!(id = %self.config.id, kind = %self.config.kind, "chain worker starting");

        if let Some(snapshot_id) = self.config.snapshot_id.clone() {
            if !self.existing {
                if let Err(e) = self.seed_from_snapshot(&snapshot_id).await {
                    self.fail(format!("snapshot seed failed: {e}")).await;
                    return WorkerExit::Failed;
                }
            }
        }

        match self.launch().await {
            Ok(()) => {
                self.set_status(ChainStatus::Active);
                self.emit(ChainEventKind::Started(self.details()));
                self.emit(ChainEventKind::StatusChanged(ChainStatus::Active));
            }
            Err(e) => {
                self.fail(format!("EVM failed to start: {e}")).await;
                return WorkerExit::Failed;
            }
        }

        loop {
            let event = {
                let Self {
                    commands, process, ..
                } = &mut self;
                tokio::select! {
                    cmd = commands.recv() => LoopEvent::Command(cmd),
                    _ = async {
                        match process.as_mut() {
                            Some(p) => {
                                let _ = p.child.wait().await;
                            }
                            None => std::future::pending::<()>().await,
                        }
                    } => LoopEvent::ChildExited,
                }
            };
            match event {
                LoopEvent::Command(Some(cmd)) => {
                    if let Some(exit) = self.handle(cmd).await {
                        return exit;
                    }
                }
                LoopEvent::Command(None) => {
                    // Every handle dropped: manager teardown. Stop cleanly.
                    debug!(id = %self.config.id, "command channel closed, stopping");
                    return match self.do_stop().await {
                        Ok(()) => WorkerExit::Stopped,
                        Err(e) => {
                            self.fail(format!("stop failed: {e}")).await;
                            WorkerExit::Failed
                        }
                    };
                }
                LoopEvent::ChildExited => {
                    self.fail("EVM process exited unexpectedly".into()).await;
                    return WorkerExit::Crashed;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: ChainCommand) -> Option<WorkerExit> {
        match cmd {
            ChainCommand::Details { reply } => {
                let _ = reply.send(self.details());
                None
            }
            ChainCommand::Stop { reply } => match self.do_stop().await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    Some(WorkerExit::Stopped)
                }
                Err(e) => {
                    let message = format!("stop failed: {e}");
                    let _ = reply.send(Err(e));
                    self.fail(message).await;
                    Some(WorkerExit::Failed)
                }
            },
            ChainCommand::StartMine { reply } => {
                let result = match self.guard_active() {
                    Ok(()) => self.adapter.start_mine(&self.config).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                None
            }
            ChainCommand::StopMine { reply } => {
                let result = match self.guard_active() {
                    Ok(()) => self.adapter.stop_mine(&self.config).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                None
            }
            ChainCommand::TakeSnapshot { description, reply } => {
                if let Err(e) = self.guard_active() {
                    let _ = reply.send(Err(e));
                    return None;
                }
                self.set_status(ChainStatus::SnapshotTaking);
                let archived = match self.stop_evm().await {
                    Ok(()) => self.archive_datadir(&description).await,
                    Err(e) => Err(e),
                };
                let relaunched = self.launch().await;
                match (archived, relaunched) {
                    (Ok(details), Ok(())) => {
                        self.set_status(ChainStatus::Active);
                        self.emit(ChainEventKind::SnapshotTaken(details.clone()));
                        self.emit(ChainEventKind::StatusChanged(ChainStatus::Active));
                        self.emit(ChainEventKind::Started(self.details()));
                        let _ = reply.send(Ok(details));
                        None
                    }
                    (Err(e), Ok(())) => {
                        // The archive failed but the chain came back.
                        warn!(id = %self.config.id, "snapshot take failed: {e}");
                        self.emit(ChainEventKind::Error {
                            message: format!("snapshot take failed: {e}"),
                        });
                        self.set_status(ChainStatus::Active);
                        self.emit(ChainEventKind::StatusChanged(ChainStatus::Active));
                        self.emit(ChainEventKind::Started(self.details()));
                        let _ = reply.send(Err(e));
                        None
                    }
                    (archived, Err(relaunch)) => {
                        let message = format!("restart after snapshot failed: {relaunch}");
                        let _ = reply.send(Err(archived.err().unwrap_or(relaunch)));
                        self.fail(message).await;
                        Some(WorkerExit::Failed)
                    }
                }
            }
            ChainCommand::RevertSnapshot { details, reply } => {
                if let Err(e) = self.guard_active() {
                    let _ = reply.send(Err(e));
                    return None;
                }
                self.set_status(ChainStatus::SnapshotReverting);
                let restored = match self.stop_evm().await {
                    Ok(()) => self.restore_datadir(&details).await,
                    Err(e) => Err(e),
                };
                match restored {
                    Ok(()) => match self.launch().await {
                        Ok(()) => {
                            self.set_status(ChainStatus::Active);
                            self.emit(ChainEventKind::SnapshotReverted(details));
                            self.emit(ChainEventKind::StatusChanged(ChainStatus::Active));
                            self.emit(ChainEventKind::Started(self.details()));
                            let _ = reply.send(Ok(()));
                            None
                        }
                        Err(e) => {
                            let message = format!("restart after revert failed: {e}");
                            let _ = reply.send(Err(e));
                            self.fail(message).await;
                            Some(WorkerExit::Failed)
                        }
                    },
                    Err(e) => {
                        // Nothing was extracted over the data directory yet
                        // or extraction failed; either way try to come back.
                        warn!(id = %self.config.id, "snapshot revert failed: {e}");
                        self.emit(ChainEventKind::Error {
                            message: format!("snapshot revert failed: {e}"),
                        });
                        match self.launch().await {
                            Ok(()) => {
                                self.set_status(ChainStatus::Active);
                                self.emit(ChainEventKind::StatusChanged(ChainStatus::Active));
                                self.emit(ChainEventKind::Started(self.details()));
                                let _ = reply.send(Err(e));
                                None
                            }
                            Err(relaunch) => {
                                let message = format!("restart after revert failed: {relaunch}");
                                let _ = reply.send(Err(e));
                                self.fail(message).await;
                                Some(WorkerExit::Failed)
                            }
                        }
                    }
                }
            }
        }
    }

    /// Cooperative stop, optional wipe, `stopped` event.
    async fn do_stop(&mut self) -> Result<(), ChainError> {
        self.set_status(ChainStatus::Terminating);
        self.emit(ChainEventKind::StatusChanged(ChainStatus::Terminating));
        self.stop_evm().await?;
        if self.config.clean_on_stop {
            let db_path = self.config.db_path.clone();
            self.bounded_blocking(move || match std::fs::remove_dir_all(&db_path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            })
            .await??;
        }
        self.set_status(ChainStatus::Stopped);
        self.emit(ChainEventKind::Stopped);
        info!(id = %self.config.id, "chain stopped");
        Ok(())
    }

    /// Spawn the EVM and wait for readiness, bounded by the kill timeout.
    async fn launch(&mut self) -> Result<(), ChainError> {
        let timeout = self.kill_timeout();
        let started = tokio::time::timeout(
            timeout,
            self.adapter.start(&self.config, &self.manager, timeout),
        )
        .await
        .map_err(|_| ChainError::Timeout(timeout))??;
        self.accounts = started.accounts.clone();
        self.process = Some(started);
        self.existing = true;
        Ok(())
    }

    /// Stop the child if one is running, bounded by the kill timeout.
    async fn stop_evm(&mut self) -> Result<(), ChainError> {
        if let Some(mut process) = self.process.take() {
            let timeout = self.kill_timeout();
            match tokio::time::timeout(timeout, self.adapter.stop(&mut process)).await {
                Ok(result) => result?,
                Err(_) => {
                    let _ = process.child.kill().await;
                    return Err(ChainError::Timeout(timeout));
                }
            }
        }
        Ok(())
    }

    async fn archive_datadir(&self, description: &str) -> Result<SnapshotDetails, ChainError> {
        let snapshots = self.snapshots.clone();
        let kind = self.config.kind;
        let db_path = self.config.db_path.clone();
        let description = description.to_string();
        self.bounded_blocking(move || snapshots.take(kind, &db_path, &description))
            .await?
            .map_err(ChainError::from)
    }

    async fn restore_datadir(&self, details: &SnapshotDetails) -> Result<(), ChainError> {
        let snapshots = self.snapshots.clone();
        let db_path = self.config.db_path.clone();
        let details = details.clone();
        self.bounded_blocking(move || snapshots.restore(&details, &db_path))
            .await?
            .map_err(ChainError::from)
    }

    async fn seed_from_snapshot(&self, snapshot_id: &str) -> Result<(), ChainError> {
        let details = self.snapshots.find(snapshot_id, self.config.kind)?;
        info!(id = %self.config.id, snapshot = snapshot_id, "seeding data directory from snapshot");
        self.restore_datadir(&details).await?;
        // The archive carries the source chain's persisted config; replace
        // it with this chain's.
        self.config.persist()
    }

    /// Run blocking filesystem work off the runtime, bounded by the kill
    /// timeout.
    async fn bounded_blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Result<T, ChainError> {
        let timeout = self.kill_timeout();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join)) => Err(ChainError::Internal(format!("blocking task failed: {join}"))),
            Err(_) => Err(ChainError::Timeout(timeout)),
        }
    }

    /// Kill any child, then surface the failure as `error` followed by
    /// `status_changed(failed)`.
    async fn fail(&mut self, message: String) {
        error!(id = %self.config.id, "{message}");
        if let Some(mut process) = self.process.take() {
            let _ = process.child.kill().await;
        }
        self.emit(ChainEventKind::Error { message });
        self.set_status(ChainStatus::Failed);
        self.emit(ChainEventKind::StatusChanged(ChainStatus::Failed));
    }

    fn guard_active(&self) -> Result<(), ChainError> {
        if self.status() == ChainStatus::Active {
            Ok(())
        } else {
            Err(ChainError::Busy)
        }
    }

    fn details(&self) -> ChainDetails {
        ChainDetails {
            id: self.config.id.clone(),
            kind: self.config.kind,
            status: self.status(),
            accounts: self.accounts.clone(),
            coinbase: self
                .accounts
                .first()
                .map(|a| a.address.clone())
                .unwrap_or_default(),
            rpc_url: self.manager.http_url(self.config.http_port),
            ws_url: self.manager.ws_url(self.config.ws_port),
        }
    }

    fn status(&self) -> ChainStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ChainStatus) {
        *self.status.write() = status;
    }

    fn emit(&self, kind: ChainEventKind) {
        self.bus.publish(ChainEvent::new(self.config.id.clone(), kind));
    }

    fn kill_timeout(&self) -> Duration {
        self.manager.kill_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testchain_types::ChainKind;

    fn worker(status: ChainStatus) -> (ChainWorker, mpsc::Sender<ChainCommand>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ManagerConfig {
            base_path: dir.path().join("chains"),
            snapshot_base_path: dir.path().join("snapshots"),
            snapshot_db_path: dir.path().join("db"),
            ..Default::default()
        });
        let snapshots = Arc::new(
            SnapshotManager::open(&manager.snapshot_base_path, &manager.snapshot_db_path).unwrap(),
        );
        let (tx, rx) = mpsc::channel(8);
        let config = ResolvedChainConfig {
            id: "1".into(),
            kind: ChainKind::Geth,
            accounts_requested: 1,
            block_mine_time_ms: 0,
            network_id: 999,
            db_path: dir.path().join("chains/1"),
            http_port: 1,
            ws_port: 2,
            clean_on_stop: false,
            output_log_path: None,
            snapshot_id: None,
        };
        let worker = ChainWorker::new(
            config,
            manager,
            Arc::new(NotificationBus::default()),
            snapshots,
            rx,
            Arc::new(RwLock::new(status)),
            false,
        );
        (worker, tx, dir)
    }

    #[tokio::test]
    async fn commands_in_non_active_states_answer_busy() {
        let (mut worker, _tx, _dir) = worker(ChainStatus::SnapshotTaking);
        let (reply, rx) = oneshot::channel();
        let exit = worker.handle(ChainCommand::StartMine { reply }).await;
        assert!(exit.is_none());
        assert!(matches!(rx.await.unwrap(), Err(ChainError::Busy)));
    }

    #[tokio::test]
    async fn take_snapshot_rejected_while_terminating() {
        let (mut worker, _tx, _dir) = worker(ChainStatus::Terminating);
        let (reply, rx) = oneshot::channel();
        let exit = worker
            .handle(ChainCommand::TakeSnapshot {
                description: "x".into(),
                reply,
            })
            .await;
        assert!(exit.is_none());
        assert!(matches!(rx.await.unwrap(), Err(ChainError::Busy)));
    }

    #[tokio::test]
    async fn details_answer_in_any_state() {
        let (mut worker, _tx, _dir) = worker(ChainStatus::Initializing);
        let (reply, rx) = oneshot::channel();
        let exit = worker.handle(ChainCommand::Details { reply }).await;
        assert!(exit.is_none());
        let details = rx.await.unwrap();
        assert_eq!(details.id, "1");
        assert_eq!(details.status, ChainStatus::Initializing);
        assert_eq!(details.coinbase, "");
        assert!(details.rpc_url.starts_with("http://localhost:"));
    }
}
