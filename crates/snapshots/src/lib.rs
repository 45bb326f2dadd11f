//! # Testchain Snapshots
//!
//! Point-in-time snapshots of chain data directories. A snapshot is a gzipped
//! tar archive named `<id>.tgz` under the snapshot base path; snapshots with a
//! non-empty description are additionally recorded in a sled-backed index so
//! they can be listed and looked up across restarts.

pub mod archive;

use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use testchain_types::{ChainKind, SnapshotDetails};
use tracing::{debug, info, warn};

/// Snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Index error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Snapshot not found: {0}")]
    NotFound(String),
    #[error("Snapshot archive missing: {0}")]
    MissingArchive(String),
    #[error("Data directory missing: {0}")]
    SourceMissing(PathBuf),
}

const SNAPSHOTS_TREE: &str = "snapshots";

/// Takes, restores, indexes and removes archive snapshots.
///
/// Concurrent `take` calls from different chains are safe: each writes a
/// distinct randomly drawn id and sled serializes index mutations internally.
pub struct SnapshotManager {
    base_path: PathBuf,
    db: Db,
    index: Tree,
}

impl SnapshotManager {
    /// Open the manager, creating the archive directory and index store as
    /// needed, and garbage-collect index rows whose archive is gone.
    pub fn open(
        base_path: impl Into<PathBuf>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, SnapshotError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        let db = sled::open(db_path)?;
        let index = db.open_tree(SNAPSHOTS_TREE)?;
        let manager = Self {
            base_path,
            db,
            index,
        };
        manager.repair();
        Ok(manager)
    }

    /// Archive the contents of `db_path` into a new snapshot.
    ///
    /// The archive is written first; only after it exists is a non-empty
    /// description recorded in the index, so an indexed snapshot always has
    /// its file on disk.
    pub fn take(
        &self,
        chain: ChainKind,
        db_path: &Path,
        description: &str,
    ) -> Result<SnapshotDetails, SnapshotError> {
        let id = self.new_snapshot_id();
        let archive_path = self.archive_path(&id);
        archive::create(db_path, &archive_path)?;
        let details = SnapshotDetails::new(id, chain, description, archive_path);
        if !details.is_transient() {
            self.index
                .insert(details.id.as_bytes(), serde_json::to_vec(&details)?)?;
            self.index.flush()?;
        }
        info!(id = %details.id, chain = %chain, transient = details.is_transient(), "snapshot taken");
        Ok(details)
    }

    /// Replace the contents of `db_path` with the snapshot's archive.
    ///
    /// Accepts caller-supplied details, so unindexed archives restore fine.
    pub fn restore(&self, details: &SnapshotDetails, db_path: &Path) -> Result<(), SnapshotError> {
        if !details.path.is_file() {
            return Err(SnapshotError::MissingArchive(
                details.path.display().to_string(),
            ));
        }
        if db_path.exists() {
            std::fs::remove_dir_all(db_path)?;
        }
        archive::extract(&details.path, db_path)?;
        info!(id = %details.id, db_path = %db_path.display(), "snapshot restored");
        Ok(())
    }

    /// Look up an indexed snapshot by id.
    pub fn by_id(&self, id: &str) -> Result<SnapshotDetails, SnapshotError> {
        let raw = self
            .index
            .get(id.as_bytes())?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let details: SnapshotDetails = serde_json::from_slice(&raw)?;
        if !details.path.is_file() {
            return Err(SnapshotError::MissingArchive(
                details.path.display().to_string(),
            ));
        }
        Ok(details)
    }

    /// Resolve a snapshot id for seeding a chain: an indexed row if one
    /// exists, otherwise a transient (unindexed) archive on disk. The
    /// description of a transient archive is unknown, so its details carry
    /// the caller's chain kind and the file's modification time.
    pub fn find(&self, id: &str, chain: ChainKind) -> Result<SnapshotDetails, SnapshotError> {
        match self.by_id(id) {
            Ok(details) => Ok(details),
            Err(SnapshotError::NotFound(_)) => {
                let path = self.archive_path(id);
                if !path.is_file() {
                    return Err(SnapshotError::NotFound(id.to_string()));
                }
                let created_at = std::fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(SnapshotDetails {
                    id: id.to_string(),
                    chain,
                    description: String::new(),
                    path,
                    created_at,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// All indexed snapshots for one EVM implementation.
    pub fn by_chain(&self, chain: ChainKind) -> Result<Vec<SnapshotDetails>, SnapshotError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|details| details.chain == chain)
            .collect())
    }

    /// All indexed snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotDetails>, SnapshotError> {
        let mut snapshots = Vec::new();
        for entry in self.index.iter() {
            let (_, raw) = entry?;
            snapshots.push(serde_json::from_slice::<SnapshotDetails>(&raw)?);
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Delete a snapshot's archive and index row.
    ///
    /// The file goes first; a crash in between leaves a stale index row that
    /// the repair scan removes on the next open.
    pub fn remove(&self, id: &str) -> Result<(), SnapshotError> {
        let archive_path = self.archive_path(id);
        let had_file = archive_path.is_file();
        if had_file {
            std::fs::remove_file(&archive_path)?;
        }
        let had_row = self.index.remove(id.as_bytes())?.is_some();
        self.index.flush()?;
        if !had_file && !had_row {
            return Err(SnapshotError::NotFound(id.to_string()));
        }
        info!(id, "snapshot removed");
        Ok(())
    }

    /// Archive location for a snapshot id.
    pub fn archive_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{id}.tgz"))
    }

    /// Drop index rows whose archive file no longer exists.
    fn repair(&self) {
        let mut stale = Vec::new();
        for entry in self.index.iter() {
            let (key, raw) = match entry {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("snapshot index scan failed: {e}");
                    return;
                }
            };
            match serde_json::from_slice::<SnapshotDetails>(&raw) {
                Ok(details) if details.path.is_file() => {}
                Ok(details) => {
                    warn!(id = %details.id, "dropping index row for missing archive");
                    stale.push(key);
                }
                Err(e) => {
                    warn!("dropping undecodable snapshot index row: {e}");
                    stale.push(key);
                }
            }
        }
        for key in stale {
            if let Err(e) = self.index.remove(&key) {
                warn!("failed to drop stale snapshot index row: {e}");
            }
        }
        if let Err(e) = self.db.flush() {
            warn!("snapshot index flush failed: {e}");
        }
        debug!("snapshot index repair scan complete");
    }

    fn new_snapshot_id(&self) -> String {
        loop {
            let id = rand::random::<u64>().to_string();
            if !self.archive_path(&id).exists() {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_data_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("keystore")).unwrap();
        std::fs::write(dir.path().join("keystore/UTC--key"), "key material").unwrap();
        std::fs::write(dir.path().join("genesis.json"), "{}").unwrap();
        dir
    }

    fn manager(root: &Path) -> SnapshotManager {
        SnapshotManager::open(root.join("snapshots"), root.join("db")).unwrap()
    }

    #[test]
    fn described_snapshot_is_indexed_and_listed() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());

        let details = manager
            .take(ChainKind::Geth, data.path(), "before upgrade")
            .unwrap();
        assert!(details.path.is_file());
        assert_eq!(manager.by_id(&details.id).unwrap(), details);
        assert_eq!(manager.list().unwrap(), vec![details]);
    }

    #[test]
    fn transient_snapshot_keeps_archive_without_index_row() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());

        let details = manager.take(ChainKind::Ganache, data.path(), "").unwrap();
        assert!(details.path.is_file());
        assert!(manager.list().unwrap().is_empty());
        assert!(matches!(
            manager.by_id(&details.id),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn restore_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());
        let details = manager.take(ChainKind::Geth, data.path(), "base").unwrap();

        std::fs::write(data.path().join("keystore/UTC--key"), "mutated").unwrap();
        manager.restore(&details, data.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(data.path().join("keystore/UTC--key")).unwrap(),
            "key material"
        );
    }

    #[test]
    fn restore_of_unindexed_archive_works_with_full_details() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());
        let details = manager.take(ChainKind::Geth, data.path(), "").unwrap();

        let fresh = tempfile::tempdir().unwrap();
        let target = fresh.path().join("restored");
        manager.restore(&details, &target).unwrap();
        assert!(target.join("genesis.json").is_file());
    }

    #[test]
    fn remove_deletes_file_then_row() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());
        let details = manager.take(ChainKind::Geth, data.path(), "gone").unwrap();

        manager.remove(&details.id).unwrap();
        assert!(!details.path.exists());
        assert!(matches!(
            manager.by_id(&details.id),
            Err(SnapshotError::NotFound(_))
        ));
        assert!(matches!(
            manager.remove(&details.id),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn find_resolves_transient_archives_by_id() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());
        let taken = manager.take(ChainKind::Ganache, data.path(), "").unwrap();

        let found = manager.find(&taken.id, ChainKind::Ganache).unwrap();
        assert_eq!(found.id, taken.id);
        assert_eq!(found.path, taken.path);
        assert!(found.is_transient());

        // Indexed rows keep their stored kind regardless of the hint.
        let indexed = manager.take(ChainKind::Geth, data.path(), "named").unwrap();
        let found = manager.find(&indexed.id, ChainKind::Ganache).unwrap();
        assert_eq!(found.chain, ChainKind::Geth);

        assert!(matches!(
            manager.find("missing", ChainKind::Geth),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn by_id_surfaces_missing_archive() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());
        let details = manager.take(ChainKind::Geth, data.path(), "vanishing").unwrap();

        std::fs::remove_file(&details.path).unwrap();
        assert!(matches!(
            manager.by_id(&details.id),
            Err(SnapshotError::MissingArchive(_))
        ));
    }

    #[test]
    fn repair_scan_drops_stale_rows() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let id;
        {
            let manager = manager(root.path());
            let details = manager.take(ChainKind::Geth, data.path(), "stale").unwrap();
            id = details.id.clone();
            std::fs::remove_file(&details.path).unwrap();
        }
        let manager = manager(root.path());
        assert!(manager.list().unwrap().is_empty());
        assert!(matches!(
            manager.by_id(&id),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn by_chain_filters() {
        let root = tempfile::tempdir().unwrap();
        let data = seeded_data_dir();
        let manager = manager(root.path());
        manager.take(ChainKind::Geth, data.path(), "g1").unwrap();
        manager.take(ChainKind::Ganache, data.path(), "n1").unwrap();

        let geth = manager.by_chain(ChainKind::Geth).unwrap();
        assert_eq!(geth.len(), 1);
        assert_eq!(geth[0].description, "g1");
    }
}
