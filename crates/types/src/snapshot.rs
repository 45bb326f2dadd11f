use crate::chain::ChainKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata describing one archive-based snapshot of a chain data directory.
///
/// The `id` equals the archive's base filename; snapshots with an empty
/// `description` are kept on disk but never indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDetails {
    /// Snapshot identifier, a 64-bit random integer rendered as decimal.
    pub id: String,
    /// EVM implementation the data directory belongs to.
    pub chain: ChainKind,
    /// Operator-supplied description; empty for transient snapshots.
    #[serde(default)]
    pub description: String,
    /// Absolute path of the gzipped tar archive.
    pub path: PathBuf,
    /// Time the archive was created.
    pub created_at: DateTime<Utc>,
}

impl SnapshotDetails {
    /// Create details for a freshly written archive.
    pub fn new(
        id: impl Into<String>,
        chain: ChainKind,
        description: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            chain,
            description: description.into(),
            path: path.into(),
            created_at: Utc::now(),
        }
    }

    /// Transient snapshots are archived but not recorded in the index.
    pub fn is_transient(&self) -> bool {
        self.description.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_when_description_empty() {
        let details = SnapshotDetails::new("1", ChainKind::Geth, "", "/tmp/snapshots/1.tgz");
        assert!(details.is_transient());
        let details = SnapshotDetails::new("2", ChainKind::Geth, "before upgrade", "/tmp/2.tgz");
        assert!(!details.is_transient());
    }

    #[test]
    fn serde_round_trip() {
        let details =
            SnapshotDetails::new("42", ChainKind::Ganache, "baseline", "/tmp/snapshots/42.tgz");
        let json = serde_json::to_string(&details).unwrap();
        let back: SnapshotDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, details);
    }
}
