use crate::chain::{ChainDetails, ChainStatus};
use crate::snapshot::SnapshotDetails;
use serde::{Deserialize, Serialize};

/// Payload of one notification bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChainEventKind {
    /// The EVM answered its readiness probe and serves RPC traffic.
    Started(ChainDetails),
    /// The EVM exited and all chain resources were released.
    Stopped,
    /// An asynchronous failure; the chain may have transitioned to `failed`.
    Error { message: String },
    /// An archive snapshot of the data directory was written.
    SnapshotTaken(SnapshotDetails),
    /// The data directory was restored from an archive snapshot.
    SnapshotReverted(SnapshotDetails),
    /// The worker moved to a new lifecycle status.
    StatusChanged(ChainStatus),
    /// Marker injected when a subscriber fell behind and events were dropped.
    Lag { missed: u64 },
}

impl ChainEventKind {
    /// Wire name of the event, as seen by gateway clients.
    pub fn name(&self) -> &'static str {
        match self {
            ChainEventKind::Started(_) => "started",
            ChainEventKind::Stopped => "stopped",
            ChainEventKind::Error { .. } => "error",
            ChainEventKind::SnapshotTaken(_) => "snapshot_taken",
            ChainEventKind::SnapshotReverted(_) => "snapshot_reverted",
            ChainEventKind::StatusChanged(_) => "status_changed",
            ChainEventKind::Lag { .. } => "lag",
        }
    }
}

/// One event published on a chain topic and fanned into the `api` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Chain the event belongs to.
    pub chain_id: String,
    /// Event payload.
    #[serde(flatten)]
    pub kind: ChainEventKind,
}

impl ChainEvent {
    pub fn new(chain_id: impl Into<String>, kind: ChainEventKind) -> Self {
        Self {
            chain_id: chain_id.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        assert_eq!(ChainEventKind::Stopped.name(), "stopped");
        assert_eq!(
            ChainEventKind::StatusChanged(ChainStatus::Active).name(),
            "status_changed"
        );
        assert_eq!(ChainEventKind::Lag { missed: 3 }.name(), "lag");
    }

    #[test]
    fn event_json_shape() {
        let event = ChainEvent::new(
            "12345",
            ChainEventKind::Error {
                message: "boom".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["chain_id"], "12345");
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["message"], "boom");
    }

    #[test]
    fn status_changed_payload() {
        let event = ChainEvent::new(
            "1",
            ChainEventKind::StatusChanged(ChainStatus::Terminating),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["data"], "terminating");
    }
}
