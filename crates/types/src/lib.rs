//! # Testchain Types
//!
//! Shared data model for the testchain chain manager: chain configuration,
//! account records, lifecycle status, snapshot metadata and the event types
//! carried by the notification bus.

pub mod account;
pub mod chain;
pub mod events;
pub mod snapshot;

pub use account::*;
pub use chain::*;
pub use events::*;
pub use snapshot::*;
