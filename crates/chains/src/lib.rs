//! # Testchain Chains
//!
//! The chain manager core: lifecycle of local Ethereum test chains as
//! supervised child processes.
//!
//! - [`ChainManager`] is the public facade: start, stop, snapshot, mine
//!   toggles, details and liveness.
//! - Each chain runs under its own serialized worker with a bounded kill
//!   timeout; ids, TCP ports and data directories are allocated once and
//!   owned exclusively while the chain lives.
//! - Lifecycle events fan out on the [`bus::NotificationBus`] per chain and
//!   on the shared `api` topic.

pub mod accounts;
pub mod adapter;
pub mod allocator;
pub mod bus;
pub mod config;
pub mod error;
pub mod facade;
mod ganache;
mod geth;
pub mod registry;
pub mod rpc;
pub mod supervisor;
pub mod worker;

pub use adapter::EvmAdapter;
pub use allocator::ResourceAllocator;
pub use bus::{EventStream, NotificationBus, Topic};
pub use config::{ManagerConfig, ResolvedChainConfig};
pub use error::ChainError;
pub use facade::ChainManager;
pub use registry::{ChainEntry, ChainRegistry};
pub use supervisor::ChainSupervisor;
pub use worker::{ChainCommand, WorkerExit};

pub use testchain_types as types;
