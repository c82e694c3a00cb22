//! Connection Management Module
//!
//! Tracks tunnel mappings and drives their lifecycle.

pub mod manager;
pub mod types;

pub use manager::{ConnectionManager, ShutdownReport, StopOutcome};
pub use types::{derive_bridge_port, ConnectionInfo, ConnectionStatus, LocalTarget, MappingRequest};
