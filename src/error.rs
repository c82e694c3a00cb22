//! Error types for connection lifecycle operations

use thiserror::Error;

/// Why a connection operation was refused or failed.
///
/// Validation variants are raised before any resource is touched. The
/// acquisition variants mean a start was aborted and rolled back.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Public port {0} is out of range (1-65535)")]
    InvalidRemotePort(u32),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {value}")]
    InvalidInput { field: &'static str, value: String },

    #[error("A mapping for public port {0} already exists")]
    DuplicateRemotePort(u16),

    #[error("Bridge port {bridge_port} for public port {remote_port} is already used by public port {existing}")]
    BridgePortCollision {
        remote_port: u16,
        bridge_port: u16,
        existing: u16,
    },

    #[error("No mapping for public port {0}")]
    NotFound(u16),

    #[error("Failed to open serial port {device}: {source}")]
    SerialOpen {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to bind bridge port {port}: {source}")]
    BridgeBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write tunnel configuration: {0}")]
    ConfigWrite(#[source] anyhow::Error),

    #[error("Failed to launch tunnel client: {0}")]
    Spawn(#[source] anyhow::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ConnectionError {
    /// True for errors raised before any resource was acquired
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConnectionError::InvalidRemotePort(_)
                | ConnectionError::MissingField(_)
                | ConnectionError::InvalidInput { .. }
                | ConnectionError::DuplicateRemotePort(_)
                | ConnectionError::BridgePortCollision { .. }
        )
    }
}
