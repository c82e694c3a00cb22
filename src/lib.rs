//! Remote Console Library
//!
//! Publishes local serial devices and TCP services through an frp tunnel
//! server. A serial device is first exposed as a local TCP endpoint by a
//! [`bridge::SerialBridge`]; each mapping then gets its own `frpc` process
//! managed by the [`ConnectionManager`].

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod shutdown;
pub mod tunnel;

pub use config::{Config, ServerSettings};
pub use connection::{ConnectionManager, ConnectionStatus, MappingRequest};
pub use error::ConnectionError;
pub use events::{ConnectionEvent, EventBus};
pub use shutdown::ShutdownCoordinator;

/// Common result type for fallible setup and I/O
pub type Result<T> = anyhow::Result<T>;
