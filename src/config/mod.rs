//! Configuration Module
//!
//! Handles configuration loading, validation, and the read-only tunnel
//! server settings.

pub mod manager;
pub mod settings;
pub mod types;

pub use manager::ConfigManager;
pub use settings::ServerSettings;
pub use types::*;
