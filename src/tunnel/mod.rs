//! Tunnel Client Module
//!
//! Config file generation and frpc process supervision.

pub mod signature;
pub mod supervisor;
pub mod writer;

pub use signature::{conflicting_proxy, is_proxy_conflict};
pub use supervisor::{SupervisorHooks, TunnelSupervisor};
pub use writer::{ConfigArtifact, ConfigWriter, ProxySpec};
