//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub bridge: BridgeConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

/// Tunnel client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path to the frpc executable
    pub executable: PathBuf,
    /// Where generated frpc configuration files go (system temp dir if unset)
    pub artifact_dir: Option<PathBuf>,
    /// How long a terminated tunnel client gets before it is killed
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,
    /// Read-only INI file supplying server address, port and token
    pub settings_file: PathBuf,
}

/// Serial bridge configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_host: IpAddr,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub socket_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    pub buffer_size: usize,
    /// Bridge ports are `port_base + remote_port % port_span`
    pub port_base: u16,
    pub port_span: u16,
    pub default_baud_rate: u32,
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            executable: default_tunnel_executable(),
            artifact_dir: None,
            terminate_timeout: Duration::from_secs(5),
            settings_file: app_dir().join("config.ini"),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(1),
            socket_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(2),
            buffer_size: 1024,
            port_base: 20000,
            port_span: 1000,
            default_baud_rate: 115200,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Directory holding the running executable, or the working directory
pub fn app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// A bundled frpc next to the executable wins over one found on PATH
fn default_tunnel_executable() -> PathBuf {
    let name = if cfg!(windows) { "frpc.exe" } else { "frpc" };
    let bundled = app_dir().join(name);
    if bundled.exists() {
        bundled
    } else {
        PathBuf::from(name)
    }
}
