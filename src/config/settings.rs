//! Tunnel Server Settings
//!
//! Server address, port and token come from an optional `config.ini` that
//! ships next to the executable:
//!
//! ```ini
//! [frp_server]
//! frps_addr = 203.0.113.10
//! frps_port = 7000
//! frps_token = secret
//! ```
//!
//! The file is only ever read. A missing or malformed file yields the
//! built-in defaults.

use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

const SECTION: &str = "frp_server";

pub const DEFAULT_SERVER_ADDR: &str = "your_frp_server_ip_address";
pub const DEFAULT_SERVER_PORT: u16 = 7000;
pub const DEFAULT_SERVER_TOKEN: &str = "your_frp_server_secure_token";

/// Host shown to users when the built-in placeholder address is in use
pub const DEFAULT_PUBLIC_HOST: &str = "www.esun21.com";

/// Connection parameters for the frp server
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub addr: String,
    pub port: u16,
    pub token: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            port: DEFAULT_SERVER_PORT,
            token: DEFAULT_SERVER_TOKEN.to_string(),
        }
    }
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl ServerSettings {
    /// Load settings from an INI file, falling back to defaults
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Some(settings) => {
                    info!(
                        "Loaded tunnel server settings from {}: {}:{}",
                        path.display(),
                        settings.addr,
                        settings.port
                    );
                    settings
                }
                None => {
                    warn!(
                        "Malformed settings file {}, using defaults",
                        path.display()
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read settings file {}: {}, using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Parse INI content. Missing keys take their default; an unparseable
    /// port rejects the whole file.
    pub fn parse(content: &str) -> Option<Self> {
        let mut settings = Self::default();
        let mut in_section = false;

        for raw in content.lines() {
            let line = raw.trim().trim_start_matches('\u{feff}');
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = name.trim() == SECTION;
                continue;
            }

            if !in_section {
                continue;
            }

            let (key, value) = line.split_once('=').or_else(|| line.split_once(':'))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "frps_addr" => settings.addr = value.to_string(),
                "frps_port" => settings.port = value.parse().ok()?,
                "frps_token" => settings.token = value.to_string(),
                _ => {}
            }
        }

        Some(settings)
    }

    /// True when the placeholder server address has not been replaced
    pub fn is_placeholder(&self) -> bool {
        self.addr == DEFAULT_SERVER_ADDR
    }

    /// The address users connect to for a given public port
    pub fn public_address(&self, remote_port: u16) -> String {
        let host = if self.is_placeholder() {
            DEFAULT_PUBLIC_HOST
        } else {
            self.addr.as_str()
        };
        format!("{}:{}", host, remote_port)
    }
}
