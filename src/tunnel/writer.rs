//! Tunnel Client Configuration Writer
//!
//! Renders one mapping into the INI file frpc reads:
//!
//! ```ini
//! [common]
//! server_addr = <address>
//! server_port = <port>
//! authentication_method = token
//! token = <token>
//!
//! [proxy_<remotePort>]
//! type = tcp
//! local_ip = <ip>
//! local_port = <port>
//! remote_port = <remotePort>
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tempfile::TempPath;
use tracing::debug;

use crate::config::ServerSettings;
use crate::Result;

/// The local side of one proxy entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
}

/// A generated configuration file. Deleted when dropped.
#[derive(Debug)]
pub struct ConfigArtifact {
    path: TempPath,
}

impl ConfigArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now, reporting failure
    pub fn delete(self) -> std::io::Result<()> {
        self.path.close()
    }
}

/// Writes fresh configuration files into one directory
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    dir: PathBuf,
}

impl ConfigWriter {
    /// Write into `dir`, or the system temp directory
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir: dir.unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn render(server: &ServerSettings, proxy: &ProxySpec) -> String {
        format!(
            "[common]\n\
             server_addr = {}\n\
             server_port = {}\n\
             authentication_method = token\n\
             token = {}\n\
             \n\
             [proxy_{}]\n\
             type = tcp\n\
             local_ip = {}\n\
             local_port = {}\n\
             remote_port = {}\n",
            server.addr,
            server.port,
            server.token,
            proxy.remote_port,
            proxy.local_ip,
            proxy.local_port,
            proxy.remote_port,
        )
    }

    /// Write a new uniquely named file. Never touches existing files.
    pub fn write(&self, server: &ServerSettings, proxy: &ProxySpec) -> Result<ConfigArtifact> {
        for (name, value) in [
            ("server address", server.addr.as_str()),
            ("token", server.token.as_str()),
            ("local ip", proxy.local_ip.as_str()),
        ] {
            if value.contains(&['\n', '\r'][..]) {
                bail!("{} must be a single line", name);
            }
        }

        let mut file = tempfile::Builder::new()
            .prefix(&format!("frpc_{}_", proxy.remote_port))
            .suffix(".ini")
            .tempfile_in(&self.dir)
            .with_context(|| format!("Failed to create config file in {}", self.dir.display()))?;

        file.write_all(Self::render(server, proxy).as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("Failed to write {}", file.path().display()))?;

        let path = file.into_temp_path();
        debug!(remote_port = proxy.remote_port, "Wrote tunnel config {}", path.display());
        Ok(ConfigArtifact { path })
    }
}
