//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields of `config` from `REMOTE_CONSOLE_*` variables
    pub fn apply_env(config: &mut Config) -> Result<()> {
        if let Ok(executable) = std::env::var("REMOTE_CONSOLE_FRPC") {
            config.tunnel.executable = PathBuf::from(executable);
        }

        if let Ok(dir) = std::env::var("REMOTE_CONSOLE_ARTIFACT_DIR") {
            config.tunnel.artifact_dir = Some(PathBuf::from(dir));
        }

        if let Ok(settings) = std::env::var("REMOTE_CONSOLE_SETTINGS_FILE") {
            config.tunnel.settings_file = PathBuf::from(settings);
        }

        if let Ok(timeout) = std::env::var("REMOTE_CONSOLE_TERMINATE_TIMEOUT") {
            config.tunnel.terminate_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid REMOTE_CONSOLE_TERMINATE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("REMOTE_CONSOLE_SHUTDOWN_TIMEOUT") {
            config.shutdown.timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid REMOTE_CONSOLE_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Ok(baud) = std::env::var("REMOTE_CONSOLE_BAUD_RATE") {
            config.bridge.default_baud_rate = baud
                .parse::<u32>()
                .with_context(|| format!("Invalid REMOTE_CONSOLE_BAUD_RATE: {}", baud))?;
        }

        if let Ok(log_level) = std::env::var("REMOTE_CONSOLE_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_tunnel_config()
            .with_context(|| "Tunnel configuration validation failed")?;

        self.validate_bridge_config()
            .with_context(|| "Bridge configuration validation failed")?;

        self.validate_shutdown_config()
            .with_context(|| "Shutdown configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_tunnel_config(&self) -> Result<()> {
        if self.tunnel.executable.as_os_str().is_empty() {
            bail!("tunnel.executable must not be empty");
        }

        if self.tunnel.terminate_timeout.is_zero() {
            bail!("tunnel.terminate_timeout must be greater than 0");
        }

        if self.tunnel.terminate_timeout.as_secs() > 300 {
            bail!("tunnel.terminate_timeout cannot exceed 5 minutes");
        }

        Ok(())
    }

    fn validate_bridge_config(&self) -> Result<()> {
        let bridge = &self.bridge;

        // Every cancellation check happens at one of these intervals
        for (name, value) in [
            ("read_timeout", bridge.read_timeout),
            ("socket_timeout", bridge.socket_timeout),
        ] {
            if value.is_zero() || value.as_secs() >= 1 {
                bail!("bridge.{} must be between 1ms and 1s", name);
            }
        }

        if bridge.write_timeout.is_zero() {
            bail!("bridge.write_timeout must be greater than 0");
        }

        if bridge.stop_timeout.is_zero() {
            bail!("bridge.stop_timeout must be greater than 0");
        }

        if bridge.buffer_size == 0 || bridge.buffer_size > 1048576 {
            bail!("bridge.buffer_size must be between 1 byte and 1MB");
        }

        if bridge.port_span == 0 {
            bail!("bridge.port_span must be greater than 0");
        }

        if u32::from(bridge.port_base) + u32::from(bridge.port_span) > 65536 {
            bail!(
                "bridge.port_base + bridge.port_span cannot exceed 65536 (got {} + {})",
                bridge.port_base,
                bridge.port_span
            );
        }

        if bridge.port_base == 0 {
            bail!("bridge.port_base must be greater than 0");
        }

        if bridge.default_baud_rate == 0 {
            bail!("bridge.default_baud_rate must be greater than 0");
        }

        Ok(())
    }

    fn validate_shutdown_config(&self) -> Result<()> {
        if self.shutdown.poll_interval.is_zero() {
            bail!("shutdown.poll_interval must be greater than 0");
        }

        if self.shutdown.timeout < self.shutdown.poll_interval {
            bail!("shutdown.timeout must be at least shutdown.poll_interval");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        frpc: Option<&Path>,
        settings_file: Option<&Path>,
        artifact_dir: Option<&Path>,
        terminate_timeout: Option<u64>,
    ) {
        if let Some(frpc) = frpc {
            self.tunnel.executable = frpc.to_path_buf();
            tracing::info!("CLI override: tunnel executable set to {}", frpc.display());
        }

        if let Some(settings_file) = settings_file {
            self.tunnel.settings_file = settings_file.to_path_buf();
            tracing::info!(
                "CLI override: settings file set to {}",
                settings_file.display()
            );
        }

        if let Some(dir) = artifact_dir {
            self.tunnel.artifact_dir = Some(dir.to_path_buf());
            tracing::info!("CLI override: artifact directory set to {}", dir.display());
        }

        if let Some(timeout_secs) = terminate_timeout {
            self.tunnel.terminate_timeout = std::time::Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: terminate timeout set to {}s", timeout_secs);
        }
    }
}
