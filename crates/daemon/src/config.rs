// SSH Forward Daemon - Daemon Config Module
// Handles daemon configuration (listener mode, bind address)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use ssh_forward_common::is_loopback_address;

/// Get the runtime directory for daemon state
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir().ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Get the socket path for the daemon
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("ssh-forward.sock"))
}

/// Listener mode for the daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    UnixSocket,
    /// TCP with HTTP (loopback-only; the control API carries no encryption)
    TcpHttp,
}

impl Default for ListenerMode {
    fn default() -> Self {
        ListenerMode::UnixSocket
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Listener mode (UnixSocket or TcpHttp)
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind address for TCP mode (e.g., "127.0.0.1:3443")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:3443".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_address: default_bind_address(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration. Plaintext TCP is confined to
    /// loopback addresses.
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp {
            let host = self
                .bind_address
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(self.bind_address.as_str());
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if !is_loopback_address(host) {
                anyhow::bail!(
                    "Refusing non-loopback bind address {} for tcp-http: the control API has \
                     no encryption. Use a loopback address or the unix socket listener.",
                    self.bind_address
                );
            }
        }
        Ok(())
    }

    /// Load daemon configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load daemon configuration from file, writing defaults on first run
    fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!(
            "Loaded daemon configuration from: {}",
            config_path.display()
        );
        Ok(config)
    }

    /// Save daemon configuration to file
    fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("ssh-forward").join("daemon.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unix_socket() {
        let config = DaemonConfig::default();
        assert_eq!(config.listener_mode, ListenerMode::UnixSocket);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tcp_http_loopback_allowed() {
        let config = DaemonConfig {
            listener_mode: ListenerMode::TcpHttp,
            bind_address: "127.0.0.1:3443".to_string(),
        };
        assert!(config.validate().is_ok());

        let config = DaemonConfig {
            listener_mode: ListenerMode::TcpHttp,
            bind_address: "localhost:3443".to_string(),
        };
        assert!(config.validate().is_ok());

        let config = DaemonConfig {
            listener_mode: ListenerMode::TcpHttp,
            bind_address: "[::1]:3443".to_string(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tcp_http_non_loopback_rejected() {
        let config = DaemonConfig {
            listener_mode: ListenerMode::TcpHttp,
            bind_address: "0.0.0.0:3443".to_string(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("non-loopback"));

        let config = DaemonConfig {
            listener_mode: ListenerMode::TcpHttp,
            bind_address: "192.168.1.100:3443".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.listener_mode, ListenerMode::UnixSocket);
        assert!(path.exists());

        // The written file loads back identically
        let reloaded = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.listener_mode, config.listener_mode);
        assert_eq!(reloaded.bind_address, config.bind_address);
    }

    #[test]
    fn custom_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(
            &path,
            "listener_mode = \"tcp-http\"\nbind_address = \"127.0.0.1:4000\"\n",
        )
        .unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.listener_mode, ListenerMode::TcpHttp);
        assert_eq!(config.bind_address, "127.0.0.1:4000");
    }
}
