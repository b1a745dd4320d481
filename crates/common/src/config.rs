// Tunnel configuration structures and request validation

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::types::{AuthType, TunnelType};

/// Complete configuration for one tunnel, supplied with every start request.
/// Tunnel definitions are not persisted; a terminated tunnel must be
/// re-created by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub connection: ConnectionConfig,
    pub forwarding: ForwardingConfig,
}

/// SSH endpoint and authentication material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub user: String,
    /// Authentication type
    pub auth_type: AuthType,
    /// Password (for password auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to the SSH private key (for key auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Port forwarding parameters. Field roles per tunnel type:
/// local   - bind `local_host:local_port`, forward to `remote_host:remote_port`
/// remote  - server binds `bind_host:remote_port`, forward back to `local_host:local_port`
/// dynamic - bind a SOCKS5 proxy on `local_host:local_port`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Server-side bind address for remote forwards
    #[serde(default = "default_local_host")]
    pub bind_host: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

impl TunnelConfig {
    /// Validate the request before any network activity is attempted
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(Error::Config("SSH host is required".to_string()));
        }
        if self.connection.user.is_empty() {
            return Err(Error::Config("SSH user is required".to_string()));
        }
        if self.connection.port == 0 {
            return Err(Error::Config("SSH port must be greater than 0".to_string()));
        }

        // Exactly one of password / private key
        if self.connection.password.is_some() && self.connection.key_path.is_some() {
            return Err(Error::Config(
                "Provide either a password or a private key path, not both".to_string(),
            ));
        }
        match self.connection.auth_type {
            AuthType::Password if self.connection.password.is_none() => {
                return Err(Error::Config(
                    "Password required for password authentication".to_string(),
                ));
            }
            AuthType::Key if self.connection.key_path.is_none() => {
                return Err(Error::Config(
                    "Key path required for key authentication".to_string(),
                ));
            }
            _ => {}
        }

        match self.forwarding.tunnel_type {
            TunnelType::Local => {
                if self.forwarding.local_port.is_none() {
                    return Err(Error::Config(
                        "Local port required for local forwarding".to_string(),
                    ));
                }
                if self.forwarding.remote_host.is_none() {
                    return Err(Error::Config(
                        "Remote host required for local forwarding".to_string(),
                    ));
                }
                if self.forwarding.remote_port.is_none() {
                    return Err(Error::Config(
                        "Remote port required for local forwarding".to_string(),
                    ));
                }
            }
            TunnelType::Remote => {
                if self.forwarding.local_port.is_none() {
                    return Err(Error::Config(
                        "Local port required for remote forwarding".to_string(),
                    ));
                }
                if self.forwarding.remote_port.is_none() {
                    return Err(Error::Config(
                        "Remote port required for remote forwarding".to_string(),
                    ));
                }
            }
            TunnelType::Dynamic => {
                if self.forwarding.local_port.is_none() {
                    return Err(Error::Config(
                        "Local port required for dynamic forwarding".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// The local bind target, present for tunnel types that own a listener
    pub fn local_bind(&self) -> Option<(&str, u16)> {
        match self.forwarding.tunnel_type {
            TunnelType::Local | TunnelType::Dynamic => self
                .forwarding
                .local_port
                .map(|port| (self.forwarding.local_host.as_str(), port)),
            TunnelType::Remote => None,
        }
    }
}
