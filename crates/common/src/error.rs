// Error types for the SSH forward daemon

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Local port {0}:{1} is already in use")]
    PortInUse(String, u16),

    #[error("SSH connection error: {0}")]
    SshConnection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
