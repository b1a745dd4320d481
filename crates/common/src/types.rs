// Common types for the SSH forward daemon

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authentication method for the SSH connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Username/password authentication
    Password,
    /// Private key authentication (key read from disk)
    Key,
}

/// Kind of port forwarding a tunnel performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Local port forwarding (bind local port, forward to remote)
    Local,
    /// Remote port forwarding (bind server-side port, forward back to local)
    Remote,
    /// Dynamic port forwarding (local SOCKS5 proxy)
    Dynamic,
}

/// Lifecycle status of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// SSH handshake/auth in progress, forward not yet bound
    Connecting,
    /// Forwarding is bound and serving connections
    Active,
    /// Handshake, auth, or bind failed
    Error,
    /// Session ended while the tunnel was active
    Disconnected,
    /// Stopped by the caller
    Stopped,
}

impl TunnelStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Active)
    }

    /// Terminal states never transition back to active; a new attempt is a
    /// new record with a new id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Error | TunnelStatus::Disconnected | TunnelStatus::Stopped
        )
    }
}

/// Severity of a tunnel log line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry in a tunnel's log ring buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Events emitted by the daemon to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TunnelEvent {
    /// Tunnel status changed
    TunnelStatus {
        tunnel_id: String,
        status: TunnelStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A log line was appended to a tunnel's ring buffer
    TunnelLog { tunnel_id: String, log: LogEntry },

    /// Tunnel record was removed from the registry
    TunnelRemoved { tunnel_id: String },
}

/// Reduced projection of a tunnel, returned by the list operation.
/// Excludes logs so listings stay cheap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub status: TunnelStatus,
    pub connections: u64,
    pub ssh_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

/// Full view of one tunnel, returned by the status operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDetail {
    pub id: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub status: TunnelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub connections: u64,
    pub created_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub forwarding: crate::config::ForwardingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TunnelStatus::Connecting.is_terminal());
        assert!(!TunnelStatus::Active.is_terminal());
        assert!(TunnelStatus::Error.is_terminal());
        assert!(TunnelStatus::Disconnected.is_terminal());
        assert!(TunnelStatus::Stopped.is_terminal());
    }

    #[test]
    fn event_serialization_tags() {
        let event = TunnelEvent::TunnelStatus {
            tunnel_id: "tun-1".to_string(),
            status: TunnelStatus::Active,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tunnel-status\""));
        assert!(json.contains("\"status\":\"active\""));
        assert!(!json.contains("error"));

        let event = TunnelEvent::TunnelRemoved {
            tunnel_id: "tun-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tunnel-removed\""));
    }
}
