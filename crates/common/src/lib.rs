// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// SSH Forward Daemon - Common Library
// Shared tunnel types, request validation, and network helpers

pub mod config;
pub mod error;
pub mod network;
pub mod types;

pub use config::{ConnectionConfig, ForwardingConfig, TunnelConfig};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address, is_port_available};
pub use types::{
    AuthType, LogEntry, LogLevel, TunnelDetail, TunnelEvent, TunnelStatus, TunnelSummary,
    TunnelType,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
