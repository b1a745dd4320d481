// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// Network utility functions

use std::net::IpAddr;

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    // Handle "localhost" as special case
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Try parsing as IpAddr (handles "127.0.0.1", "::1", etc.)
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Fail-safe: if we can't parse it, assume non-loopback for security
    false
}

/// Format host and port as a connect/bind string, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Probe whether (host, port) can be bound right now. The bind is transient;
/// the listener is dropped immediately. Any bind failure resolves to false,
/// it is never surfaced as an error.
pub fn is_port_available(host: &str, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_ok()
}
