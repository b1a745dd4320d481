// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// Port forwarding strategies: one SSH session, one forwarding behavior.
// Local and dynamic own a TCP listener; remote registers a server-side bind.

pub mod dynamic;
pub mod local;
pub mod remote;
pub mod socks;

use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use ssh_forward_common::LogLevel;

use crate::registry::TunnelRegistry;

/// Pipe one TCP stream and one SSH channel into each other until either side
/// ends or the tunnel is stopped. copy_bidirectional only reads as fast as
/// the opposite side accepts writes, so a slow consumer stalls its producer
/// instead of growing a buffer.
pub(crate) async fn pipe(
    mut stream: TcpStream,
    channel: Channel<Msg>,
    registry: &TunnelRegistry,
    tunnel_id: &str,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut channel_stream = channel.into_stream();
    tokio::select! {
        _ = shutdown_rx.recv() => {
            registry
                .add_log(tunnel_id, LogLevel::Debug, "Connection severed by stop")
                .await;
        }
        result = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream) => match result {
            Ok((sent, received)) => {
                registry
                    .add_log(
                        tunnel_id,
                        LogLevel::Debug,
                        format!("Connection closed: {} bytes sent, {} bytes received", sent, received),
                    )
                    .await;
            }
            Err(e) => {
                registry
                    .add_log(tunnel_id, LogLevel::Debug, format!("Connection ended: {}", e))
                    .await;
            }
        },
    }
}
