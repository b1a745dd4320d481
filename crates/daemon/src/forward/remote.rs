// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// Remote port forwarding (-R): the server listens on bind_host:remote_port
// and every server-notified connection is piped back to a local destination.
// The route slot is per session, shared with the client handler that
// receives the forwarded-tcpip channels.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use russh::client::Msg;
use russh::Channel;

use ssh_forward_common::{format_host_port, Error, LogLevel};

use crate::registry::TunnelRegistry;
use crate::session::SessionController;

/// Where forwarded connections for this session are piped to
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub local_host: String,
    pub local_port: u16,
}

/// Slot shared between the forward and the session's client handler. Empty
/// until the server acknowledges the bind; cleared on stop.
pub type RemoteRoute = Arc<RwLock<Option<RemoteTarget>>>;

/// Request the server-side bind. Returning Ok means the server acknowledged;
/// the caller flips the tunnel to active on that signal. Returns the port
/// the server actually bound (it may differ when 0 was requested).
pub async fn start(
    registry: &TunnelRegistry,
    session: &SessionController,
    tunnel_id: &str,
    bind_host: &str,
    remote_port: u16,
    local_host: &str,
    local_port: u16,
    route: &RemoteRoute,
) -> Result<u16, Error> {
    let bound_port = session.tcpip_forward(bind_host, remote_port as u32).await?;

    *route.write().await = Some(RemoteTarget {
        local_host: local_host.to_string(),
        local_port,
    });

    info!(
        tunnel = %tunnel_id,
        "remote forward bound on server {}:{}", bind_host, bound_port
    );
    registry
        .add_log(
            tunnel_id,
            LogLevel::Info,
            format!(
                "Server listening on {}:{}, forwarding to {}:{}",
                bind_host, bound_port, local_host, local_port
            ),
        )
        .await;

    Ok(bound_port as u16)
}

/// Handle one server-notified connection: connect to the local destination
/// and pipe. A failure to reach the destination closes only this channel.
pub async fn handle_forwarded_connection(
    registry: TunnelRegistry,
    tunnel_id: String,
    route: RemoteRoute,
    channel: Channel<Msg>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let target = match route.read().await.clone() {
        Some(target) => target,
        // Forward already cancelled; refuse the stray channel
        None => {
            let _ = channel.close().await;
            return;
        }
    };

    registry.connection_opened(&tunnel_id).await;

    let local_addr = format_host_port(&target.local_host, target.local_port);
    match TcpStream::connect(&local_addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            registry
                .add_log(
                    &tunnel_id,
                    LogLevel::Debug,
                    format!("Forwarded connection piped to {}", local_addr),
                )
                .await;
            super::pipe(stream, channel, &registry, &tunnel_id, shutdown_rx).await;
        }
        Err(e) => {
            registry
                .add_log(
                    &tunnel_id,
                    LogLevel::Warn,
                    format!("Local destination {} unreachable: {}", local_addr, e),
                )
                .await;
            let _ = channel.close().await;
        }
    }

    registry.connection_closed(&tunnel_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn route_slot_set_and_cleared() {
        let route: RemoteRoute = Arc::new(RwLock::new(None));
        assert!(route.read().await.is_none());

        *route.write().await = Some(RemoteTarget {
            local_host: "127.0.0.1".to_string(),
            local_port: 3000,
        });
        let target = route.read().await.clone().unwrap();
        assert_eq!(target.local_host, "127.0.0.1");
        assert_eq!(target.local_port, 3000);

        *route.write().await = None;
        assert!(route.read().await.is_none());
    }
}
