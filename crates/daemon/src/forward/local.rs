// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// Local port forwarding (-L): accept on a local listener, open a direct-tcpip
// channel to the configured destination for every inbound socket

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use ssh_forward_common::{format_host_port, Error, LogLevel, TunnelStatus};

use crate::registry::TunnelRegistry;
use crate::session::SessionController;

/// Channel-open failures in a row before the session is presumed dead
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Bind the listener and spawn the accept loop. Returning Ok means the bind
/// succeeded; the caller flips the tunnel to active on that signal.
pub async fn start(
    registry: TunnelRegistry,
    session: SessionController,
    tunnel_id: String,
    local_host: &str,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<JoinHandle<()>, Error> {
    let listener = bind_listener(local_host, local_port).await?;
    let bound_addr = listener.local_addr()?;

    info!(tunnel = %tunnel_id, "local forward listening on {}", bound_addr);
    registry
        .add_log(
            &tunnel_id,
            LogLevel::Info,
            format!(
                "Listening on {}, forwarding to {}:{}",
                bound_addr, remote_host, remote_port
            ),
        )
        .await;

    Ok(tokio::spawn(accept_loop(
        registry,
        session,
        tunnel_id,
        listener,
        remote_host,
        remote_port,
        shutdown_tx,
    )))
}

/// Bind with error shaping: address-in-use and privileged-port failures get
/// actionable messages
pub(crate) async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, Error> {
    let addr = format_host_port(host, port);
    TcpListener::bind(&addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => Error::PortInUse(host.to_string(), port),
        std::io::ErrorKind::PermissionDenied => Error::Config(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        _ => Error::Tunnel(format!("Failed to bind to {}: {}", addr, e)),
    })
}

async fn accept_loop(
    registry: TunnelRegistry,
    session: SessionController,
    tunnel_id: String,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            accept_result = listener.accept() => match accept_result {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    registry
                        .add_log(
                            &tunnel_id,
                            LogLevel::Debug,
                            format!("Accepted connection from {}", peer_addr),
                        )
                        .await;

                    match session
                        .open_direct_tcpip(
                            &remote_host,
                            remote_port as u32,
                            &peer_addr.ip().to_string(),
                            peer_addr.port() as u32,
                        )
                        .await
                    {
                        Ok(channel) => {
                            consecutive_failures = 0;
                            registry.connection_opened(&tunnel_id).await;

                            let registry = registry.clone();
                            let tunnel_id = tunnel_id.clone();
                            let conn_shutdown = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                super::pipe(stream, channel, &registry, &tunnel_id, conn_shutdown)
                                    .await;
                                registry.connection_closed(&tunnel_id).await;
                            });
                        }
                        // A single failed channel closes only this socket
                        Err(e) => {
                            consecutive_failures += 1;
                            registry
                                .add_log(
                                    &tunnel_id,
                                    LogLevel::Warn,
                                    format!(
                                        "Channel open failed ({}/{}): {}",
                                        consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                                    ),
                                )
                                .await;

                            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                                registry
                                    .update_status(
                                        &tunnel_id,
                                        TunnelStatus::Error,
                                        Some(format!(
                                            "SSH session appears dead after {} consecutive channel failures",
                                            MAX_CONSECUTIVE_FAILURES
                                        )),
                                    )
                                    .await;
                                let _ = shutdown_tx.send(());
                                session.disconnect().await;
                                break;
                            }
                        }
                    }
                }
                // Listener-level failure is terminal for the tunnel
                Err(e) => {
                    registry
                        .update_status(
                            &tunnel_id,
                            TunnelStatus::Error,
                            Some(format!("Listener failed: {}", e)),
                        )
                        .await;
                    let _ = shutdown_tx.send(());
                    session.disconnect().await;
                    break;
                }
            }
        }
    }
}
