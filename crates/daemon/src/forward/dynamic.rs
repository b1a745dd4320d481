// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// Dynamic forwarding (-D): a local SOCKS5 proxy whose destination is chosen
// per connection by the client, then carried over a direct-tcpip channel

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use ssh_forward_common::{Error, LogLevel, TunnelStatus};

use super::socks::{self, SocksError};
use crate::registry::TunnelRegistry;
use crate::session::SessionController;

/// Bind the SOCKS5 listener and spawn the accept loop. Returning Ok means
/// the bind succeeded; the caller flips the tunnel to active on that signal.
pub async fn start(
    registry: TunnelRegistry,
    session: SessionController,
    tunnel_id: String,
    local_host: &str,
    local_port: u16,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<JoinHandle<()>, Error> {
    let listener = super::local::bind_listener(local_host, local_port).await?;
    let bound_addr = listener.local_addr()?;

    info!(tunnel = %tunnel_id, "SOCKS5 proxy listening on {}", bound_addr);
    registry
        .add_log(
            &tunnel_id,
            LogLevel::Info,
            format!("SOCKS5 proxy listening on {}", bound_addr),
        )
        .await;

    Ok(tokio::spawn(accept_loop(
        registry,
        session,
        tunnel_id,
        listener,
        shutdown_tx,
    )))
}

async fn accept_loop(
    registry: TunnelRegistry,
    session: SessionController,
    tunnel_id: String,
    listener: tokio::net::TcpListener,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            accept_result = listener.accept() => match accept_result {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    registry.connection_opened(&tunnel_id).await;

                    let registry = registry.clone();
                    let session = session.clone();
                    let tunnel_id = tunnel_id.clone();
                    let conn_shutdown = shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        handle_socks_client(
                            &registry,
                            &session,
                            &tunnel_id,
                            stream,
                            peer_addr,
                            conn_shutdown,
                        )
                        .await;
                        registry.connection_closed(&tunnel_id).await;
                    });
                }
                // Listener-level failure is terminal for the tunnel
                Err(e) => {
                    registry
                        .update_status(
                            &tunnel_id,
                            TunnelStatus::Error,
                            Some(format!("SOCKS5 listener failed: {}", e)),
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

/// Drive the SOCKS5 handshake for one client, then pipe. Handshake failures
/// close only this socket; a protocol-violating greeting gets no reply at
/// all.
async fn handle_socks_client(
    registry: &TunnelRegistry,
    session: &SessionController,
    tunnel_id: &str,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown_rx: broadcast::Receiver<()>,
) {
    if let Err(e) = socks::read_greeting(&mut stream).await {
        registry
            .add_log(
                tunnel_id,
                LogLevel::Debug,
                format!("SOCKS5 greeting from {} rejected: {}", peer_addr, e),
            )
            .await;
        return;
    }

    // No authentication methods are supported; accept no-auth unconditionally
    if stream
        .write_all(&[socks::VERSION, socks::METHOD_NO_AUTH])
        .await
        .is_err()
    {
        return;
    }

    let request = match socks::read_connect_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            let reason = match e {
                SocksError::Io(_) => "request truncated".to_string(),
                other => other.to_string(),
            };
            registry
                .add_log(
                    tunnel_id,
                    LogLevel::Debug,
                    format!("SOCKS5 request from {} rejected: {}", peer_addr, reason),
                )
                .await;
            return;
        }
    };

    let dest_host = request.addr.host();
    registry
        .add_log(
            tunnel_id,
            LogLevel::Debug,
            format!("SOCKS5 CONNECT {}:{} from {}", dest_host, request.port, peer_addr),
        )
        .await;

    match session
        .open_direct_tcpip(
            &dest_host,
            request.port as u32,
            &peer_addr.ip().to_string(),
            peer_addr.port() as u32,
        )
        .await
    {
        Ok(channel) => {
            if stream
                .write_all(&socks::encode_reply(socks::REP_SUCCESS))
                .await
                .is_err()
            {
                return;
            }
            super::pipe(stream, channel, registry, tunnel_id, shutdown_rx).await;
        }
        Err(e) => {
            registry
                .add_log(
                    tunnel_id,
                    LogLevel::Warn,
                    format!("SOCKS5 channel to {}:{} failed: {}", dest_host, request.port, e),
                )
                .await;
            let _ = stream
                .write_all(&socks::encode_reply(socks::REP_GENERAL_FAILURE))
                .await;
        }
    }
}
