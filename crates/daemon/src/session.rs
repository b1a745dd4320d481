// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// SSH Forward Daemon - Session Layer
// Builds the SSH client configuration, connects and authenticates, and owns
// the russh handle behind a message-passing controller

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::load_secret_key;
use russh::{kex, Channel, Preferred};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use ssh_forward_common::{format_host_port, AuthType, ConnectionConfig, Error};

use crate::forward::remote::{self, RemoteRoute};
use crate::registry::TunnelRegistry;

/// SSH handshake plus authentication must become ready within this window
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Transport-level keepalive probe interval; 3 missed probes end the session
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Timeout for one explicit liveness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration with a broad key-exchange table: the legacy
/// Diffie-Hellman groups stay enabled so tunnels still reach older servers.
fn client_config() -> client::Config {
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        nodelay: true,
        preferred: Preferred {
            kex: Cow::Owned(vec![
                kex::CURVE25519,
                kex::CURVE25519_PRE_RFC_8731,
                kex::DH_G14_SHA256,
                kex::DH_G14_SHA1,
                kex::DH_G1_SHA1,
                kex::EXTENSION_SUPPORT_AS_CLIENT,
            ]),
            ..Preferred::DEFAULT
        },
        ..Default::default()
    }
}

/// russh callback handler: permissive host-key policy plus routing of
/// server-initiated forwarded-tcpip channels back to the owning tunnel
pub struct ClientHandler {
    tunnel_id: String,
    registry: TunnelRegistry,
    remote_route: RemoteRoute,
    shutdown_tx: broadcast::Sender<()>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are accepted without verification; any server key passes
        debug!(
            tunnel = %self.tunnel_id,
            "accepting server host key ({})",
            server_public_key.algorithm()
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            tunnel = %self.tunnel_id,
            "forwarded-tcpip channel from {}:{} (server bind {}:{})",
            originator_address, originator_port, connected_address, connected_port
        );

        let registry = self.registry.clone();
        let tunnel_id = self.tunnel_id.clone();
        let route = self.remote_route.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        // The connection I/O must not run on the session event loop
        tokio::spawn(async move {
            remote::handle_forwarded_connection(registry, tunnel_id, route, channel, shutdown_rx)
                .await;
        });

        Ok(())
    }
}

/// Commands accepted by the task that owns the russh handle
enum SessionCommand {
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
    Keepalive {
        reply_tx: oneshot::Sender<bool>,
    },
    Disconnect,
}

/// Cloneable facade over the session task. Only that task touches the russh
/// handle, so channel opens and global requests never contend on a lock.
#[derive(Clone)]
pub struct SessionController {
    cmd_tx: mpsc::Sender<SessionCommand>,
    closed_tx: broadcast::Sender<()>,
}

impl SessionController {
    /// Receives one notification when the session task ends
    pub fn subscribe_closed(&self) -> broadcast::Receiver<()> {
        self.closed_tx.subscribe()
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::SshConnection("SSH session closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::SshConnection("SSH session closed".to_string()))?
            .map_err(|e| Error::Tunnel(format!("Failed to open channel to {}:{}: {}", host, port, e)))
    }

    /// Ask the server to listen on (address, port); returns the port the
    /// server actually bound
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::SshConnection("SSH session closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::SshConnection("SSH session closed".to_string()))?
            .map_err(|e| match e {
                russh::Error::RequestDenied => Error::Tunnel(format!(
                    "Server refused to bind {}:{} (port in use or server policy)",
                    address, port
                )),
                other => Error::Tunnel(format!("Remote forward request failed: {}", other)),
            })
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::SshConnection("SSH session closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::SshConnection("SSH session closed".to_string()))?
            .map_err(|e| Error::Tunnel(format!("Failed to cancel remote forward: {}", e)))
    }

    /// One explicit liveness probe; false means the session is gone
    pub async fn keepalive(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Keepalive { reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// End the session. The owning task disconnects and then broadcasts the
    /// closed notification.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Disconnect).await;
    }
}

/// Connect and authenticate, then move the handle into its owner task.
/// Returns the controller plus the route slot used by remote forwards.
pub async fn connect(
    tunnel_id: &str,
    registry: &TunnelRegistry,
    config: &ConnectionConfig,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(SessionController, RemoteRoute), Error> {
    // Key material is resolved before any network activity, so an unreadable
    // or undecryptable key file fails as a configuration error
    let key = match config.auth_type {
        AuthType::Key => {
            let path = config.key_path.as_ref().ok_or_else(|| {
                Error::Config("Key path required for key authentication".to_string())
            })?;
            let key = load_secret_key(path, config.passphrase.as_deref()).map_err(|e| {
                Error::Config(format!(
                    "Failed to load private key {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Some(key)
        }
        AuthType::Password => None,
    };

    let remote_route: RemoteRoute = Arc::new(RwLock::new(None));
    let handler = ClientHandler {
        tunnel_id: tunnel_id.to_string(),
        registry: registry.clone(),
        remote_route: remote_route.clone(),
        shutdown_tx,
    };

    let addr = format_host_port(&config.host, config.port);
    info!(tunnel = %tunnel_id, "connecting to SSH server {}", addr);

    let mut handle = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(Arc::new(client_config()), addr.as_str(), handler),
    )
    .await
    .map_err(|_| {
        Error::SshConnection(format!(
            "Connection to {} timed out after {:?}",
            addr, CONNECT_TIMEOUT
        ))
    })?
    .map_err(|e| Error::SshConnection(format!("Failed to connect to {}: {}", addr, e)))?;

    let auth_result = tokio::time::timeout(CONNECT_TIMEOUT, authenticate(&mut handle, config, key))
        .await
        .map_err(|_| Error::Authentication("Authentication timed out".to_string()))??;

    if let AuthResult::Failure {
        remaining_methods, ..
    } = auth_result
    {
        let method = match config.auth_type {
            AuthType::Password => "password",
            AuthType::Key => "public key",
        };
        return Err(Error::Authentication(format!(
            "Server rejected {} authentication (remaining methods: {:?})",
            method, remaining_methods
        )));
    }

    info!(tunnel = %tunnel_id, "SSH authentication successful");
    Ok((
        spawn_session_task(handle, tunnel_id.to_string()),
        remote_route,
    ))
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &ConnectionConfig,
    key: Option<russh::keys::PrivateKey>,
) -> Result<AuthResult, Error> {
    match config.auth_type {
        AuthType::Password => {
            let password = config.password.as_deref().ok_or_else(|| {
                Error::Config("Password required for password authentication".to_string())
            })?;
            handle
                .authenticate_password(config.user.clone(), password.to_string())
                .await
                .map_err(|e| Error::Authentication(e.to_string()))
        }
        AuthType::Key => {
            let key = key.ok_or_else(|| {
                Error::Config("Key path required for key authentication".to_string())
            })?;
            // RSA keys negotiate a SHA-2 signature hash; other key types
            // ignore the hint
            let rsa_hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| Error::Authentication(e.to_string()))?
                .flatten();
            handle
                .authenticate_publickey(
                    config.user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
                )
                .await
                .map_err(|e| Error::Authentication(e.to_string()))
        }
    }
}

/// Move the authenticated handle into a task that serializes all operations
/// on it; callers talk to the task through SessionController
fn spawn_session_task(handle: Handle<ClientHandler>, tunnel_id: String) -> SessionController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(64);
    let (closed_tx, _) = broadcast::channel::<()>(1);
    let closed_for_task = closed_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        debug!(tunnel = %tunnel_id, "session task started");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SessionCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(
                            host.as_str(),
                            port,
                            originator_host.as_str(),
                            originator_port,
                        )
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Caller went away; the dropped channel closes itself
                        warn!(tunnel = %tunnel_id, "caller gone before channel open completed");
                    }
                }

                SessionCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(address.clone(), port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = *bound_port;
                            if reply_tx.send(result).is_err() {
                                // The server already bound the port; cancel so
                                // no ghost forward lingers
                                warn!(
                                    tunnel = %tunnel_id,
                                    "caller gone after tcpip-forward, cancelling {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                SessionCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let _ = reply_tx.send(handle.cancel_tcpip_forward(address, port).await);
                }

                SessionCommand::Keepalive { reply_tx } => {
                    let alive = !handle.is_closed()
                        && matches!(
                            tokio::time::timeout(PROBE_TIMEOUT, handle.send_keepalive(true)).await,
                            Ok(Ok(()))
                        );
                    let _ = reply_tx.send(alive);
                }

                SessionCommand::Disconnect => break,
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
            .await;
        let _ = closed_for_task.send(());
        debug!(tunnel = %tunnel_id, "session task ended");
    });

    SessionController { cmd_tx, closed_tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kex_table_keeps_legacy_groups() {
        let config = client_config();
        let kex_table = config.preferred.kex.as_ref();
        assert!(kex_table.contains(&kex::DH_G1_SHA1));
        assert!(kex_table.contains(&kex::DH_G14_SHA1));
        assert!(kex_table.contains(&kex::CURVE25519));
    }

    #[test]
    fn keepalive_probing_is_configured() {
        let config = client_config();
        assert_eq!(config.keepalive_interval, Some(KEEPALIVE_INTERVAL));
        assert_eq!(config.keepalive_max, 3);
        assert!(config.nodelay);
    }
}
