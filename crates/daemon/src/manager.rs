// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// SSH Forward Daemon - Tunnel Manager
// The control operation set: validates requests, clears conflicting local
// ports, drives session and forwarding setup, and owns tunnel lifecycle

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ssh_forward_common::{
    is_port_available, Error, LogEntry, LogLevel, TunnelConfig, TunnelDetail, TunnelEvent,
    TunnelStatus, TunnelSummary, TunnelType,
};

use crate::forward::{dynamic, local, remote};
use crate::registry::{TunnelRegistry, TunnelRuntime};
use crate::session::{self, SessionController};

/// Session liveness probe cadence for the per-tunnel monitor
const MONITOR_INTERVAL: Duration = Duration::from_secs(15);

/// Manages all tunnels. Cheap to clone; every clone shares the registry.
#[derive(Clone)]
pub struct TunnelManager {
    registry: TunnelRegistry,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            registry: TunnelRegistry::new(),
        }
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.registry.subscribe()
    }

    /// Start a tunnel. Resolves with the new id once forwarding is bound and
    /// the record is active. On failure the record is retained in the error
    /// state so its logs stay inspectable.
    pub async fn start(&self, config: TunnelConfig) -> Result<String, Error> {
        config.validate()?;

        let id = self.registry.insert(config.clone()).await;
        info!(
            tunnel = %id,
            "starting {:?} tunnel to {}",
            config.forwarding.tunnel_type, config.connection.host
        );

        match self.bring_up(&id, config).await {
            Ok(()) => Ok(id),
            Err(e) => {
                self.registry
                    .add_log(&id, LogLevel::Error, e.to_string())
                    .await;
                self.registry
                    .update_status(&id, TunnelStatus::Error, Some(e.to_string()))
                    .await;
                // Release anything brought up before the failure
                if let Some(runtime) = self.registry.take_runtime(&id).await {
                    let _ = runtime.shutdown_tx.send(());
                    runtime.session.disconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, id: &str, config: TunnelConfig) -> Result<(), Error> {
        // Latest start wins: evict any tunnel already bound to our local
        // port, then verify the port really is free
        if let Some((host, port)) = config.local_bind() {
            let host = host.to_string();
            let evicted = self.evict_port(&host, port, id).await;
            if evicted > 0 {
                self.registry
                    .add_log(
                        id,
                        LogLevel::Info,
                        format!(
                            "Evicted {} tunnel(s) previously bound to {}:{}",
                            evicted, host, port
                        ),
                    )
                    .await;
            }
            if !is_port_available(&host, port) {
                return Err(Error::PortInUse(host, port));
            }
        }

        let (shutdown_tx, _) = broadcast::channel(16);

        self.registry
            .add_log(
                id,
                LogLevel::Info,
                format!(
                    "Connecting to {}@{}:{}",
                    config.connection.user, config.connection.host, config.connection.port
                ),
            )
            .await;

        let (session, route) =
            session::connect(id, &self.registry, &config.connection, shutdown_tx.clone()).await?;
        self.registry
            .add_log(id, LogLevel::Info, "SSH session established")
            .await;

        let forwarding = &config.forwarding;
        let missing = |field: &str| Error::Config(format!("{} required", field));

        let bound = match forwarding.tunnel_type {
            TunnelType::Local => {
                let local_port = forwarding.local_port.ok_or_else(|| missing("Local port"))?;
                let remote_host = forwarding
                    .remote_host
                    .clone()
                    .ok_or_else(|| missing("Remote host"))?;
                let remote_port = forwarding
                    .remote_port
                    .ok_or_else(|| missing("Remote port"))?;
                local::start(
                    self.registry.clone(),
                    session.clone(),
                    id.to_string(),
                    &forwarding.local_host,
                    local_port,
                    remote_host,
                    remote_port,
                    shutdown_tx.clone(),
                )
                .await
                .map(|task| (Some(task), None))
            }
            TunnelType::Dynamic => {
                let local_port = forwarding.local_port.ok_or_else(|| missing("Local port"))?;
                dynamic::start(
                    self.registry.clone(),
                    session.clone(),
                    id.to_string(),
                    &forwarding.local_host,
                    local_port,
                    shutdown_tx.clone(),
                )
                .await
                .map(|task| (Some(task), None))
            }
            TunnelType::Remote => {
                let remote_port = forwarding
                    .remote_port
                    .ok_or_else(|| missing("Remote port"))?;
                let local_port = forwarding.local_port.ok_or_else(|| missing("Local port"))?;
                remote::start(
                    &self.registry,
                    &session,
                    id,
                    &forwarding.bind_host,
                    remote_port,
                    &forwarding.local_host,
                    local_port,
                    &route,
                )
                .await
                .map(|bound| (None, Some((forwarding.bind_host.clone(), bound as u32))))
            }
        };

        let (listener_task, remote_cancel) = match bound {
            Ok(handles) => handles,
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        self.registry
            .attach_runtime(
                id,
                TunnelRuntime {
                    shutdown_tx: shutdown_tx.clone(),
                    session: session.clone(),
                    listener_task,
                    remote_cancel,
                },
            )
            .await;
        self.registry
            .update_status(id, TunnelStatus::Active, None)
            .await;

        tokio::spawn(monitor_session(
            self.registry.clone(),
            id.to_string(),
            session,
            shutdown_tx,
        ));

        Ok(())
    }

    /// Stop a tunnel: sever its listener and connections, end the SSH
    /// session, and mark the record stopped. Idempotent; the record stays
    /// queryable for postmortem inspection.
    pub async fn stop(&self, id: &str) -> Result<(), Error> {
        let Some(status) = self.registry.status_of(id).await else {
            return Err(Error::TunnelNotFound(id.to_string()));
        };

        // The record turns terminal before the teardown below, so the session
        // monitor never mistakes a caller-driven stop for a session death.
        // Re-stopping a tunnel already in a terminal state changes nothing.
        if !status.is_terminal() {
            self.registry
                .add_log(id, LogLevel::Info, "Tunnel stopped")
                .await;
            self.registry
                .update_status(id, TunnelStatus::Stopped, None)
                .await;
        }

        if let Some(runtime) = self.registry.take_runtime(id).await {
            let _ = runtime.shutdown_tx.send(());
            if let Some(mut task) = runtime.listener_task {
                // Give the accept loop a moment to exit on its own, then
                // abort it so the port is released before stop returns
                if tokio::time::timeout(Duration::from_millis(100), &mut task)
                    .await
                    .is_err()
                {
                    task.abort();
                    let _ = task.await;
                }
            }
            if let Some((host, port)) = runtime.remote_cancel {
                let _ = runtime.session.cancel_tcpip_forward(&host, port).await;
            }
            runtime.session.disconnect().await;
        }
        Ok(())
    }

    /// Stop a tunnel if needed, then delete its record
    pub async fn remove(&self, id: &str) -> Result<(), Error> {
        self.stop(id).await?;
        self.registry.remove(id).await;
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<TunnelDetail, Error> {
        self.registry
            .detail(id)
            .await
            .ok_or_else(|| Error::TunnelNotFound(id.to_string()))
    }

    pub async fn logs(&self, id: &str) -> Result<Vec<LogEntry>, Error> {
        self.registry
            .logs(id)
            .await
            .ok_or_else(|| Error::TunnelNotFound(id.to_string()))
    }

    pub async fn list_active(&self) -> Vec<TunnelSummary> {
        self.registry.list_active().await
    }

    /// Stop every live tunnel whose local bind matches (host, port) exactly;
    /// returns how many were closed
    pub async fn close_tunnels_using_port(&self, host: &str, port: u16) -> usize {
        self.evict_port(host, port, "").await
    }

    async fn evict_port(&self, host: &str, port: u16, exclude: &str) -> usize {
        let victims = self.registry.find_by_local_bind(host, port, exclude).await;
        for victim in &victims {
            self.registry
                .add_log(
                    victim,
                    LogLevel::Info,
                    format!(
                        "Stopped: local port {}:{} reclaimed by a newer tunnel",
                        host, port
                    ),
                )
                .await;
            if let Err(e) = self.stop(victim).await {
                warn!(tunnel = %victim, "failed to stop tunnel during port eviction: {}", e);
            }
        }
        victims.len()
    }

    /// Stop every tunnel concurrently and clear the registry. Individual
    /// failures are ignored so one stuck tunnel cannot block shutdown of the
    /// others. Used at host-application shutdown.
    pub async fn close_all(&self) {
        let ids = self.registry.ids().await;
        join_all(ids.iter().map(|id| self.stop(id))).await;
        for id in &ids {
            self.registry.remove(id).await;
        }
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Watch one tunnel's session. Every session-driven ending explicitly
/// updates the record, so no terminal condition is left waiting for an event
/// that may never arrive.
async fn monitor_session(
    registry: TunnelRegistry,
    id: String,
    session: SessionController,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut closed_rx = session.subscribe_closed();
    let mut probe = tokio::time::interval(MONITOR_INTERVAL);
    probe.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            // Caller-driven stop; status was handled there
            _ = shutdown_rx.recv() => return,
            _ = closed_rx.recv() => break,
            _ = probe.tick() => {
                if !session.keepalive().await {
                    break;
                }
            }
        }
    }

    let status = registry.status_of(&id).await;
    let _ = shutdown_tx.send(());
    session.disconnect().await;

    match status {
        Some(TunnelStatus::Active) => {
            registry
                .add_log(&id, LogLevel::Warn, "SSH session closed")
                .await;
            registry
                .update_status(
                    &id,
                    TunnelStatus::Disconnected,
                    Some("SSH session closed".to_string()),
                )
                .await;
        }
        Some(status) if !status.is_terminal() => {
            registry
                .update_status(
                    &id,
                    TunnelStatus::Error,
                    Some("SSH session closed before the tunnel became active".to_string()),
                )
                .await;
        }
        // Already terminal or removed; nothing left to record
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_forward_common::{AuthType, ConnectionConfig, ForwardingConfig};

    fn test_config(ssh_port: u16, local_port: u16) -> TunnelConfig {
        TunnelConfig {
            connection: ConnectionConfig {
                host: "127.0.0.1".to_string(),
                port: ssh_port,
                user: "deploy".to_string(),
                auth_type: AuthType::Password,
                password: Some("secret".to_string()),
                key_path: None,
                passphrase: None,
            },
            forwarding: ForwardingConfig {
                tunnel_type: TunnelType::Local,
                local_host: "127.0.0.1".to_string(),
                local_port: Some(local_port),
                remote_host: Some("db.internal".to_string()),
                remote_port: Some(5432),
                bind_host: "127.0.0.1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn operations_on_unknown_id_return_not_found() {
        let manager = TunnelManager::new();
        assert!(matches!(
            manager.stop("missing").await,
            Err(Error::TunnelNotFound(_))
        ));
        assert!(matches!(
            manager.remove("missing").await,
            Err(Error::TunnelNotFound(_))
        ));
        assert!(matches!(
            manager.status("missing").await,
            Err(Error::TunnelNotFound(_))
        ));
        assert!(matches!(
            manager.logs("missing").await,
            Err(Error::TunnelNotFound(_))
        ));
        // The registry was not mutated
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_rejected_before_any_record() {
        let manager = TunnelManager::new();
        let mut config = test_config(22, 8080);
        config.forwarding.remote_host = None;

        assert!(matches!(
            manager.start(config).await,
            Err(Error::Config(_))
        ));
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_ssh_host_leaves_error_record() {
        let manager = TunnelManager::new();
        // Nothing listens on port 1, so the TCP connect is refused fast
        let result = manager.start(test_config(1, 18080)).await;
        assert!(matches!(result, Err(Error::SshConnection(_))));

        // The record is retained for postmortem inspection
        let ids = manager.registry.ids().await;
        assert_eq!(ids.len(), 1);
        let detail = manager.status(&ids[0]).await.unwrap();
        assert_eq!(detail.status, TunnelStatus::Error);
        assert!(detail.error.is_some());
        assert!(!manager.logs(&ids[0]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn eviction_stops_prior_tunnel_on_same_port() {
        let manager = TunnelManager::new();

        // A live tunnel bound to 18081 (registry record without runtime)
        let prior = manager.registry.insert(test_config(22, 18081)).await;
        manager
            .registry
            .update_status(&prior, TunnelStatus::Active, None)
            .await;

        let closed = manager.close_tunnels_using_port("127.0.0.1", 18081).await;
        assert_eq!(closed, 1);
        assert_eq!(
            manager.registry.status_of(&prior).await,
            Some(TunnelStatus::Stopped)
        );

        // A second eviction pass finds nothing
        assert_eq!(
            manager.close_tunnels_using_port("127.0.0.1", 18081).await,
            0
        );
    }

    #[tokio::test]
    async fn start_evicts_conflicting_port_and_notes_it() {
        let manager = TunnelManager::new();

        let prior = manager.registry.insert(test_config(22, 18082)).await;
        manager
            .registry
            .update_status(&prior, TunnelStatus::Active, None)
            .await;

        // The start itself fails (no SSH server on port 1) but eviction has
        // already run and is noted on the new tunnel's record
        let _ = manager.start(test_config(1, 18082)).await;

        assert_eq!(
            manager.registry.status_of(&prior).await,
            Some(TunnelStatus::Stopped)
        );
        let new_id = manager
            .registry
            .ids()
            .await
            .into_iter()
            .find(|id| *id != prior)
            .unwrap();
        let logs = manager.logs(&new_id).await.unwrap();
        assert!(logs.iter().any(|entry| entry.message.contains("Evicted")));

        // Exactly one live record remains for that port after the dust
        // settles (the failed starter is terminal too)
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = TunnelManager::new();
        let id = manager.registry.insert(test_config(22, 18083)).await;
        manager
            .registry
            .update_status(&id, TunnelStatus::Active, None)
            .await;

        manager.stop(&id).await.unwrap();
        assert_eq!(
            manager.registry.status_of(&id).await,
            Some(TunnelStatus::Stopped)
        );

        // Second stop succeeds without further transitions
        manager.stop(&id).await.unwrap();
        assert_eq!(
            manager.registry.status_of(&id).await,
            Some(TunnelStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let manager = TunnelManager::new();
        let id = manager.registry.insert(test_config(22, 18084)).await;

        manager.remove(&id).await.unwrap();
        assert!(manager.status(&id).await.is_err());
        assert!(manager.registry.ids().await.is_empty());
    }

    #[tokio::test]
    async fn close_all_clears_the_registry() {
        let manager = TunnelManager::new();
        manager.close_all().await; // empty registry is fine

        let a = manager.registry.insert(test_config(22, 18085)).await;
        let b = manager.registry.insert(test_config(22, 18086)).await;
        manager
            .registry
            .update_status(&a, TunnelStatus::Active, None)
            .await;

        manager.close_all().await;
        assert!(manager.registry.ids().await.is_empty());
        let _ = b;
    }
}
