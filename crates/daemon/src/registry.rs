// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// SSH Forward Daemon - Tunnel Registry
// In-memory table of tunnel records: id generation, per-tunnel log ring
// buffers, status transitions, and event fan-out to subscribers

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use ssh_forward_common::{
    LogEntry, LogLevel, TunnelConfig, TunnelDetail, TunnelEvent, TunnelStatus, TunnelSummary,
    TunnelType,
};

use crate::session::SessionController;

/// Log lines retained per tunnel; oldest evicted first
const LOG_CAPACITY: usize = 100;

/// Live resources owned by a running tunnel, released on stop
pub struct TunnelRuntime {
    /// Fan-out shutdown signal: the accept loop and every piped connection
    /// subscribe to this
    pub shutdown_tx: broadcast::Sender<()>,
    /// Controller for the SSH session task
    pub session: SessionController,
    /// Accept-loop task (local/dynamic); awaited then aborted on stop, the
    /// port must be free again when stop returns
    pub listener_task: Option<tokio::task::JoinHandle<()>>,
    /// Server-side forward to cancel on stop (remote tunnels only)
    pub remote_cancel: Option<(String, u32)>,
}

/// One tunnel held by the registry. Created only by start, destroyed only by
/// remove; stop retains the record for postmortem inspection.
pub struct TunnelRecord {
    pub id: String,
    pub tunnel_type: TunnelType,
    pub config: TunnelConfig,
    pub status: TunnelStatus,
    pub error: Option<String>,
    pub logs: VecDeque<LogEntry>,
    pub connections: u64,
    pub created_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
    pub runtime: Option<TunnelRuntime>,
}

impl TunnelRecord {
    fn summary(&self) -> TunnelSummary {
        TunnelSummary {
            id: self.id.clone(),
            tunnel_type: self.tunnel_type,
            status: self.status.clone(),
            connections: self.connections,
            ssh_host: self.config.connection.host.clone(),
            local_port: self.config.forwarding.local_port,
            remote_host: self.config.forwarding.remote_host.clone(),
            remote_port: self.config.forwarding.remote_port,
        }
    }

    fn detail(&self) -> TunnelDetail {
        TunnelDetail {
            id: self.id.clone(),
            tunnel_type: self.tunnel_type,
            status: self.status.clone(),
            error: self.error.clone(),
            connections: self.connections,
            created_at: self.created_at,
            last_status_change: self.last_status_change,
            ssh_host: self.config.connection.host.clone(),
            ssh_port: self.config.connection.port,
            ssh_user: self.config.connection.user.clone(),
            forwarding: self.config.forwarding.clone(),
        }
    }
}

/// Registry of all tunnel records
#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, TunnelRecord>>>,
    event_tx: broadcast::Sender<TunnelEvent>,
    id_counter: Arc<AtomicU64>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            id_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine; send only fails then
        let _ = self.event_tx.send(event);
    }

    /// Generate a unique tunnel id: wall-clock millis plus a process-wide
    /// counter, so ids from the same millisecond stay distinguishable
    fn generate_id(&self) -> String {
        let millis = Utc::now().timestamp_millis();
        let seq = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("tun-{}-{}", millis, seq)
    }

    /// Create a record in the connecting state and return its id
    pub async fn insert(&self, config: TunnelConfig) -> String {
        let id = self.generate_id();
        let now = Utc::now();
        let record = TunnelRecord {
            id: id.clone(),
            tunnel_type: config.forwarding.tunnel_type,
            config,
            status: TunnelStatus::Connecting,
            error: None,
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            connections: 0,
            created_at: now,
            last_status_change: now,
            runtime: None,
        };
        self.tunnels.write().await.insert(id.clone(), record);
        self.emit(TunnelEvent::TunnelStatus {
            tunnel_id: id.clone(),
            status: TunnelStatus::Connecting,
            error: None,
        });
        id
    }

    /// Hand the live resources to the record once forwarding is bound
    pub async fn attach_runtime(&self, id: &str, runtime: TunnelRuntime) {
        if let Some(record) = self.tunnels.write().await.get_mut(id) {
            record.runtime = Some(runtime);
        }
    }

    /// Take the live resources back, leaving the record in place
    pub async fn take_runtime(&self, id: &str) -> Option<TunnelRuntime> {
        self.tunnels.write().await.get_mut(id)?.runtime.take()
    }

    /// Append a log line to the tunnel's ring buffer and notify subscribers.
    /// Silently ignores unknown ids (late log lines after removal).
    pub async fn add_log(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let entry = LogEntry::new(level, message.clone());
        {
            let mut tunnels = self.tunnels.write().await;
            let Some(record) = tunnels.get_mut(id) else {
                return;
            };
            if record.logs.len() >= LOG_CAPACITY {
                record.logs.pop_front();
            }
            record.logs.push_back(entry.clone());
        }
        debug!(tunnel = %id, "{}", message);
        self.emit(TunnelEvent::TunnelLog {
            tunnel_id: id.to_string(),
            log: entry,
        });
    }

    /// Transition a tunnel's status and notify subscribers. Silently no-ops
    /// if the record no longer exists, guarding against late events after
    /// removal.
    pub async fn update_status(&self, id: &str, status: TunnelStatus, error: Option<String>) {
        {
            let mut tunnels = self.tunnels.write().await;
            let Some(record) = tunnels.get_mut(id) else {
                return;
            };
            record.status = status.clone();
            record.error = error.clone();
            record.last_status_change = Utc::now();
        }
        self.emit(TunnelEvent::TunnelStatus {
            tunnel_id: id.to_string(),
            status,
            error,
        });
    }

    pub async fn status_of(&self, id: &str) -> Option<TunnelStatus> {
        self.tunnels.read().await.get(id).map(|r| r.status.clone())
    }

    /// A piped byte stream opened on this tunnel
    pub async fn connection_opened(&self, id: &str) {
        if let Some(record) = self.tunnels.write().await.get_mut(id) {
            record.connections += 1;
        }
    }

    /// A piped byte stream ended; saturates so the count never goes negative
    pub async fn connection_closed(&self, id: &str) {
        if let Some(record) = self.tunnels.write().await.get_mut(id) {
            record.connections = record.connections.saturating_sub(1);
        }
    }

    pub async fn connections(&self, id: &str) -> Option<u64> {
        self.tunnels.read().await.get(id).map(|r| r.connections)
    }

    pub async fn logs(&self, id: &str) -> Option<Vec<LogEntry>> {
        self.tunnels
            .read()
            .await
            .get(id)
            .map(|r| r.logs.iter().cloned().collect())
    }

    pub async fn detail(&self, id: &str) -> Option<TunnelDetail> {
        self.tunnels.read().await.get(id).map(|r| r.detail())
    }

    /// Reduced projection of every live (non-terminal) tunnel
    pub async fn list_active(&self) -> Vec<TunnelSummary> {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.summary())
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.tunnels.read().await.keys().cloned().collect()
    }

    /// Live tunnels whose local bind matches (host, port) exactly, excluding
    /// the record that is asking (a new tunnel must not evict itself)
    pub async fn find_by_local_bind(&self, host: &str, port: u16, exclude: &str) -> Vec<String> {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|r| r.id != exclude && !r.status.is_terminal())
            .filter(|r| r.config.local_bind() == Some((host, port)))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Delete a record and notify subscribers
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.tunnels.write().await.remove(id).is_some();
        if removed {
            self.emit(TunnelEvent::TunnelRemoved {
                tunnel_id: id.to_string(),
            });
        }
        removed
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_forward_common::{AuthType, ConnectionConfig, ForwardingConfig};

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            connection: ConnectionConfig {
                host: "bastion.example.com".to_string(),
                port: 22,
                user: "deploy".to_string(),
                auth_type: AuthType::Password,
                password: Some("secret".to_string()),
                key_path: None,
                passphrase: None,
            },
            forwarding: ForwardingConfig {
                tunnel_type: TunnelType::Local,
                local_host: "127.0.0.1".to_string(),
                local_port: Some(8080),
                remote_host: Some("db.internal".to_string()),
                remote_port: Some(5432),
                bind_host: "127.0.0.1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn ids_are_unique_and_monotonic() {
        let registry = TunnelRegistry::new();
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(registry.insert(test_config()).await);
        }
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
    }

    #[tokio::test]
    async fn log_ring_buffer_evicts_oldest() {
        let registry = TunnelRegistry::new();
        let id = registry.insert(test_config()).await;

        for i in 0..150 {
            registry
                .add_log(&id, LogLevel::Info, format!("line {}", i))
                .await;
        }

        let logs = registry.logs(&id).await.unwrap();
        assert_eq!(logs.len(), 100);
        // The first 50 lines were evicted
        assert_eq!(logs[0].message, "line 50");
        assert_eq!(logs[99].message, "line 149");
    }

    #[tokio::test]
    async fn status_updates_emit_events() {
        let registry = TunnelRegistry::new();
        let mut rx = registry.subscribe();
        let id = registry.insert(test_config()).await;

        registry
            .update_status(&id, TunnelStatus::Active, None)
            .await;

        // First event is the connecting transition from insert
        match rx.recv().await.unwrap() {
            TunnelEvent::TunnelStatus { status, .. } => {
                assert_eq!(status, TunnelStatus::Connecting)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            TunnelEvent::TunnelStatus {
                tunnel_id, status, ..
            } => {
                assert_eq!(tunnel_id, id);
                assert_eq!(status, TunnelStatus::Active);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn update_after_removal_is_a_noop() {
        let registry = TunnelRegistry::new();
        let id = registry.insert(test_config()).await;
        assert!(registry.remove(&id).await);

        // Late events for a removed tunnel must not panic or resurrect it
        registry
            .update_status(&id, TunnelStatus::Error, Some("late".to_string()))
            .await;
        registry.add_log(&id, LogLevel::Warn, "late line").await;
        assert!(registry.status_of(&id).await.is_none());
    }

    #[tokio::test]
    async fn connection_counter_never_goes_negative() {
        let registry = TunnelRegistry::new();
        let id = registry.insert(test_config()).await;

        registry.connection_closed(&id).await;
        assert_eq!(registry.connections(&id).await, Some(0));

        registry.connection_opened(&id).await;
        registry.connection_opened(&id).await;
        registry.connection_closed(&id).await;
        assert_eq!(registry.connections(&id).await, Some(1));
    }

    #[tokio::test]
    async fn list_active_excludes_terminal_records() {
        let registry = TunnelRegistry::new();
        let live = registry.insert(test_config()).await;
        let stopped = registry.insert(test_config()).await;
        registry
            .update_status(&stopped, TunnelStatus::Stopped, None)
            .await;

        let listed = registry.list_active().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, live);
        assert_eq!(listed[0].local_port, Some(8080));
    }

    #[tokio::test]
    async fn find_by_local_bind_matches_exactly() {
        let registry = TunnelRegistry::new();
        let a = registry.insert(test_config()).await;
        let mut other = test_config();
        other.forwarding.local_port = Some(9090);
        let b = registry.insert(other).await;

        let found = registry.find_by_local_bind("127.0.0.1", 8080, "none").await;
        assert_eq!(found, vec![a.clone()]);

        // The asking tunnel never evicts itself
        assert!(registry
            .find_by_local_bind("127.0.0.1", 8080, &a)
            .await
            .is_empty());

        // Different host is a different bind
        assert!(registry
            .find_by_local_bind("0.0.0.0", 8080, "none")
            .await
            .is_empty());
        let _ = b;
    }
}
