// SSH Forward Daemon - REST API Module
// HTTP control surface plus the SSE event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use ssh_forward_common::{
    Error, LogEntry, TunnelConfig, TunnelDetail, TunnelStatus, TunnelSummary,
};

use crate::manager::TunnelManager;

/// Shared application state
pub struct AppState {
    pub manager: TunnelManager,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

#[derive(Serialize)]
struct OkResponse {
    success: bool,
}

#[derive(Serialize)]
struct StartResponse {
    success: bool,
    tunnel_id: String,
    status: TunnelStatus,
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    tunnel: TunnelDetail,
}

#[derive(Serialize)]
struct LogsResponse {
    success: bool,
    logs: Vec<LogEntry>,
}

#[derive(Serialize)]
struct ListResponse {
    success: bool,
    tunnels: Vec<TunnelSummary>,
}

fn failure(error: &Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = match error {
        Error::TunnelNotFound(_) => StatusCode::NOT_FOUND,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::PortInUse(_, _) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: error.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels).post(start_tunnel))
        .route("/api/tunnels/:id", get(tunnel_status).delete(remove_tunnel))
        .route("/api/tunnels/:id/stop", post(stop_tunnel))
        .route("/api/tunnels/:id/logs", get(tunnel_logs))
        .route("/api/close-all", post(close_all))
        .route("/api/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// Start a tunnel; responds once it is active
async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Json(config): Json<TunnelConfig>,
) -> impl IntoResponse {
    info!(
        "API: start {:?} tunnel via {}",
        config.forwarding.tunnel_type, config.connection.host
    );

    match state.manager.start(config).await {
        Ok(tunnel_id) => (
            StatusCode::OK,
            Json(StartResponse {
                success: true,
                tunnel_id,
                status: TunnelStatus::Active,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start tunnel: {}", e);
            failure(&e).into_response()
        }
    }
}

/// Stop a tunnel, keeping its record queryable
async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!("API: stop tunnel {}", id);
    match state.manager.stop(&id).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { success: true })).into_response(),
        Err(e) => failure(&e).into_response(),
    }
}

/// Stop (if needed) and delete a tunnel
async fn remove_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!("API: remove tunnel {}", id);
    match state.manager.remove(&id).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { success: true })).into_response(),
        Err(e) => failure(&e).into_response(),
    }
}

/// Full view of one tunnel
async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.status(&id).await {
        Ok(tunnel) => (
            StatusCode::OK,
            Json(StatusResponse {
                success: true,
                tunnel,
            }),
        )
            .into_response(),
        Err(e) => failure(&e).into_response(),
    }
}

/// The tunnel's log ring buffer, oldest first
async fn tunnel_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.logs(&id).await {
        Ok(logs) => (StatusCode::OK, Json(LogsResponse { success: true, logs })).into_response(),
        Err(e) => failure(&e).into_response(),
    }
}

/// Reduced projection of every live tunnel
async fn list_tunnels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tunnels = state.manager.list_active().await;
    Json(ListResponse {
        success: true,
        tunnels,
    })
}

/// Stop everything; used at host-application shutdown
async fn close_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: close all tunnels");
    state.manager.close_all().await;
    (StatusCode::OK, Json(OkResponse { success: true }))
}

/// GET /api/events -> SSE stream of tunnel events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let tunnel_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    tracing::error!("Failed to serialize tunnel event: {e}");
                    None
                }
            },
            Err(lagged) => {
                // This client fell behind the broadcast channel; it will
                // catch up with future events
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    // Heartbeats keep connections warm and let clients detect liveness
    let merged = stream::select(tunnel_events, heartbeat_stream());

    // End the stream when the daemon shuts down
    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn heartbeat_stream(
) -> impl Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    serde_json::json!({ "type": "heartbeat", "timestamp": Utc::now() }).to_string()
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        // With the test interval override, a heartbeat arrives well within 1s
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[test]
    fn errors_map_to_http_statuses() {
        let (code, _) = failure(&Error::TunnelNotFound("tun-1-0".to_string()));
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = failure(&Error::Config("bad".to_string()));
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = failure(&Error::PortInUse("127.0.0.1".to_string(), 8080));
        assert_eq!(code, StatusCode::CONFLICT);

        let (code, body) = failure(&Error::Tunnel("boom".to_string()));
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.0.success);
    }

    #[test]
    fn start_response_envelope() {
        let json = serde_json::to_string(&StartResponse {
            success: true,
            tunnel_id: "tun-1-0".to_string(),
            status: TunnelStatus::Active,
        })
        .unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"tunnel_id\":\"tun-1-0\""));
        assert!(json.contains("\"status\":\"active\""));
    }
}
