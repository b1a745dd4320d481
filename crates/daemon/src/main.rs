// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Forward Daemon Contributors

// SSH Forward Daemon
// Tunnel management service: control API over unix socket or loopback TCP

mod api;
mod config;
mod forward;
mod manager;
mod registry;
mod session;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use config::{DaemonConfig, ListenerMode};
use manager::TunnelManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssh_forward_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SSH Forward Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load daemon configuration
    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);

    // Create the tunnel manager
    let manager = TunnelManager::new();

    // Mirror tunnel events into the daemon log
    let mut event_rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            debug!("Tunnel event: {:?}", event);
        }
    });

    // Shutdown broadcast channel for graceful SSE stream termination
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    // Create shared state
    let state = Arc::new(AppState {
        manager: manager.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = create_router(state);

    // Start listener based on configured mode
    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, manager, shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            serve_tcp_http(app, &daemon_config.bind_address, manager, shutdown_tx).await?;
        }
    }

    info!("Daemon shut down");
    Ok(())
}

/// Serve on Unix domain socket (local-only)
async fn serve_unix_socket(
    app: axum::Router,
    manager: TunnelManager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path()?;

    // Remove existing socket file if it exists
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create runtime directory")?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    // Set up shutdown signal
    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(manager).await;
        // Signal SSE streams to close
        let _ = shutdown_broadcast.send(());
        // Signal server to stop accepting connections
        let _ = shutdown_signal_tx.send(()).await;
    });

    // Accept connections
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // Client disconnects (e.g., Ctrl+C on a watch) are normal
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    // Cleanup socket
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on loopback TCP with HTTP
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    manager: TunnelManager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager, shutdown_tx))
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(manager: TunnelManager, shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    wait_for_shutdown(manager).await;
    // Signal all SSE streams to close
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM, then close all tunnels
async fn wait_for_shutdown(manager: TunnelManager) {
    #[cfg(unix)]
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            manager.close_all().await;
            info!("All tunnels closed");
            return;
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    manager.close_all().await;
    info!("All tunnels closed");
}
