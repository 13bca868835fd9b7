// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - Daemon
// Owns the tunnel session and serves its control API

mod api;
mod capture;
mod config;
mod dispatch;
mod interface;
mod permissions;
mod pidfile;
mod session;
mod socks;
mod ssh;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maccaronia_common::ConfigStore;

use api::{create_router, AppState};
use config::{DaemonConfig, ListenerMode};
use dispatch::CodecRegistry;
use session::{SessionDeps, SessionError, SessionHandle};
use ssh::SystemLauncher;

const SESSION_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // Before any file is created
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maccaronia_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Maccaronia Tunnel daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);

    let runtime_dir = config::runtime_dir()?;
    permissions::ensure_directory_with_permissions(&runtime_dir, daemon_config.group_access)?;

    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    if daemon_config.listener_mode == ListenerMode::TcpHttp {
        config::write_cli_config_snippet(&daemon_config)?;
    }
    if daemon_config.tun_fd.is_none() {
        warn!("No tun_fd configured; connect requests will fail until one is set");
    }

    let store = Arc::new(ConfigStore::open_default().context("Failed to open config store")?);
    info!("Config store: {}", store.root().display());

    let (session, session_task) = SessionHandle::spawn(SessionDeps {
        store: store.clone(),
        scope: daemon_config.config_scope.clone(),
        launcher: Arc::new(SystemLauncher),
        supervisor: daemon_config.supervisor_settings(&runtime_dir),
        interfaces: daemon_config.interface_provider(),
        codecs: CodecRegistry::default(),
    });

    let mut event_rx = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Session event: {:?}", event);
        }
    });

    // Closes SSE streams on shutdown
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        session: session.clone(),
        store,
        scope: daemon_config.config_scope.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state).layer(TraceLayer::new_for_http());

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, &daemon_config, session.clone(), shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            serve_tcp_http(app, &daemon_config.bind_address, session.clone(), shutdown_tx).await?;
        }
    }

    // The actor exits once the last handle is gone; idle client connections
    // may still hold one
    drop(session);
    match tokio::time::timeout(SESSION_EXIT_TIMEOUT, session_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Session actor ended abnormally: {}", e),
        Err(_) => debug!("Session actor still referenced at exit"),
    }

    info!("Daemon shut down");
    Ok(())
}

async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    session: SessionHandle,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path()?;

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }
    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))?;
    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());

    let (stop_accepting_tx, mut stop_accepting_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        shutdown_signal(session, shutdown_tx).await;
        let _ = stop_accepting_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = stop_accepting_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let app = app.clone();
                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);
                            let hyper_service = hyper::service::service_fn(
                                move |request: hyper::Request<hyper::body::Incoming>| {
                                    let mut app = app.clone();
                                    async move { app.call(request).await }
                                },
                            );

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection_with_upgrades(stream, hyper_service)
                            .await
                            {
                                // `maccaronia watch` interrupted by Ctrl+C lands here
                                let msg = err.to_string();
                                if msg.contains("connection closed") || msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    Ok(())
}

async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    session: SessionHandle,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;
    info!("Daemon listening on TCP (HTTP): {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(session, shutdown_tx))
        .await
        .context("TCP HTTP server error")?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, tear the session down, then close SSE streams
async fn shutdown_signal(session: SessionHandle, shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    match session.disconnect().await {
        Ok(_) => info!("Session disconnected"),
        Err(SessionError::IllegalTransition { state, .. }) => {
            debug!("No session to disconnect ({})", state)
        }
        Err(e) => warn!("Failed to disconnect session on shutdown: {}", e),
    }

    let _ = shutdown_tx.send(());
}
