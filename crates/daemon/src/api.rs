// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - REST API Module
// Session control surface and configuration endpoints

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use maccaronia_common::config::deserialize;
use maccaronia_common::{Config, ConfigStore, ErrorResponse, SessionEvent, SessionStatus};

use crate::session::{SessionError, SessionHandle};

/// Shared application state
pub struct AppState {
    pub session: SessionHandle,
    pub store: Arc<ConfigStore>,
    /// Scope that /api/config reads and writes
    pub scope: String,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/session", get(session_status))
        .route("/api/session/connect", post(connect))
        .route("/api/session/disconnect", post(disconnect))
        .route("/api/session/acknowledge", post(acknowledge))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn session_status(State(state): State<Arc<AppState>>) -> Json<SessionStatus> {
    Json(state.session.status())
}

/// Body is optional; an empty body connects with the stored configuration
async fn connect(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let config = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match deserialize(&body) {
            Ok(config) => Some(config),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };

    info!(
        "API: connect request ({})",
        if config.is_some() { "inline config" } else { "stored config" }
    );
    session_reply(state.session.connect(config).await)
}

async fn disconnect(State(state): State<Arc<AppState>>) -> Response {
    info!("API: disconnect request");
    session_reply(state.session.disconnect().await)
}

async fn acknowledge(State(state): State<Arc<AppState>>) -> Response {
    info!("API: acknowledge request");
    session_reply(state.session.acknowledge().await)
}

/// Store I/O and sealing are blocking; keep them off the runtime threads
async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.clone();
    let scope = state.scope.clone();
    match tokio::task::spawn_blocking(move || store.load(&scope)).await {
        Ok(config) => (StatusCode::OK, Json(config)).into_response(),
        Err(e) => {
            error!("Config load task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn put_config(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let mut config = match deserialize(&body) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let issues = config.validate();
    if !issues.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: "Configuration incomplete".to_string(),
                issues,
            }),
        )
            .into_response();
    }

    let protocol = config.protocol;
    let store = state.store.clone();
    let scope = state.scope.clone();
    let saved = tokio::task::spawn_blocking(move || {
        let saved = store.save(&scope, &config);
        config.ssh.zeroize();
        saved
    })
    .await;

    match saved {
        Ok(Ok(path)) => {
            info!("API: configuration saved to {}", path.display());
            (
                StatusCode::OK,
                Json(SuccessResponse {
                    message: format!("Configuration saved ({})", protocol),
                }),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            error!("Failed to save configuration: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("Config save task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn session_reply(result: Result<SessionStatus, SessionError>) -> Response {
    match result {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(SessionError::InvalidConfig(issues)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: "Configuration incomplete".to_string(),
                issues,
            }),
        )
            .into_response(),
        Err(e @ SessionError::IllegalTransition { .. }) => {
            warn!("API: {}", e);
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e @ SessionError::ActorGone) => {
            error!("API: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            error!("API: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            issues: Vec::new(),
        }),
    )
        .into_response()
}

/// GET /api/events: SSE stream of session events plus heartbeats
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let session_events =
        BroadcastStream::new(state.session.subscribe()).filter_map(|msg| async move {
            match msg {
                Ok(event) => event_payload(&event).map(|json| Ok(Event::default().data(json))),
                Err(lagged) => {
                    // The client catches up with later events
                    debug!("Event stream lagged: {:?}", lagged);
                    None
                }
            }
        });

    let merged = stream::select(session_events, heartbeat_stream());
    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn event_payload(event: &SessionEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("Failed to serialize session event: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    event_payload(&SessionEvent::Heartbeat {
        timestamp: Utc::now(),
    })
    .unwrap_or_else(|| "{}".to_string())
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
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::CodecRegistry;
    use crate::interface::testing::DuplexProvider;
    use crate::session::SessionDeps;
    use crate::ssh::process::testing::FakeLauncher;
    use crate::ssh::SupervisorSettings;
    use maccaronia_common::{Protocol, SessionState};

    struct TestApp {
        router: Router,
        launcher: FakeLauncher,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn app() -> TestApp {
        app_with_store_root(|dir| dir.to_path_buf())
    }

    fn app_with_store_root(root: impl FnOnce(&std::path::Path) -> std::path::PathBuf) -> TestApp {
        let store_dir = tempfile::tempdir().unwrap();
        let runtime_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(root(store_dir.path())));
        let launcher = FakeLauncher::default();

        let (session, _task) = SessionHandle::spawn(SessionDeps {
            store: store.clone(),
            scope: "default".to_string(),
            launcher: Arc::new(launcher.clone()),
            supervisor: SupervisorSettings {
                runtime_dir: runtime_dir.path().to_path_buf(),
                ..Default::default()
            },
            interfaces: Arc::new(DuplexProvider::default()),
            codecs: CodecRegistry::default(),
        });
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let router = create_router(Arc::new(AppState {
            session,
            store,
            scope: "default".to_string(),
            shutdown_tx,
        }));
        TestApp {
            router,
            launcher,
            _dirs: (store_dir, runtime_dir),
        }
    }

    fn http_config() -> Config {
        let mut config = Config::for_protocol(Protocol::Http);
        config.server_address = "proxy.example.com".to_string();
        config.server_port = 3128;
        config
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Bytes) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes)
    }

    fn json_body(config: &Config) -> Body {
        Body::from(serde_json::to_vec(config).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_idle_status() {
        let app = app();
        let (status, body) = send(&app.router, Method::GET, "/api/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"OK");

        let (status, body) = send(&app.router, Method::GET, "/api/session", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let session: SessionStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(session.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_rejects_incomplete_config() {
        let app = app();
        let mut config = Config::for_protocol(Protocol::Ssh);
        config.ssh.enabled = true;
        config.ssh.host = "h".to_string();
        config.ssh.username = "u".to_string();

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/session/connect",
            json_body(&config),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.issues.iter().any(|i| i.field == "sshConfig.sshPassword"));
        assert_eq!(app.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let app = app();

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/session/connect",
            json_body(&http_config()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let session: SessionStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.protocol, Some(Protocol::Http));

        let (status, _) = send(
            &app.router,
            Method::POST,
            "/api/session/connect",
            json_body(&http_config()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            send(&app.router, Method::POST, "/api/session/disconnect", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let session: SessionStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(session.state, SessionState::Idle);

        let (status, _) =
            send(&app.router, Method::POST, "/api/session/disconnect", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_connect_with_corrupt_body() {
        let app = app();
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/session/connect",
            Body::from("{not json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("Corrupt"));
    }

    #[tokio::test]
    async fn test_stored_config_round_trip() {
        let app = app();

        let (status, _) = send(
            &app.router,
            Method::PUT,
            "/api/config",
            json_body(&Config::for_protocol(Protocol::Ssh)),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        // Nothing saved yet: the protocol default comes back
        let (status, body) = send(&app.router, Method::GET, "/api/config", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let stored: Config = serde_json::from_slice(&body).unwrap();
        assert_eq!(stored, Config::default());

        let (status, _) =
            send(&app.router, Method::PUT, "/api/config", json_body(&http_config())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app.router, Method::GET, "/api/config", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let stored: Config = serde_json::from_slice(&body).unwrap();
        assert_eq!(stored, http_config());

        // Empty body connects with what was stored
        let (status, body) =
            send(&app.router, Method::POST, "/api/session/connect", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let session: SessionStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(session.protocol, Some(Protocol::Http));
    }

    #[tokio::test]
    async fn test_unwritable_store_is_server_error() {
        let app = app_with_store_root(|dir| {
            let blocked = dir.join("blocked");
            std::fs::write(&blocked, b"not a directory").unwrap();
            blocked
        });

        let (status, body) =
            send(&app.router, Method::PUT, "/api/config", json_body(&http_config())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(!err.error.is_empty());

        // Reads fall back to defaults
        let (status, body) = send(&app.router, Method::GET, "/api/config", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let stored: Config = serde_json::from_slice(&body).unwrap();
        assert_eq!(stored, Config::default());
    }

    #[tokio::test]
    async fn test_acknowledge_without_failure_conflicts() {
        let app = app();
        let (status, _) =
            send(&app.router, Method::POST, "/api/session/acknowledge", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_heartbeat_stream_emits() {
        let mut stream = heartbeat_stream();
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended")
            .unwrap();

        assert!(heartbeat_payload().contains("\"type\":\"heartbeat\""));
    }
}
