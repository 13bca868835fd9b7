// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - Daemon Client Module
// Control API calls shared by the CLI and other front ends

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::{ErrorResponse, SessionStatus};

/// File name of the daemon's control socket
pub const SOCKET_FILE_NAME: &str = "maccaronia.sock";

const RUNTIME_SUBDIR: &str = "maccaronia";
const SYSTEM_SOCKET_PATH: &str = "/run/maccaronia/maccaronia.sock";

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// Plain HTTP on a loopback address
    Http,
}

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Daemon host for HTTP mode
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port for HTTP mode
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Socket path override for UnixSocket mode (optional)
    #[serde(default)]
    pub daemon_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    3480
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            daemon_url: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DaemonClientConfig {
    /// Base URL for API requests
    pub fn daemon_base_url(&self) -> String {
        match self.connection_mode {
            // reqwest routes the request over the socket; the host is a placeholder
            ConnectionMode::UnixSocket => "http://daemon".to_string(),
            ConnectionMode::Http => format!(
                "http://{}",
                crate::format_host_port(&self.daemon_host, self.daemon_port)
            ),
        }
    }

    /// Resolve the daemon's Unix socket.
    ///
    /// Order: explicit `daemon_url`, then the user runtime directory, then
    /// the system-wide location. Falls back to the user path when neither
    /// exists yet.
    pub fn socket_path(&self) -> Result<PathBuf> {
        let candidate = self.daemon_url.trim();
        if !candidate.is_empty()
            && (candidate.starts_with('/') || candidate.starts_with("./") || candidate.starts_with("../"))
        {
            return Ok(PathBuf::from(candidate));
        }

        let user_socket = dirs::runtime_dir().map(|runtime_dir| {
            let socket_dir = if runtime_dir.file_name() == Some(OsStr::new(RUNTIME_SUBDIR)) {
                runtime_dir
            } else {
                runtime_dir.join(RUNTIME_SUBDIR)
            };
            socket_dir.join(SOCKET_FILE_NAME)
        });

        if let Some(path) = user_socket.as_ref().filter(|p| p.exists()) {
            return Ok(path.clone());
        }

        let system_socket = PathBuf::from(SYSTEM_SOCKET_PATH);
        if system_socket.exists() {
            return Ok(system_socket);
        }

        user_socket.ok_or_else(|| {
            anyhow::anyhow!("Could not determine runtime directory and no system socket found")
        })
    }
}

/// Create an HTTP client configured to reach the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));

    if config.connection_mode == ConnectionMode::UnixSocket {
        client_builder = client_builder.unix_socket(config.socket_path()?);
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Fetch the current session snapshot
pub async fn fetch_status(client: &Client, config: &DaemonClientConfig) -> Result<SessionStatus> {
    let url = format!("{}/api/session", config.daemon_base_url());
    let resp = client
        .get(&url)
        .send()
        .await
        .context("Failed to reach daemon. Is the daemon running?")?;
    parse_json(resp, "get session status").await
}

/// Ask the daemon to connect.
///
/// `None` connects with the configuration saved in the daemon's store.
pub async fn connect_session(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel: Option<&Config>,
) -> Result<SessionStatus> {
    let url = format!("{}/api/session/connect", config.daemon_base_url());
    let mut request = client.post(&url);
    if let Some(tunnel) = tunnel {
        request = request.json(tunnel);
    }

    let resp = request
        .send()
        .await
        .context("Failed to send connect request to daemon. Is the daemon running?")?;
    parse_json(resp, "connect").await
}

/// Ask the daemon to disconnect
pub async fn disconnect_session(
    client: &Client,
    config: &DaemonClientConfig,
) -> Result<SessionStatus> {
    let url = format!("{}/api/session/disconnect", config.daemon_base_url());
    let resp = client
        .post(&url)
        .send()
        .await
        .context("Failed to send disconnect request to daemon")?;
    parse_json(resp, "disconnect").await
}

/// Clear a Failed session back to Idle
pub async fn acknowledge_failure(
    client: &Client,
    config: &DaemonClientConfig,
) -> Result<SessionStatus> {
    let url = format!("{}/api/session/acknowledge", config.daemon_base_url());
    let resp = client
        .post(&url)
        .send()
        .await
        .context("Failed to send acknowledge request to daemon")?;
    parse_json(resp, "acknowledge").await
}

/// Read the configuration stored by the daemon
pub async fn fetch_config(client: &Client, config: &DaemonClientConfig) -> Result<Config> {
    let url = format!("{}/api/config", config.daemon_base_url());
    let resp = client
        .get(&url)
        .send()
        .await
        .context("Failed to fetch configuration from daemon")?;
    parse_json(resp, "get configuration").await
}

/// Validate and store a configuration in the daemon
pub async fn store_config(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel: &Config,
) -> Result<()> {
    let url = format!("{}/api/config", config.daemon_base_url());
    let resp = client
        .put(&url)
        .json(tunnel)
        .send()
        .await
        .context("Failed to send configuration to daemon")?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(error_from_response(resp, "store configuration").await)
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(resp: Response, action: &str) -> Result<T> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp, action).await);
    }
    resp.json()
        .await
        .with_context(|| format!("Failed to parse daemon reply to {}", action))
}

/// Turn a non-success reply into an error carrying the daemon's message
async fn error_from_response(resp: Response, action: &str) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) if err.issues.is_empty() => {
            anyhow::anyhow!("Failed to {}: {} ({})", action, err.error, status)
        }
        Ok(err) => {
            let issues = err
                .issues
                .iter()
                .map(|i| format!("  - {}", i))
                .collect::<Vec<_>>()
                .join("\n");
            anyhow::anyhow!("Failed to {}: {}\n{}", action, err.error, issues)
        }
        Err(_) => anyhow::anyhow!("Failed to {}: {} - {}", action, status, body),
    }
}
