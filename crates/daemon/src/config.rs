// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - Daemon Config Module
// Listener, supervisor and interface settings read from daemon.toml

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use maccaronia_common::daemon_client::SOCKET_FILE_NAME;
use maccaronia_common::{is_loopback_address, DEFAULT_SCOPE};

use crate::interface::{InheritedFdProvider, InterfaceProvider, UnavailableProvider};
use crate::ssh::SupervisorSettings;

const APP_DIR: &str = "maccaronia";

/// Runtime directory for the socket, PID file and ssh helpers
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Get the socket path for the daemon
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join(SOCKET_FILE_NAME))
}

/// Listener mode for the control API
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// Plain HTTP, loopback addresses only
    TcpHttp,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind address for tcp-http mode (e.g. "127.0.0.1:3480")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Enable group access to the Unix socket and runtime directory
    /// (0770/0660 instead of 0700/0600)
    #[serde(default)]
    pub group_access: bool,

    /// ssh client binary
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Store scope used when connecting without an explicit configuration
    #[serde(default = "default_config_scope")]
    pub config_scope: String,

    /// Concurrent connections accepted by the SSH supervisor listener
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Deadline for SOCKS negotiation and upstream connects
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Descriptor of a TUN device handed over by the launching process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_fd: Option<i32>,
}

fn default_bind_address() -> String {
    "127.0.0.1:3480".to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_config_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_max_connections() -> usize {
    256
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_address: default_bind_address(),
            group_access: false,
            ssh_program: default_ssh_program(),
            config_scope: default_config_scope(),
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            tun_fd: None,
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp && !bind_host_is_loopback(&self.bind_address)
        {
            anyhow::bail!(
                "Security violation: tcp-http mode only binds loopback addresses \
                 (bind_address: {}).\n\
                 Use 127.0.0.1, ::1 or localhost, or switch listener_mode to 'unix-socket'.",
                self.bind_address
            );
        }

        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be greater than 0");
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("handshake_timeout_secs must be greater than 0");
        }
        if self.ssh_program.trim().is_empty() {
            anyhow::bail!("ssh_program cannot be empty");
        }
        if self.tun_fd.is_some_and(|fd| fd < 0) {
            anyhow::bail!("tun_fd must be a non-negative descriptor");
        }

        Ok(())
    }

    /// Settings for the SSH supervisor
    pub fn supervisor_settings(&self, runtime_dir: &Path) -> SupervisorSettings {
        SupervisorSettings {
            program: self.ssh_program.clone(),
            max_connections: self.max_connections,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            runtime_dir: runtime_dir.join("ssh"),
            ..Default::default()
        }
    }

    /// Where the session gets its virtual interface from
    pub fn interface_provider(&self) -> Arc<dyn InterfaceProvider> {
        match self.tun_fd {
            Some(fd) => Arc::new(InheritedFdProvider::new(fd)),
            None => Arc::new(UnavailableProvider),
        }
    }

    /// Load from the default location, writing defaults on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read daemon configuration")?;
        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;
        fs::write(config_path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(config_path, fs::Permissions::from_mode(0o600))
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("daemon.toml"))
    }
}

fn bind_host_is_loopback(bind_address: &str) -> bool {
    if let Ok(addr) = bind_address.parse::<SocketAddr>() {
        return addr.ip().is_loopback();
    }
    match bind_address.rsplit_once(':') {
        Some((host, _port)) => is_loopback_address(host.trim_matches(['[', ']'])),
        None => is_loopback_address(bind_address),
    }
}

/// Write a cli.toml snippet matching this daemon's listener
pub fn write_cli_config_snippet(config: &DaemonConfig) -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    let snippet_path = config_dir.join(APP_DIR).join("cli-config.snippet");
    if let Some(parent) = snippet_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    fs::write(&snippet_path, cli_config_snippet(config))
        .context("Failed to write CLI config snippet")?;

    info!("CLI configuration snippet written to {}", snippet_path.display());
    info!(
        "To configure the CLI, run: cp {} ~/.config/maccaronia/cli.toml",
        snippet_path.display()
    );
    Ok(snippet_path)
}

fn cli_config_snippet(config: &DaemonConfig) -> String {
    let header = "# CLI configuration for Maccaronia Tunnel\n\
                  # Copy this to ~/.config/maccaronia/cli.toml\n\n";
    match config.listener_mode {
        ListenerMode::UnixSocket => {
            let socket = socket_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "auto-detect".to_string());
            format!(
                "{}connection_mode = \"unix-socket\"\n\
                 # Socket path (auto-detected by default): {}\n\
                 # daemon_url = \"{}\"\n",
                header, socket, socket
            )
        }
        ListenerMode::TcpHttp => {
            let (host, port) = config
                .bind_address
                .rsplit_once(':')
                .unwrap_or((config.bind_address.as_str(), "3480"));
            format!(
                "{}connection_mode = \"http\"\n\
                 daemon_host = \"{}\"\n\
                 daemon_port = {}\n",
                header,
                host.trim_matches(['[', ']']),
                port
            )
        }
    }
}
