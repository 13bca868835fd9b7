// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - Common Library
// Configuration model and store, shared session types, daemon client

pub mod config;
pub mod daemon_client;
pub mod error;
pub mod network;
pub mod seal;
pub mod sse;
pub mod store;
pub mod types;

pub use config::{
    Config, ConfigIssue, CustomUdpConfig, DnsConfig, PayloadConfig, Protocol, SniConfig,
    SshConfig, SshTunnelMethod, V2RayConfig,
};
pub use daemon_client::{
    acknowledge_failure, connect_session, create_daemon_client, disconnect_session,
    fetch_config, fetch_status, store_config, ConnectionMode, DaemonClientConfig,
};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use sse::EventListener;
pub use store::{ConfigStore, DEFAULT_SCOPE, EXPORT_EXTENSION};
pub use types::{ErrorResponse, SessionEvent, SessionState, SessionStats, SessionStatus};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
