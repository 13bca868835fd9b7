// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Common types for Maccaronia Tunnel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ConfigIssue, Protocol};

/// Lifecycle state of the tunnel session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,          // no session, ready for a connect request
    Connecting,    // acquiring supervisor + interface
    Connected,     // capture loop running
    Disconnecting, // tearing down
    Failed,        // attempt or running session failed, awaiting acknowledgment
}

impl SessionState {
    /// Check if the state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Check if the state represents a transitional state
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Disconnecting
        )
    }

    /// Whether a connect request is accepted from this state
    pub fn accepts_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Packet counters for the current session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_read: u64,
    pub frames_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Frames not written back (dispatch error or write failure)
    pub frames_dropped: u64,
    pub dispatch_errors: u64,
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Human-readable detail (failure cause, local proxy port, ...)
    pub message: String,
    /// Present while a session exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Port of the SSH supervisor's local listener (0 when not bound)
    #[serde(default)]
    pub local_proxy_port: u16,
    #[serde(default)]
    pub stats: SessionStats,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            message: "Disconnected".to_string(),
            ..Default::default()
        }
    }
}

/// Events emitted by the session orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connecting {
        id: Uuid,
        protocol: Protocol,
        timestamp: DateTime<Utc>,
    },

    Connected {
        id: Uuid,
        local_proxy_port: u16,
        timestamp: DateTime<Utc>,
    },

    /// Session disconnected on request
    Disconnected {
        id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Connect rejected before any resource was acquired
    Rejected {
        issues: Vec<ConfigIssue>,
        timestamp: DateTime<Utc>,
    },

    /// Startup failure or runtime tunnel death
    Failed {
        id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

/// Reply body for a rejected control request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ConfigIssue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Idle.accepts_connect());
        assert!(SessionState::Failed.accepts_connect());
        assert!(!SessionState::Connected.accepts_connect());
        assert!(SessionState::Connecting.is_in_progress());
        assert!(!SessionState::Failed.is_in_progress());
    }

    #[test]
    fn test_event_wire_format() {
        let event = SessionEvent::Failed {
            id: Uuid::nil(),
            error: "tunnel died".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"failed\""));

        let status = SessionStatus::idle();
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"idle\""));
        assert!(!json.contains("session_id"));
    }
}
