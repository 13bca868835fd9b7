// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

//! Server-Sent Events listener for session updates from the daemon

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::daemon_client::{create_daemon_client, DaemonClientConfig};
use crate::types::SessionEvent;

/// Event listener for the daemon SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
}

impl EventListener {
    pub fn new(config: DaemonClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to daemon events.
    /// Reconnects with exponential backoff if the stream drops; stops once
    /// the receiver is dropped.
    pub fn listen(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match Self::stream_events(&config, &tx).await {
                    // Stream delivered something; start over with a short delay
                    Ok(true) => backoff = Duration::from_secs(1),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Event stream error: {:#}", e),
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        rx
    }

    /// Returns whether at least one event was delivered
    async fn stream_events(
        config: &DaemonClientConfig,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<bool> {
        let url = format!("{}/api/events", config.daemon_base_url());
        let client = create_daemon_client(config)?;

        let response = client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut delivered = false;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("Error reading event stream")?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find("\n\n") {
                let message: String = buffer.drain(..pos + 2).collect();

                if let Some(event) = parse_sse_message(&message) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Receiver dropped, stopping event listener");
                        return Ok(delivered);
                    }
                    delivered = true;
                }
            }
        }

        Ok(delivered)
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DaemonClientConfig::default())
    }
}

/// Parse one SSE message block into a session event.
/// Comment lines and non-data fields are ignored.
pub fn parse_sse_message(message: &str) -> Option<SessionEvent> {
    for line in message.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(data) {
            Ok(event) => return Some(event),
            Err(e) => tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e),
        }
    }
    None
}
