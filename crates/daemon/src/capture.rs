// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

//! Packet capture loop.
//!
//! Reads frames from the virtual interface, routes each one through the
//! [`Dispatcher`] and writes the result back. A frame that fails or panics
//! in its route is dropped and counted; the loop itself only ends when its
//! cancellation token fires.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use maccaronia_common::SessionStats;

use crate::dispatch::{DispatchError, Dispatcher};

/// Largest frame read in one go
pub const FRAME_BUFFER_SIZE: usize = 32 * 1024;

/// Pause after an empty or failed read
const READ_BACKOFF: Duration = Duration::from_millis(10);

/// Counters shared between the loop and status readers
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_read: AtomicU64,
    frames_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    frames_dropped: AtomicU64,
    dispatch_errors: AtomicU64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter at the start of a session
    pub fn reset(&self) {
        for counter in [
            &self.frames_read,
            &self.frames_written,
            &self.bytes_read,
            &self.bytes_written,
            &self.frames_dropped,
            &self.dispatch_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct CaptureLoop {
    dispatcher: Arc<Dispatcher>,
    stats: Arc<CaptureStats>,
    cancel: CancellationToken,
}

impl CaptureLoop {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        stats: Arc<CaptureStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            stats,
            cancel,
        }
    }

    /// Run until cancelled. Consumes the interface stream so it is released
    /// when the loop returns.
    pub async fn run<T>(self, mut tun: T)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; FRAME_BUFFER_SIZE];
        info!("Capture loop started ({:?})", self.dispatcher.route());

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = tun.read(&mut buf) => read,
            };

            let len = match read {
                Ok(0) => {
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
                Ok(len) => len,
                Err(e) => {
                    debug!("Interface read failed: {}", e);
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_read.fetch_add(len as u64, Ordering::Relaxed);

            let out = match self.route_frame(&buf[..len]) {
                Ok(out) => out,
                Err(e) => {
                    trace!("Dropped {}-byte frame: {}", len, e);
                    self.stats.dispatch_errors.fetch_add(1, Ordering::Relaxed);
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if out.is_empty() {
                continue;
            }

            let written = tokio::select! {
                _ = self.cancel.cancelled() => break,
                written = tun.write_all(&out) => written,
            };
            match written {
                Ok(()) => {
                    self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_written
                        .fetch_add(out.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!("Interface write failed: {}", e);
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        info!("Capture loop stopped: {:?}", self.stats.snapshot());
    }

    fn route_frame<'a>(
        &self,
        frame: &'a [u8],
    ) -> Result<std::borrow::Cow<'a, [u8]>, DispatchError> {
        match catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(frame))) {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Panicked),
        }
    }

    /// Back off briefly; true when cancelled meanwhile
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(READ_BACKOFF) => false,
        }
    }
}
