// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Virtual interface collaborator.
// The platform creates the TUN device; the daemon only needs its byte stream.

use std::io;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use maccaronia_common::Config;

pub const SESSION_NAME: &str = "Maccaronia VPN";
pub const INTERFACE_ADDRESS: &str = "10.0.0.2";
pub const INTERFACE_PREFIX: u8 = 32;
pub const DEFAULT_MTU: u16 = 1500;

/// Raw IP frame stream of an established interface
pub trait TunIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunIo for T {}

/// Parameters handed to the platform when establishing the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceRequest {
    pub session_name: String,
    pub address: String,
    pub prefix_len: u8,
    pub dns_servers: Vec<String>,
    /// Routes as (network, prefix length)
    pub routes: Vec<(String, u8)>,
    pub mtu: u16,
}

impl InterfaceRequest {
    pub fn for_config(config: &Config) -> Self {
        let dns_servers = [&config.dns.primary, &config.dns.secondary]
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect();

        Self {
            session_name: SESSION_NAME.to_string(),
            address: INTERFACE_ADDRESS.to_string(),
            prefix_len: INTERFACE_PREFIX,
            dns_servers,
            routes: vec![("0.0.0.0".to_string(), 0)],
            mtu: DEFAULT_MTU,
        }
    }
}

/// Establishes the virtual interface. Dropping the returned stream
/// releases it.
#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    async fn establish(&self, request: &InterfaceRequest) -> io::Result<Box<dyn TunIo>>;
}

/// Uses a TUN descriptor inherited from the process that launched the daemon
#[derive(Debug, Clone, Copy)]
pub struct InheritedFdProvider {
    fd: i32,
}

impl InheritedFdProvider {
    pub fn new(fd: i32) -> Self {
        Self { fd }
    }
}

#[async_trait]
impl InterfaceProvider for InheritedFdProvider {
    async fn establish(&self, request: &InterfaceRequest) -> io::Result<Box<dyn TunIo>> {
        let tun = open_inherited(self.fd)?;
        info!(
            "Established interface '{}' {}/{} (mtu {}) on inherited fd {}",
            request.session_name, request.address, request.prefix_len, request.mtu, self.fd
        );
        Ok(tun)
    }
}

#[cfg(unix)]
fn open_inherited(fd: i32) -> io::Result<Box<dyn TunIo>> {
    Ok(Box::new(unix_fd::TunFd::open(fd)?))
}

#[cfg(not(unix))]
fn open_inherited(_fd: i32) -> io::Result<Box<dyn TunIo>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "inherited interface descriptors are only supported on Unix",
    ))
}

#[cfg(unix)]
mod unix_fd {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};

    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Non-blocking copy of the inherited descriptor, driven by the reactor.
    /// Dropping it cancels any pending read and closes only the copy.
    pub struct TunFd {
        inner: AsyncFd<File>,
    }

    impl TunFd {
        pub fn open(fd: RawFd) -> io::Result<Self> {
            let file = dup_fd(fd)?;
            set_nonblocking(file.as_raw_fd())?;
            Ok(Self {
                inner: AsyncFd::new(file)?,
            })
        }
    }

    /// Each session gets its own descriptor so dropping it never closes the
    /// inherited one
    fn dup_fd(fd: RawFd) -> io::Result<File> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface descriptor {}", fd),
            ));
        }

        // SAFETY: dup has no memory-safety preconditions; the result is checked
        let copy = unsafe { libc::dup(fd) };
        if copy < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `copy` is a fresh descriptor owned by nobody else
        Ok(unsafe { File::from_raw_fd(copy) })
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl on a descriptor we own
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl AsyncRead for TunFd {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.inner.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl AsyncWrite for TunFd {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = ready!(self.inner.poll_write_ready(cx))?;
                match guard.try_io(|inner| inner.get_ref().write(data)) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        // Frames go straight to the descriptor
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}

/// Used when no interface source is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvider;

#[async_trait]
impl InterfaceProvider for UnavailableProvider {
    async fn establish(&self, _request: &InterfaceRequest) -> io::Result<Box<dyn TunIo>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no virtual interface configured (set tun_fd in daemon.toml)",
        ))
    }
}
