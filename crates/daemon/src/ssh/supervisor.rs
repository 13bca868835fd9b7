// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - SSH Tunnel Supervisor
// Owns the ssh process, the local listener and the per-connection workers

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use maccaronia_common::{Config, SshTunnelMethod};

use super::command::{Forwarding, SshCommand};
use super::credentials::CredentialFiles;
use super::process::{ProcessLauncher, TunnelProcess};
use crate::socks::{self, SocksAddr, SocksError};

/// How long `stop()` waits for in-flight relays before abandoning them
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Back-off after accept fails for lack of resources
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("SSH tunnel is already running")]
    AlreadyRunning,

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to prepare SSH credentials: {0}")]
    Credentials(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Raised to the owner of the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The ssh process of run `generation` exited without being asked to
    TunnelDied {
        generation: u64,
        exit_code: Option<i32>,
    },
}

/// Identifies a started run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRun {
    /// Port of the bound local listener
    pub local_port: u16,
    /// Matches the `generation` of this run's `TunnelDied`
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// ssh binary to launch
    pub program: String,
    /// Address the local listener binds (loopback)
    pub bind_ip: IpAddr,
    /// Upper bound on concurrent relay workers
    pub max_connections: usize,
    /// Deadline for the SOCKS greeting and upstream CONNECT
    pub handshake_timeout: Duration,
    /// Private directory for askpass helpers and inline keys
    pub runtime_dir: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_connections: 256,
            handshake_timeout: Duration::from_secs(10),
            runtime_dir: std::env::temp_dir().join("maccaronia"),
        }
    }
}

/// Cheap read-only view of the supervisor state
#[derive(Debug, Clone)]
pub struct TunnelLiveness {
    state: watch::Receiver<SupervisorState>,
}

impl TunnelLiveness {
    pub fn is_active(&self) -> bool {
        *self.state.borrow() == SupervisorState::Running
    }

    /// Liveness pinned to a fixed state
    #[cfg(test)]
    pub(crate) fn fixed(state: SupervisorState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { state: rx }
    }
}

/// What a worker does with an accepted local connection
#[derive(Debug, Clone, Copy)]
enum Relay {
    /// SOCKS5 with the client, then CONNECT through ssh's SOCKS port
    SocksThrough(SocketAddr),
    /// Plain byte relay into an ssh `-L` port
    Raw(SocketAddr),
    /// SOCKS5 with the client, then connect directly
    SocksDirect,
}

struct Running {
    generation: u64,
    cancel: CancellationToken,
    workers: TaskTracker,
    accept: JoinHandle<()>,
    watcher: JoinHandle<()>,
    _credentials: CredentialFiles,
}

impl Running {
    async fn shutdown(self) {
        // Closes the listener and unblocks every worker
        self.cancel.cancel();

        if let Err(e) = self.accept.await {
            debug!("Accept loop ended abnormally: {}", e);
        }

        self.workers.close();
        if timeout(WORKER_DRAIN_TIMEOUT, self.workers.wait()).await.is_err() {
            warn!("Relay workers did not finish within {:?}", WORKER_DRAIN_TIMEOUT);
        }

        // The watcher kills and reaps the process on cancellation
        if let Err(e) = self.watcher.await {
            debug!("Exit watcher ended abnormally: {}", e);
        }
    }
}

struct Inner {
    launcher: Arc<dyn ProcessLauncher>,
    settings: SupervisorSettings,
    events: mpsc::Sender<SupervisorEvent>,
    /// Serializes start/stop
    lifecycle: Mutex<Option<Running>>,
    state: watch::Sender<SupervisorState>,
    local_port: AtomicU16,
    generation: AtomicU64,
}

/// Supervises one ssh tunnel at a time
#[derive(Clone)]
pub struct SshSupervisor {
    inner: Arc<Inner>,
}

impl SshSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        settings: SupervisorSettings,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            inner: Arc::new(Inner {
                launcher,
                settings,
                events,
                lifecycle: Mutex::new(None),
                state,
                local_port: AtomicU16::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    /// Port of the bound local listener, 0 when not bound
    pub fn local_proxy_port(&self) -> u16 {
        self.inner.local_port.load(Ordering::SeqCst)
    }

    pub fn liveness(&self) -> TunnelLiveness {
        TunnelLiveness {
            state: self.inner.state.subscribe(),
        }
    }

    /// Launch ssh and start accepting on `ssh.local_port`.
    ///
    /// Returns the run once the listener is accepting. Any failure leaves
    /// nothing behind: a launched process is killed and reaped.
    pub async fn start(&self, config: &Config) -> Result<TunnelRun, SupervisorError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.set_state(SupervisorState::Starting);
        match self.launch(config).await {
            Ok(running) => {
                let run = TunnelRun {
                    local_port: self.local_proxy_port(),
                    generation: running.generation,
                };
                *lifecycle = Some(running);
                self.set_state(SupervisorState::Running);
                info!(
                    "SSH tunnel to {}@{} running, local listener on port {}",
                    config.ssh.username, config.ssh.host, run.local_port
                );
                Ok(run)
            }
            Err(e) => {
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self, config: &Config) -> Result<Running, SupervisorError> {
        let settings = &self.inner.settings;
        let ssh = &config.ssh;

        let forward_port = match ssh.tunnel_method {
            // The remote side dials back into our listener; no private port
            SshTunnelMethod::RemoteForward => 0,
            _ => reserve_loopback_port()?,
        };
        let forwarding =
            Forwarding::for_method(ssh, forward_port, &config.server_address, config.server_port);

        let credentials = CredentialFiles::prepare(&settings.runtime_dir, ssh)
            .map_err(SupervisorError::Credentials)?;
        let command =
            SshCommand::from_config(&settings.program, ssh, &forwarding, credentials.identity())
                .with_env(credentials.env());
        debug!("Launching {:?}", command);

        let mut process = self
            .inner
            .launcher
            .launch(&command)
            .await
            .map_err(|source| SupervisorError::Spawn {
                program: settings.program.clone(),
                source,
            })?;

        let bind_addr = SocketAddr::new(settings.bind_ip, ssh.local_port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                warn!("Failed to bind {}, rolling back ssh process", bind_addr);
                reap(process.as_mut()).await;
                return Err(SupervisorError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(source) => {
                reap(process.as_mut()).await;
                return Err(SupervisorError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };
        self.inner.local_port.store(port, Ordering::SeqCst);

        let loopback = |port| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let relay = match &forwarding {
            Forwarding::Dynamic { port } => Relay::SocksThrough(loopback(*port)),
            Forwarding::Local { port, .. } => Relay::Raw(loopback(*port)),
            Forwarding::Remote { .. } => Relay::SocksDirect,
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let workers = TaskTracker::new();

        let accept = tokio::spawn(accept_loop(
            listener,
            relay,
            Arc::new(Semaphore::new(settings.max_connections.max(1))),
            settings.handshake_timeout,
            cancel.clone(),
            workers.clone(),
        ));
        let watcher = tokio::spawn(watch_process(
            process,
            cancel.clone(),
            Arc::downgrade(&self.inner),
            generation,
        ));

        Ok(Running {
            generation,
            cancel,
            workers,
            accept,
            watcher,
            _credentials: credentials,
        })
    }

    /// Kill the process and close the listener. Idempotent.
    pub async fn stop(&self) {
        self.stop_generation(None).await;
    }

    /// Stop the run identified by `generation` (any run when None).
    /// Returns whether a run was stopped.
    async fn stop_generation(&self, generation: Option<u64>) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let matches = match lifecycle.as_ref() {
            Some(running) => generation.map_or(true, |g| running.generation == g),
            None => false,
        };
        if !matches {
            return false;
        }
        let Some(running) = lifecycle.take() else {
            return false;
        };

        self.set_state(SupervisorState::Stopping);
        running.shutdown().await;
        self.inner.local_port.store(0, Ordering::SeqCst);
        self.set_state(SupervisorState::Stopped);
        info!("SSH tunnel stopped");
        true
    }

    fn set_state(&self, state: SupervisorState) {
        self.inner.state.send_replace(state);
    }
}

/// Pick a free loopback port for ssh's side of the forward.
/// The port is released before ssh binds it; ExitOnForwardFailure turns a
/// lost race into a process exit.
fn reserve_loopback_port() -> Result<u16, SupervisorError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    std::net::TcpListener::bind(addr)
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .map_err(|source| SupervisorError::Bind { addr, source })
}

async fn reap(process: &mut dyn TunnelProcess) {
    if let Err(e) = process.kill().await {
        warn!("Failed to kill ssh process {:?}: {}", process.id(), e);
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: Relay,
    limit: Arc<Semaphore>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
    workers: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Ok(permit) = limit.clone().try_acquire_owned() else {
                    warn!("Connection limit reached, rejecting {}", peer);
                    continue;
                };

                let cancel = cancel.child_token();
                workers.spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = cancel.cancelled() => debug!("Relay for {} cancelled", peer),
                        result = handle_connection(stream, relay, handshake_timeout) => {
                            match result {
                                Ok((up, down)) => debug!(
                                    "Relay for {} closed: {} bytes up, {} bytes down",
                                    peer, up, down
                                ),
                                Err(e) => debug!("Relay for {} ended: {}", peer, e),
                            }
                        }
                    }
                });
            }
            Err(e) if is_transient_accept_error(&e) => {
                warn!("Transient accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                error!("Local listener failed: {}", e);
                break;
            }
        }
    }
    debug!("Accept loop finished");
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Serve one accepted connection. The client socket is owned here and is
/// closed on every return path.
async fn handle_connection(
    mut client: TcpStream,
    relay: Relay,
    handshake_timeout: Duration,
) -> Result<(u64, u64), SocksError> {
    match relay {
        Relay::Raw(upstream) => {
            let mut upstream = with_deadline(handshake_timeout, async {
                Ok(TcpStream::connect(upstream).await?)
            })
            .await?;
            Ok(copy_bidirectional(&mut client, &mut upstream).await?)
        }
        Relay::SocksThrough(proxy) => {
            let target =
                with_deadline(handshake_timeout, socks::accept_connect(&mut client)).await?;
            debug!("SOCKS5 CONNECT {} via ssh", target);

            let connected = with_deadline(handshake_timeout, async {
                let mut upstream = TcpStream::connect(proxy).await?;
                socks::connect_via(&mut upstream, &target).await?;
                Ok(upstream)
            })
            .await;

            let mut upstream = match connected {
                Ok(upstream) => upstream,
                Err(e) => {
                    let _ = socks::send_reply(&mut client, socks::error_to_reply(&e), &target)
                        .await;
                    return Err(e);
                }
            };

            let bound = upstream
                .local_addr()
                .map(SocksAddr::from)
                .unwrap_or_else(|_| SocksAddr::unspecified());
            socks::send_reply(&mut client, socks::REPLY_SUCCEEDED, &bound).await?;
            Ok(copy_bidirectional(&mut client, &mut upstream).await?)
        }
        Relay::SocksDirect => {
            let target =
                with_deadline(handshake_timeout, socks::accept_connect(&mut client)).await?;
            debug!("SOCKS5 CONNECT {} direct", target);

            let mut upstream = match with_deadline(handshake_timeout, async {
                Ok(target.connect().await?)
            })
            .await
            {
                Ok(upstream) => upstream,
                Err(e) => {
                    let reply = match &e {
                        SocksError::Io(io) => socks::io_error_to_reply(io),
                        other => socks::error_to_reply(other),
                    };
                    let _ = socks::send_reply(&mut client, reply, &target).await;
                    return Err(e);
                }
            };

            let bound = upstream
                .local_addr()
                .map(SocksAddr::from)
                .unwrap_or_else(|_| SocksAddr::unspecified());
            socks::send_reply(&mut client, socks::REPLY_SUCCEEDED, &bound).await?;
            Ok(copy_bidirectional(&mut client, &mut upstream).await?)
        }
    }
}

async fn with_deadline<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, SocksError>>,
) -> Result<T, SocksError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SocksError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "handshake timed out",
        ))),
    }
}

/// Owns the process for the lifetime of a run.
///
/// Cancellation means a stop is in progress: kill and reap. A natural exit
/// tears the run down and reports `TunnelDied`.
async fn watch_process(
    mut process: Box<dyn TunnelProcess>,
    cancel: CancellationToken,
    supervisor: Weak<Inner>,
    generation: u64,
) {
    let exited = tokio::select! {
        _ = cancel.cancelled() => None,
        status = process.wait() => Some(status),
    };

    let Some(status) = exited else {
        reap(process.as_mut()).await;
        debug!("ssh process {:?} killed on stop", process.id());
        return;
    };

    let exit_code = match status {
        Ok(code) => code,
        Err(e) => {
            warn!("Failed to wait for ssh process: {}", e);
            None
        }
    };
    error!("ssh process exited unexpectedly (exit code {:?})", exit_code);

    // Unblock the accept loop and workers right away
    cancel.cancel();

    // stop() awaits this task, so the teardown runs elsewhere
    if let Some(inner) = supervisor.upgrade() {
        tokio::spawn(async move {
            let supervisor = SshSupervisor { inner };
            if supervisor.stop_generation(Some(generation)).await {
                let event = SupervisorEvent::TunnelDied {
                    generation,
                    exit_code,
                };
                if supervisor.inner.events.send(event).await.is_err() {
                    debug!("No listener for tunnel events");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::process::testing::FakeLauncher;
    use maccaronia_common::Protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn settings(runtime: &std::path::Path) -> SupervisorSettings {
        SupervisorSettings {
            handshake_timeout: Duration::from_secs(2),
            runtime_dir: runtime.to_path_buf(),
            ..Default::default()
        }
    }

    fn config(method: SshTunnelMethod) -> Config {
        let mut config = Config::for_protocol(Protocol::Ssh);
        config.ssh.enabled = true;
        config.ssh.host = "h".to_string();
        config.ssh.username = "u".to_string();
        config.ssh.password = "p".to_string();
        config.ssh.tunnel_method = method;
        // Let the OS pick
        config.ssh.local_port = 0;
        config
    }

    fn supervisor(
        launcher: &FakeLauncher,
        runtime: &std::path::Path,
    ) -> (SshSupervisor, mpsc::Receiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::channel(4);
        (
            SshSupervisor::new(Arc::new(launcher.clone()), settings(runtime), tx),
            rx,
        )
    }

    /// Port of the forward the supervisor asked ssh to open
    fn forward_port(launcher: &FakeLauncher, flag: &str) -> u16 {
        let launches = launcher.launches.lock().unwrap();
        let args = &launches.last().unwrap().args;
        let pos = args.iter().position(|a| a == flag).unwrap();
        args[pos + 1]
            .trim_start_matches("127.0.0.1:")
            .split(':')
            .next()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());

        assert!(!sup.is_active());
        let run = sup.start(&config(SshTunnelMethod::DynamicSocks)).await.unwrap();
        let port = run.local_port;
        assert_ne!(port, 0);
        assert_eq!(run.generation, 1);
        assert_eq!(sup.local_proxy_port(), port);
        assert!(sup.is_active());
        assert!(sup.liveness().is_active());
        assert_eq!(launcher.launch_count(), 1);

        // Listener accepts as soon as start returns
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        sup.stop().await;
        assert!(!sup.is_active());
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sup.local_proxy_port(), 0);
        assert_eq!(launcher.kill_count(), 1);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // Credential files are gone with the run
        assert_eq!(std::fs::read_dir(runtime.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());

        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);

        sup.start(&config(SshTunnelMethod::DynamicSocks)).await.unwrap();
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(launcher.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());

        sup.start(&config(SshTunnelMethod::DynamicSocks)).await.unwrap();
        assert!(matches!(
            sup.start(&config(SshTunnelMethod::DynamicSocks)).await,
            Err(SupervisorError::AlreadyRunning)
        ));
        assert_eq!(launcher.launch_count(), 1);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());

        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config(SshTunnelMethod::DynamicSocks);
        config.ssh.local_port = occupied.local_addr().unwrap().port();

        let err = sup.start(&config).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Bind { .. }));
        assert!(!sup.is_active());
        assert_eq!(sup.local_proxy_port(), 0);
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(launcher.kill_count(), 1);

        // A clean retry is possible afterwards
        config.ssh.local_port = 0;
        sup.start(&config).await.unwrap();
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        launcher
            .fail_spawn
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (sup, _events) = supervisor(&launcher, runtime.path());

        let err = sup.start(&config(SshTunnelMethod::DynamicSocks)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(std::fs::read_dir(runtime.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_exit_reports_tunnel_died() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, mut events) = supervisor(&launcher, runtime.path());

        let run = sup.start(&config(SshTunnelMethod::DynamicSocks)).await.unwrap();
        launcher.exit_last(255);

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SupervisorEvent::TunnelDied {
                generation: run.generation,
                exit_code: Some(255)
            }
        );
        assert!(!sup.is_active());
        assert_eq!(sup.local_proxy_port(), 0);
    }

    #[tokio::test]
    async fn test_stop_does_not_report_death() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, mut events) = supervisor(&launcher, runtime.path());

        sup.start(&config(SshTunnelMethod::DynamicSocks)).await.unwrap();
        sup.stop().await;
        assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_dynamic_relays_through_socks_upstream() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());
        let port = sup
            .start(&config(SshTunnelMethod::DynamicSocks))
            .await
            .unwrap()
            .local_port;

        // Play ssh's -D listener on the chosen forward port
        let fwd = forward_port(&launcher, "-D");
        let upstream = TcpListener::bind(("127.0.0.1", fwd)).await.unwrap();
        let fake_ssh = tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let target = socks::accept_connect(&mut conn).await.unwrap();
            socks::send_reply(&mut conn, socks::REPLY_SUCCEEDED, &SocksAddr::unspecified())
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
            (target, buf)
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let target = SocksAddr::Domain("example.com".to_string(), 443);
        socks::connect_via(&mut client, &target).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        let (seen_target, seen) = fake_ssh.await.unwrap();
        assert_eq!(seen_target, target);
        assert_eq!(&seen, b"ping");

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_local_forward_relays_raw_bytes() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());
        let port = sup
            .start(&config(SshTunnelMethod::LocalForward))
            .await
            .unwrap()
            .local_port;

        let fwd = forward_port(&launcher, "-L");
        let upstream = TcpListener::bind(("127.0.0.1", fwd)).await.unwrap();
        let echo = tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echo.await.unwrap();
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_remote_forward_serves_socks_directly() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());
        let port = sup
            .start(&config(SshTunnelMethod::RemoteForward))
            .await
            .unwrap()
            .local_port;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            conn.write_all(b"hi").await.unwrap();
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        socks::connect_via(&mut client, &SocksAddr::from(target_addr))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        server.await.unwrap();
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_upstream_failure_answered_with_socks_error() {
        let runtime = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let (sup, _events) = supervisor(&launcher, runtime.path());
        let port = sup
            .start(&config(SshTunnelMethod::DynamicSocks))
            .await
            .unwrap()
            .local_port;

        // Nothing listens on ssh's forward port
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let err = socks::connect_via(&mut client, &SocksAddr::Domain("x".to_string(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::Refused(_)));

        sup.stop().await;
    }
}
