// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - Session orchestrator
// A single actor task owns the session state; handles talk to it over channels

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use maccaronia_common::{
    Config, ConfigIssue, ConfigStore, Protocol, SessionEvent, SessionState, SessionStatus,
};

use crate::capture::{CaptureLoop, CaptureStats};
use crate::dispatch::{CodecRegistry, Dispatcher};
use crate::interface::{InterfaceProvider, InterfaceRequest};
use crate::ssh::{
    ProcessLauncher, SshSupervisor, SupervisorError, SupervisorEvent, SupervisorSettings,
};

const COMMAND_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 64;
const CAPTURE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration incomplete: {}", format_issues(.0))]
    InvalidConfig(Vec<ConfigIssue>),

    #[error("Cannot {action} while session is {state}")]
    IllegalTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("SSH tunnel failed to start: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Failed to establish virtual interface: {0}")]
    Interface(#[source] io::Error),

    #[error("Session actor is not running")]
    ActorGone,
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything the session needs from the outside world
pub struct SessionDeps {
    pub store: Arc<ConfigStore>,
    /// Persistence scope used by `connect(None)`
    pub scope: String,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub supervisor: SupervisorSettings,
    pub interfaces: Arc<dyn InterfaceProvider>,
    pub codecs: CodecRegistry,
}

type Reply = oneshot::Sender<Result<SessionStatus, SessionError>>;

enum Command {
    Connect { config: Option<Config>, reply: Reply },
    Disconnect { reply: Reply },
    Acknowledge { reply: Reply },
}

/// Control surface of the session actor
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    stats: Arc<CaptureStats>,
    #[cfg(test)]
    tunnel_events: mpsc::Sender<SupervisorEvent>,
}

impl SessionHandle {
    /// Spawn the actor. It runs until every handle is dropped, tearing down
    /// any live session on the way out.
    pub fn spawn(deps: SessionDeps) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(SessionStatus::idle());
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (tunnel_tx, tunnel_rx) = mpsc::channel(4);
        let stats = Arc::new(CaptureStats::default());

        let supervisor = SshSupervisor::new(
            deps.launcher.clone(),
            deps.supervisor.clone(),
            tunnel_tx.clone(),
        );
        let actor = SessionActor {
            deps,
            supervisor,
            status: status_tx,
            events: events_tx.clone(),
            stats: stats.clone(),
            active: None,
        };
        let task = tokio::spawn(actor.run(commands_rx, tunnel_rx));

        (
            Self {
                commands: commands_tx,
                status: status_rx,
                events: events_tx,
                stats,
                #[cfg(test)]
                tunnel_events: tunnel_tx,
            },
            task,
        )
    }

    /// Bring the tunnel up. `None` loads the configuration from the store.
    pub async fn connect(&self, config: Option<Config>) -> Result<SessionStatus, SessionError> {
        self.request(|reply| Command::Connect { config, reply }).await
    }

    pub async fn disconnect(&self) -> Result<SessionStatus, SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Clear a Failed session back to Idle
    pub async fn acknowledge(&self) -> Result<SessionStatus, SessionError> {
        self.request(|reply| Command::Acknowledge { reply }).await
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.borrow().clone();
        status.stats = self.stats.snapshot();
        status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch state changes without polling
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<SessionStatus, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::ActorGone)?;
        rx.await.map_err(|_| SessionError::ActorGone)?
    }
}

/// Resources of a Connected session
struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
    capture: JoinHandle<()>,
    /// Generation of the SSH run backing the session
    tunnel: Option<u64>,
}

struct SessionActor {
    deps: SessionDeps,
    supervisor: SshSupervisor,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    stats: Arc<CaptureStats>,
    active: Option<ActiveSession>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut tunnel: mpsc::Receiver<SupervisorEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                Some(event) = tunnel.recv() => self.handle_tunnel_event(event).await,
            }
        }

        if self.active.is_some() {
            info!("Session handles dropped, tearing down active session");
            self.teardown().await;
            self.set_status(SessionState::Idle, "Disconnected", None, None, 0);
        }
        debug!("Session actor finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { config, reply } => {
                let result = self.connect(config).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            Command::Acknowledge { reply } => {
                let result = self.acknowledge();
                let _ = reply.send(result);
            }
        }
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    async fn connect(&mut self, config: Option<Config>) -> Result<SessionStatus, SessionError> {
        let state = self.state();
        if !state.accepts_connect() {
            return Err(SessionError::IllegalTransition {
                action: "connect",
                state,
            });
        }

        let mut config = match config {
            Some(config) => config,
            None => self.load_config().await,
        };

        let issues = config.validate();
        if !issues.is_empty() {
            warn!("Connect rejected: {}", format_issues(&issues));
            self.set_status(SessionState::Idle, "Configuration incomplete", None, None, 0);
            self.emit(SessionEvent::Rejected {
                issues: issues.clone(),
                timestamp: Utc::now(),
            });
            config.ssh.zeroize();
            return Err(SessionError::InvalidConfig(issues));
        }

        let id = Uuid::new_v4();
        let protocol = config.protocol;
        info!("Session {} connecting ({})", id, protocol);
        self.stats.reset();
        self.set_status(
            SessionState::Connecting,
            &format!("Connecting via {}", protocol),
            Some(id),
            Some(protocol),
            0,
        );
        self.emit(SessionEvent::Connecting {
            id,
            protocol,
            timestamp: Utc::now(),
        });

        let brought_up = self.bring_up(&config, id).await;
        // ssh has its own copy of the credentials by now
        config.ssh.zeroize();

        match brought_up {
            Ok(local_proxy_port) => {
                let message = if local_proxy_port == 0 {
                    format!("Connected via {}", protocol)
                } else {
                    format!("Connected via {} (local proxy port {})", protocol, local_proxy_port)
                };
                self.set_status(
                    SessionState::Connected,
                    &message,
                    Some(id),
                    Some(protocol),
                    local_proxy_port,
                );
                self.emit(SessionEvent::Connected {
                    id,
                    local_proxy_port,
                    timestamp: Utc::now(),
                });
                info!("Session {} connected", id);
                Ok(self.snapshot())
            }
            Err(e) => {
                error!("Session {} failed to start: {}", id, e);
                self.set_status(SessionState::Failed, &e.to_string(), Some(id), Some(protocol), 0);
                self.emit(SessionEvent::Failed {
                    id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Acquire supervisor and interface, then start capturing. Whatever was
    /// acquired is released again on failure.
    async fn bring_up(&mut self, config: &Config, id: Uuid) -> Result<u16, SessionError> {
        let uses_ssh = config.protocol.requires_ssh_tunnel();

        let run = if uses_ssh {
            Some(self.supervisor.start(config).await?)
        } else {
            None
        };

        let request = InterfaceRequest::for_config(config);
        let tun = match self.deps.interfaces.establish(&request).await {
            Ok(tun) => tun,
            Err(e) => {
                if uses_ssh {
                    warn!("Interface unavailable, stopping SSH tunnel");
                    self.supervisor.stop().await;
                }
                return Err(SessionError::Interface(e));
            }
        };

        let liveness = uses_ssh.then(|| self.supervisor.liveness());
        let dispatcher = Arc::new(Dispatcher::new(config, liveness, &self.deps.codecs));
        let cancel = CancellationToken::new();
        let capture = tokio::spawn(
            CaptureLoop::new(dispatcher, self.stats.clone(), cancel.clone()).run(tun),
        );

        self.active = Some(ActiveSession {
            id,
            cancel,
            capture,
            tunnel: run.map(|r| r.generation),
        });
        Ok(run.map_or(0, |r| r.local_port))
    }

    async fn load_config(&self) -> Config {
        let store = self.deps.store.clone();
        let scope = self.deps.scope.clone();
        match tokio::task::spawn_blocking(move || store.load(&scope)).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Config load task failed: {}", e);
                Config::default()
            }
        }
    }

    async fn disconnect(&mut self) -> Result<SessionStatus, SessionError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::IllegalTransition {
                action: "disconnect",
                state,
            });
        }

        let id = self.active.as_ref().map(|a| a.id);
        let protocol = self.status.borrow().protocol;
        self.set_status(SessionState::Disconnecting, "Disconnecting", id, protocol, 0);
        self.teardown().await;
        self.set_status(SessionState::Idle, "Disconnected", None, None, 0);

        if let Some(id) = id {
            info!("Session {} disconnected", id);
            self.emit(SessionEvent::Disconnected {
                id,
                reason: "requested".to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(self.snapshot())
    }

    fn acknowledge(&mut self) -> Result<SessionStatus, SessionError> {
        let state = self.state();
        if state != SessionState::Failed {
            return Err(SessionError::IllegalTransition {
                action: "acknowledge",
                state,
            });
        }
        self.set_status(SessionState::Idle, "Disconnected", None, None, 0);
        Ok(self.snapshot())
    }

    async fn handle_tunnel_event(&mut self, event: SupervisorEvent) {
        let SupervisorEvent::TunnelDied {
            generation,
            exit_code,
        } = event;

        // Only the run backing the live session counts; anything else is a
        // late report from a run already torn down
        let Some(id) = self
            .active
            .as_ref()
            .filter(|a| a.tunnel == Some(generation))
            .map(|a| a.id)
        else {
            debug!(
                "Ignoring exit (code {:?}) of stale tunnel run {}",
                exit_code, generation
            );
            return;
        };

        let message = match exit_code {
            Some(code) => format!("SSH tunnel died (exit code {})", code),
            None => "SSH tunnel died (killed by signal)".to_string(),
        };
        error!("Session {}: {}", id, message);

        let protocol = self.status.borrow().protocol;
        self.set_status(SessionState::Disconnecting, &message, Some(id), protocol, 0);
        self.teardown().await;
        self.set_status(SessionState::Failed, &message, Some(id), protocol, 0);
        self.emit(SessionEvent::Failed {
            id,
            error: message,
            timestamp: Utc::now(),
        });
    }

    /// Stop capture, then the supervisor. The interface stream is owned by
    /// the capture task and released with it.
    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        let abort = active.capture.abort_handle();
        match timeout(CAPTURE_STOP_TIMEOUT, active.capture).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Capture task ended abnormally: {}", e),
            Err(_) => {
                warn!("Capture loop did not stop within {:?}, aborting", CAPTURE_STOP_TIMEOUT);
                abort.abort();
            }
        }

        if active.tunnel.is_some() {
            self.supervisor.stop().await;
        }
    }

    fn set_status(
        &self,
        state: SessionState,
        message: &str,
        session_id: Option<Uuid>,
        protocol: Option<Protocol>,
        local_proxy_port: u16,
    ) {
        debug!("Session state -> {}", state);
        self.status.send_modify(|status| {
            status.state = state;
            status.message = message.to_string();
            status.session_id = session_id;
            status.protocol = protocol;
            status.local_proxy_port = local_proxy_port;
        });
    }

    fn snapshot(&self) -> SessionStatus {
        let mut status = self.status.borrow().clone();
        status.stats = self.stats.snapshot();
        status
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::interface::testing::DuplexProvider;
    use crate::ssh::process::testing::FakeLauncher;

    struct Harness {
        handle: SessionHandle,
        launcher: FakeLauncher,
        interfaces: DuplexProvider,
        store: Arc<ConfigStore>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn harness() -> Harness {
        let store_dir = tempfile::tempdir().unwrap();
        let runtime_dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let interfaces = DuplexProvider::default();
        let store = Arc::new(ConfigStore::new(store_dir.path()));

        let (handle, _task) = SessionHandle::spawn(SessionDeps {
            store: store.clone(),
            scope: "default".to_string(),
            launcher: Arc::new(launcher.clone()),
            supervisor: SupervisorSettings {
                handshake_timeout: Duration::from_secs(2),
                runtime_dir: runtime_dir.path().to_path_buf(),
                ..Default::default()
            },
            interfaces: Arc::new(interfaces.clone()),
            codecs: CodecRegistry::default(),
        });

        Harness {
            handle,
            launcher,
            interfaces,
            store,
            _dirs: (store_dir, runtime_dir),
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn ssh_config(password: &str, private_key: &str) -> Config {
        let mut config = Config::for_protocol(Protocol::Ssh);
        config.ssh.enabled = true;
        config.ssh.host = "h".to_string();
        config.ssh.username = "u".to_string();
        config.ssh.password = password.to_string();
        config.ssh.private_key = private_key.to_string();
        config.ssh.local_port = free_port();
        config
    }

    fn http_config() -> Config {
        let mut config = Config::for_protocol(Protocol::Http);
        config.server_address = "proxy.example.com".to_string();
        config.server_port = 8080;
        config
    }

    async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        let mut watch = handle.watch();
        timeout(Duration::from_secs(2), watch.wait_for(|s| s.state == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ssh_session_connects() {
        let h = harness();
        let config = ssh_config("p", "");
        let port = config.ssh.local_port;

        let status = h.handle.connect(Some(config)).await.unwrap();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.local_proxy_port, port);
        assert_eq!(status.protocol, Some(Protocol::Ssh));
        assert!(status.session_id.is_some());
        assert_eq!(h.handle.status().state, SessionState::Connected);
        assert_eq!(h.launcher.launch_count(), 1);
        assert_eq!(h.interfaces.established.load(Ordering::SeqCst), 1);

        // The supervisor listener is live
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        h.handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_incomplete_credentials_rejected_before_spawn() {
        let h = harness();
        let mut events = h.handle.subscribe();

        let err = h.handle.connect(Some(ssh_config("", ""))).await.unwrap_err();
        let issues = match err {
            SessionError::InvalidConfig(issues) => issues,
            other => panic!("expected InvalidConfig, got {:?}", other),
        };
        assert!(issues.iter().any(|i| i.field == "sshConfig.sshPassword"));

        assert_eq!(h.handle.status().state, SessionState::Idle);
        assert_eq!(h.launcher.launch_count(), 0);
        assert_eq!(h.interfaces.established.load(Ordering::SeqCst), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_tunnel_death_fails_session() {
        let h = harness();
        let mut events = h.handle.subscribe();
        h.handle.connect(Some(ssh_config("p", ""))).await.unwrap();

        h.launcher.exit_last(255);
        wait_for_state(&h.handle, SessionState::Failed).await;

        let status = h.handle.status();
        assert!(status.message.contains("exit code 255"));
        assert_eq!(status.local_proxy_port, 0);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Failed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);

        // Failed -> Idle on acknowledgment, then reusable
        h.handle.acknowledge().await.unwrap();
        assert_eq!(h.handle.status().state, SessionState::Idle);
        h.handle.connect(Some(ssh_config("p", ""))).await.unwrap();
        assert_eq!(h.launcher.launch_count(), 2);
        h.handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_tunnel_death_ignored_by_next_run() {
        let h = harness();
        h.handle.connect(Some(ssh_config("p", ""))).await.unwrap();
        h.handle.disconnect().await.unwrap();
        h.handle.connect(Some(ssh_config("p", ""))).await.unwrap();
        assert_eq!(h.launcher.launch_count(), 2);

        // Run 1 reporting its death after run 2 came up
        h.handle
            .tunnel_events
            .send(SupervisorEvent::TunnelDied {
                generation: 1,
                exit_code: Some(255),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = h.handle.status();
        assert_eq!(status.state, SessionState::Connected);
        assert_ne!(status.local_proxy_port, 0);
        assert_eq!(h.launcher.kill_count(), 1);

        // The live run's own death still fails the session
        h.handle
            .tunnel_events
            .send(SupervisorEvent::TunnelDied {
                generation: 2,
                exit_code: Some(255),
            })
            .await
            .unwrap();
        wait_for_state(&h.handle, SessionState::Failed).await;
        assert_eq!(h.launcher.kill_count(), 2);
    }

    #[tokio::test]
    async fn test_interface_failure_rolls_back_supervisor() {
        let h = harness();
        h.interfaces.fail.store(true, Ordering::SeqCst);
        let config = ssh_config("p", "");
        let port = config.ssh.local_port;

        let err = h.handle.connect(Some(config)).await.unwrap_err();
        assert!(matches!(err, SessionError::Interface(_)));
        assert_eq!(h.handle.status().state, SessionState::Failed);
        assert_eq!(h.launcher.kill_count(), 1);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // A new connect from Failed is accepted
        h.interfaces.fail.store(false, Ordering::SeqCst);
        h.handle.connect(Some(ssh_config("p", ""))).await.unwrap();
        h.handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let h = harness();
        let config = ssh_config("p", "");
        let port = config.ssh.local_port;
        h.handle.connect(Some(config)).await.unwrap();

        let status = h.handle.disconnect().await.unwrap();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(h.launcher.kill_count(), 1);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // The capture loop dropped its end of the interface
        let mut peer = h.interfaces.take_peer().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let h = harness();

        assert!(matches!(
            h.handle.disconnect().await,
            Err(SessionError::IllegalTransition { action: "disconnect", state: SessionState::Idle })
        ));
        assert!(matches!(
            h.handle.acknowledge().await,
            Err(SessionError::IllegalTransition { action: "acknowledge", .. })
        ));

        h.handle.connect(Some(http_config())).await.unwrap();
        assert!(matches!(
            h.handle.connect(Some(http_config())).await,
            Err(SessionError::IllegalTransition { action: "connect", state: SessionState::Connected })
        ));
        h.handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_config_uses_store() {
        let h = harness();
        h.store.save("default", &http_config()).unwrap();

        let status = h.handle.connect(None).await.unwrap();
        assert_eq!(status.protocol, Some(Protocol::Http));
        assert_eq!(status.local_proxy_port, 0);
        assert_eq!(h.launcher.launch_count(), 0);

        let request = h.interfaces.requests.lock().unwrap()[0].clone();
        assert_eq!(request.session_name, "Maccaronia VPN");
        h.handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_saved_config_uses_defaults() {
        let h = harness();

        let status = h.handle.connect(None).await.unwrap();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.protocol, Some(Protocol::CustomUdp));
        assert_eq!(h.launcher.launch_count(), 0);
        h.handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_flow_while_connected() {
        let h = harness();
        h.handle.connect(Some(http_config())).await.unwrap();

        let mut peer = h.interfaces.take_peer().unwrap();
        peer.write_all(&[0x45, 0, 0, 4]).await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x45, 0, 0, 4]);

        timeout(Duration::from_secs(2), async {
            while h.handle.status().stats.frames_written < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.handle.status().stats.frames_read, 1);

        h.handle.disconnect().await.unwrap();
    }
}
