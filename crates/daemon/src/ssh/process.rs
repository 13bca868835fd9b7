// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// External ssh process: launcher seam and the tokio::process implementation

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::command::SshCommand;

/// Starts tunnel processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, command: &SshCommand) -> io::Result<Box<dyn TunnelProcess>>;
}

/// A running tunnel process
#[async_trait]
pub trait TunnelProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit and return its exit code (None when
    /// killed by a signal). Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> io::Result<()>;
}

/// Launches the real ssh binary
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn launch(&self, command: &SshCommand) -> io::Result<Box<dyn TunnelProcess>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        debug!("Launched {} (pid {:?})", command.program, pid);

        // ssh reports auth and forwarding failures on stderr
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("Permission denied") || line.contains("failed") {
                        warn!("ssh[{:?}]: {}", pid, line);
                    } else {
                        debug!("ssh[{:?}]: {}", pid, line);
                    }
                }
            });
        }

        Ok(Box::new(SystemProcess { child }))
    }
}

struct SystemProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Scriptable stand-ins for the ssh process
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::sync::oneshot;

    use super::*;

    /// Records launches; each launched process exits when the matching
    /// sender from `exit_senders` fires
    #[derive(Clone, Default)]
    pub struct FakeLauncher {
        pub launches: Arc<Mutex<Vec<SshCommand>>>,
        pub exit_senders: Arc<Mutex<Vec<oneshot::Sender<i32>>>>,
        pub killed: Arc<AtomicUsize>,
        pub fail_spawn: Arc<AtomicBool>,
    }

    impl FakeLauncher {
        pub fn launch_count(&self) -> usize {
            self.launches.lock().map(|l| l.len()).unwrap_or(0)
        }

        pub fn kill_count(&self) -> usize {
            self.killed.load(Ordering::SeqCst)
        }

        /// Make the most recently launched process exit with `code`
        pub fn exit_last(&self, code: i32) {
            if let Some(tx) = self.exit_senders.lock().unwrap().pop() {
                let _ = tx.send(code);
            }
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, command: &SshCommand) -> io::Result<Box<dyn TunnelProcess>> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "ssh: not found"));
            }
            let (tx, rx) = oneshot::channel();
            self.launches.lock().unwrap().push(command.clone());
            self.exit_senders.lock().unwrap().push(tx);
            Ok(Box::new(FakeProcess {
                exit: rx,
                killed: false,
                kill_counter: self.killed.clone(),
            }))
        }
    }

    pub struct FakeProcess {
        exit: oneshot::Receiver<i32>,
        killed: bool,
        kill_counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TunnelProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> io::Result<Option<i32>> {
            if self.killed {
                return Ok(None);
            }
            match (&mut self.exit).await {
                Ok(code) => Ok(Some(code)),
                Err(_) => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> io::Result<()> {
            if !self.killed {
                self.killed = true;
                self.kill_counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}
