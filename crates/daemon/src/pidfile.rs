// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Single-instance guard for the daemon

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Removes the PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the default PID file in the runtime directory
    pub fn create() -> Result<Self> {
        Self::create_at(&crate::config::runtime_dir()?.join("daemon.pid"))
    }

    /// Claim `path`. Fails if it names a live process; a stale file is
    /// replaced.
    pub fn create_at(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            if is_process_running(pid) {
                anyhow::bail!(
                    "Daemon is already running with PID {}. \
                     Stop it first or remove {} if it is stale.",
                    pid,
                    path.display()
                );
            }
            warn!("Removing stale PID file for process {}", pid);
        }
        if path.exists() {
            fs::remove_file(path).context("Failed to remove stale PID file")?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(path, pid.to_string()).context("Failed to write PID file")?;
        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    match fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read PID file {}: {}", path.display(), e);
            None
        }
    }
}

/// kill(pid, 0) checks for existence without signalling
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the permission and existence check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    warn!("Process existence check not implemented for this platform");
    true
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_instance_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let guard = PidFileGuard::create_at(&path).unwrap();
        let err = PidFileGuard::create_at(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(guard);
        assert!(!path.exists());
        let _again = PidFileGuard::create_at(&path).unwrap();
    }

    #[test]
    fn test_stale_and_garbage_files_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        fs::write(&path, "999999999").unwrap();
        let guard = PidFileGuard::create_at(&path).unwrap();
        drop(guard);

        fs::write(&path, "not a pid").unwrap();
        let _guard = PidFileGuard::create_at(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
