// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// File mode hardening for the runtime directory and control socket

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Owner-only umask; call before creating any file
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        // SAFETY: umask only swaps the process file-creation mask
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    debug!("Set permissions {:o} on {}", mode, path.display());
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// 0700, or 0770 with group access
pub fn set_directory_permissions(path: &Path, group_access: bool) -> Result<()> {
    set_mode(path, if group_access { 0o770 } else { 0o700 })
}

/// 0600, or 0660 with group access
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    set_mode(path, if group_access { 0o660 } else { 0o600 })
}

/// Create `path` if needed and apply directory permissions
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }
    set_directory_permissions(path, group_access)
}
