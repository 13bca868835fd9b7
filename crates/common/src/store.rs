// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Maccaronia Tunnel - Config Store
// Sealed persistence of the active configuration plus file import/export

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::seal::{self, DeviceKey};

/// Extension carried by exported configuration files
pub const EXPORT_EXTENSION: &str = "maccp";

/// Scope used when the caller has no preference
pub const DEFAULT_SCOPE: &str = "default";

const SEALED_SUFFIX: &str = ".json.sealed";
const DEVICE_KEY_FILE: &str = "device.key";

/// Get the default store directory path
pub fn store_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::InvalidPath("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("maccaronia"))
}

/// Persists configurations per scope, sealed with a device-bound key
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `dirs::config_dir()/maccaronia`
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(store_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the sealed file backing `scope`
    pub fn scope_path(&self, scope: &str) -> Result<PathBuf> {
        check_scope(scope)?;
        Ok(self.root.join(format!("{}{}", scope, SEALED_SUFFIX)))
    }

    /// Load the configuration saved under `scope`.
    ///
    /// Never fails: a missing, unreadable or unopenable file yields the
    /// default configuration.
    pub fn load(&self, scope: &str) -> Config {
        match self.try_load(scope) {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!("No saved configuration for scope '{}'", scope);
                Config::default()
            }
            Err(e) => {
                warn!(
                    "Failed to load configuration for scope '{}', using defaults: {}",
                    scope, e
                );
                Config::default()
            }
        }
    }

    /// Load the configuration under `scope`, surfacing every failure
    pub fn try_load(&self, scope: &str) -> Result<Option<Config>> {
        let path = self.scope_path(scope)?;
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        let (sealed_scope, plaintext) = self.device_key()?.open(&blob)?;
        if sealed_scope != scope {
            return Err(Error::Crypto(format!(
                "blob sealed for scope '{}' found under '{}'",
                sealed_scope, scope
            )));
        }

        config::deserialize(&plaintext).map(Some)
    }

    /// Durably persist `config` under `scope`
    pub fn save(&self, scope: &str, config: &Config) -> Result<PathBuf> {
        let path = self.scope_path(scope)?;
        ensure_private_dir(&self.root)?;

        let plaintext = zeroize::Zeroizing::new(config::serialize(config)?);
        let blob = self.device_key()?.seal(scope, &plaintext)?;
        write_atomic(&path, &blob)?;

        debug!("Saved configuration for scope '{}' to {}", scope, path.display());
        Ok(path)
    }

    /// Write `config` as plain JSON to `path`, appending `.maccp` if missing.
    ///
    /// Returns the path actually written.
    pub fn export(&self, config: &Config, path: &Path) -> Result<PathBuf> {
        let path = with_export_extension(path);
        let bytes = config::serialize(config)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(Error::InvalidPath(format!(
                    "Export directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        write_atomic(&path, &bytes)?;
        info!("Exported configuration to {}", path.display());
        Ok(path)
    }

    /// Export into `dir` under a timestamped file name
    pub fn export_to_dir(&self, config: &Config, dir: &Path) -> Result<PathBuf> {
        let name = format!(
            "maccaronia_config_{}.{}",
            Utc::now().timestamp_millis(),
            EXPORT_EXTENSION
        );
        self.export(config, &dir.join(name))
    }

    /// Read a configuration file written by `export` or `save`.
    ///
    /// I/O failures surface as `Error::Io`; corrupt content as
    /// `Error::Parse` (plain files) or `Error::Crypto` (sealed files).
    pub fn import(&self, path: &Path) -> Result<Config> {
        let bytes = fs::read(path)?;

        let config = if seal::is_sealed(&bytes) {
            let (_, plaintext) = self.device_key()?.open(&bytes)?;
            config::deserialize(&plaintext)?
        } else {
            config::deserialize(&bytes)?
        };

        info!("Imported configuration from {}", path.display());
        Ok(config)
    }

    /// Remove the configuration saved under `scope`; absent is fine
    pub fn remove(&self, scope: &str) -> Result<()> {
        let path = self.scope_path(scope)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed configuration at {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn device_key(&self) -> Result<DeviceKey> {
        ensure_private_dir(&self.root)?;
        DeviceKey::load_or_create(&self.root.join(DEVICE_KEY_FILE))
    }
}

fn check_scope(scope: &str) -> Result<()> {
    let valid = !scope.is_empty()
        && scope.len() <= 64
        && scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidPath(format!("Invalid scope name: '{}'", scope)))
    }
}

fn with_export_extension(path: &Path) -> PathBuf {
    if path.extension().and_then(|e| e.to_str()) == Some(EXPORT_EXTENSION) {
        path.to_path_buf()
    } else {
        let mut os = path.as_os_str().to_os_string();
        os.push(".");
        os.push(EXPORT_EXTENSION);
        PathBuf::from(os)
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write to a sibling temp file (0600), fsync, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidPath(format!("Not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| -> std::io::Result<()> {
        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Io(e));
    }
    Ok(())
}
