// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

//! At-rest sealing of persisted configurations.
//!
//! Blobs are XChaCha20-Poly1305 encrypted under a key derived (HKDF-SHA256)
//! from a random per-device secret, salted with the host machine id when one
//! is available. Layout:
//!
//! ```text
//! MAGIC(8) | version(1) | scope_len(1) | scope | nonce(24) | ciphertext+tag
//! ```
//!
//! Everything before the nonce is authenticated as associated data, so a
//! blob cannot be replayed under another persistence scope.

use std::fs;
use std::io::Write;
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"MACCSEAL";
const VERSION: u8 = 1;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const KDF_INFO: &[u8] = b"maccaronia config sealing v1";
const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Check whether the bytes look like a sealed blob
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.len() > MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

/// Device-bound key material
pub struct DeviceKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl DeviceKey {
    /// Derive a sealing key from raw secret material and a salt
    pub fn from_secret(secret: &[u8], salt: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(KDF_INFO, &mut key[..])
            .map_err(|e| Error::Crypto(format!("HKDF expand failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Load the device secret at `path`, creating it on first use
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let secret = match fs::read(path) {
            Ok(bytes) if bytes.len() == KEY_SIZE => Zeroizing::new(bytes),
            Ok(bytes) => {
                return Err(Error::Crypto(format!(
                    "Device key {} has invalid length {}",
                    path.display(),
                    bytes.len()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => create_secret(path)?,
            Err(e) => return Err(Error::Io(e)),
        };

        Self::from_secret(&secret[..], &machine_salt())
    }

    /// Encrypt `plaintext` for the given persistence scope
    pub fn seal(&self, scope: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let header = header_for(scope)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| Error::Crypto(format!("encrypt: {}", e)))?;

        let mut blob = Vec::with_capacity(header.len() + NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a sealed blob, returning its scope and plaintext
    pub fn open(&self, blob: &[u8]) -> Result<(String, Vec<u8>)> {
        if !is_sealed(blob) {
            return Err(Error::Crypto("missing seal header".to_string()));
        }

        let version_at = MAGIC.len();
        let scope_len_at = version_at + 1;
        if blob.len() <= scope_len_at {
            return Err(Error::Crypto("truncated header".to_string()));
        }
        if blob[version_at] != VERSION {
            return Err(Error::Crypto(format!(
                "unsupported seal version {}",
                blob[version_at]
            )));
        }

        let scope_len = blob[scope_len_at] as usize;
        let header_len = scope_len_at + 1 + scope_len;
        if blob.len() < header_len + NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto("truncated blob".to_string()));
        }

        let (header, rest) = blob.split_at(header_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let scope = String::from_utf8_lossy(&header[scope_len_at + 1..]).to_string();

        let plaintext = self
            .cipher()?
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| Error::Crypto("authentication failed".to_string()))?;

        Ok((scope, plaintext))
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|e| Error::Crypto(format!("cipher init: {}", e)))
    }
}

fn header_for(scope: &str) -> Result<Vec<u8>> {
    let scope_len = u8::try_from(scope.len())
        .map_err(|_| Error::InvalidPath(format!("scope name too long: {}", scope)))?;

    let mut header = Vec::with_capacity(MAGIC.len() + 2 + scope.len());
    header.extend_from_slice(MAGIC);
    header.push(VERSION);
    header.push(scope_len);
    header.extend_from_slice(scope.as_bytes());
    Ok(header)
}

fn create_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut secret = Zeroizing::new(vec![0u8; KEY_SIZE]);
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, secret.as_mut_slice());

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(&secret[..])?;
    file.sync_all()?;

    info!("Created device key at {}", path.display());
    Ok(secret)
}

fn machine_salt() -> Vec<u8> {
    match fs::read_to_string(MACHINE_ID_PATH) {
        Ok(id) if !id.trim().is_empty() => id.trim().as_bytes().to_vec(),
        _ => {
            debug!("No machine id available, using static salt");
            b"maccaronia".to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::from_secret(&[7u8; 32], b"test-salt").unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let key = key();
        let blob = key.seal("default", b"{\"protocol\":\"SSH\"}").unwrap();
        assert!(is_sealed(&blob));

        let (scope, plaintext) = key.open(&blob).unwrap();
        assert_eq!(scope, "default");
        assert_eq!(plaintext, b"{\"protocol\":\"SSH\"}");
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let key = key();
        let mut blob = key.seal("default", b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(key.open(&blob), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_scope_is_authenticated() {
        let key = key();
        let mut blob = key.seal("aaaa", b"payload").unwrap();
        // Rewrite the scope name in the header without touching the ciphertext
        let scope_at = MAGIC.len() + 2;
        blob[scope_at..scope_at + 4].copy_from_slice(b"bbbb");
        assert!(key.open(&blob).is_err());
    }

    #[test]
    fn test_other_device_cannot_open() {
        let blob = key().seal("default", b"payload").unwrap();
        let other = DeviceKey::from_secret(&[8u8; 32], b"test-salt").unwrap();
        assert!(other.open(&blob).is_err());
    }

    #[test]
    fn test_device_key_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");

        let first = DeviceKey::load_or_create(&path).unwrap();
        let blob = first.seal("default", b"payload").unwrap();

        let second = DeviceKey::load_or_create(&path).unwrap();
        assert_eq!(second.open(&blob).unwrap().1, b"payload");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
