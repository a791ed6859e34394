/*
 * credentials.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a resource-fetching engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Credential store: per-server username/digest records used to answer HTTP authentication
//! challenges, with optional encrypted persistence.
//!
//! The digest is the HTTP Basic token, base64("user:password"). When saved, the store is written
//! as JSON and encrypted with XChaCha20-Poly1305 using a key kept beside the file in `.key`
//! (mode 0o600). File format: "CRENC" + 24-byte nonce + ciphertext (with tag).

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use serde::{Deserialize, Serialize};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const ENCRYPTED_MAGIC: &[u8] = b"CRENC";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Basic authentication token for a user/password pair.
pub fn basic_digest(username: &str, password: &str) -> String {
    BASE64.encode(format!("{}:{}", username, password))
}

/// One (server, username) credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub server: String,
    pub username: String,
    pub digest: String,
    /// Cleared when the server rejects the digest.
    #[serde(skip, default = "default_valid")]
    pub valid: bool,
    /// Set while an asynchronous prompt for this record is outstanding.
    #[serde(skip)]
    pub pending: bool,
}

fn default_valid() -> bool {
    true
}

/// Answer of a [`CredentialPrompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// Credentials are available now.
    Provided { username: String, password: String },
    /// The user is being asked; the answer arrives later through the manager.
    Pending,
    Denied,
}

/// Asks the embedding application for credentials after a 401.
pub trait CredentialPrompt: Send + Sync {
    fn request(&self, server: &str, username: Option<&str>, secure: bool) -> PromptOutcome;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CredentialStore {
    credentials: Vec<CredentialRecord>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the record for (server, username). The new record is valid.
    pub fn register(&mut self, server: &str, username: &str, password: &str) -> &CredentialRecord {
        let digest = basic_digest(username, password);
        let idx = match self.position(server, Some(username)) {
            Some(i) => {
                let rec = &mut self.credentials[i];
                rec.digest = digest;
                rec.valid = true;
                rec.pending = false;
                i
            }
            None => {
                self.credentials.push(CredentialRecord {
                    server: server.to_string(),
                    username: username.to_string(),
                    digest,
                    valid: true,
                    pending: false,
                });
                self.credentials.len() - 1
            }
        };
        &self.credentials[idx]
    }

    fn position(&self, server: &str, username: Option<&str>) -> Option<usize> {
        self.credentials.iter().position(|c| {
            c.server == server && username.map(|u| c.username == u).unwrap_or(true)
        })
    }

    /// Record for the server; with no username the first record for the server.
    pub fn find(&self, server: &str, username: Option<&str>) -> Option<&CredentialRecord> {
        self.position(server, username).map(|i| &self.credentials[i])
    }

    /// First usable record for the server (and username, when given).
    pub fn find_valid(&self, server: &str, username: Option<&str>) -> Option<&CredentialRecord> {
        self.credentials.iter().find(|c| {
            c.server == server
                && c.valid
                && !c.digest.is_empty()
                && username.map(|u| c.username == u).unwrap_or(true)
        })
    }

    pub fn invalidate(&mut self, server: &str, username: &str) {
        if let Some(i) = self.position(server, Some(username)) {
            self.credentials[i].valid = false;
        }
    }

    /// Mark a prompt as outstanding, creating an empty placeholder record if needed.
    pub fn set_pending(&mut self, server: &str, username: Option<&str>, pending: bool) {
        match self.position(server, username) {
            Some(i) => self.credentials[i].pending = pending,
            None if pending => self.credentials.push(CredentialRecord {
                server: server.to_string(),
                username: username.unwrap_or_default().to_string(),
                digest: String::new(),
                valid: false,
                pending: true,
            }),
            None => {}
        }
    }

    /// The prompt for `server` was answered; drop empty placeholders.
    pub fn clear_pending(&mut self, server: &str) {
        self.credentials
            .retain(|c| !(c.server == server && c.pending && c.digest.is_empty()));
        for c in self.credentials.iter_mut().filter(|c| c.server == server) {
            c.pending = false;
        }
    }

    pub fn is_pending(&self, server: &str) -> bool {
        self.credentials.iter().any(|c| c.server == server && c.pending)
    }

    pub fn forget(&mut self, server: &str, username: Option<&str>) -> usize {
        let before = self.credentials.len();
        self.credentials.retain(|c| {
            !(c.server == server && username.map(|u| c.username == u).unwrap_or(true))
        });
        before - self.credentials.len()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Load a store saved with [`save`](Self::save). A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.to_string()),
        };
        if !raw.starts_with(ENCRYPTED_MAGIC) || raw.len() < ENCRYPTED_MAGIC.len() + NONCE_LEN + 16 {
            return Err("not an encrypted credentials file".to_string());
        }
        let key_path = key_path(path).ok_or("no parent for credentials path")?;
        let key = read_key(&key_path)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|e| e.to_string())?;
        let nonce = chacha20poly1305::XNonce::from_slice(
            &raw[ENCRYPTED_MAGIC.len()..ENCRYPTED_MAGIC.len() + NONCE_LEN],
        );
        let plain = cipher
            .decrypt(nonce, &raw[ENCRYPTED_MAGIC.len() + NONCE_LEN..])
            .map_err(|_| "decryption failed (wrong key or tampered file)".to_string())?;
        serde_json::from_slice(&plain).map_err(|e| format!("credentials file: {}", e))
    }

    /// Write every record with a digest, encrypted. Creates the key file on first use.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let persisted = CredentialStore {
            credentials: self
                .credentials
                .iter()
                .filter(|c| !c.digest.is_empty())
                .cloned()
                .collect(),
        };
        let plain = serde_json::to_vec(&persisted).map_err(|e| e.to_string())?;
        let parent = path.parent().ok_or("no parent dir")?;
        let key_path = key_path(path).ok_or("no parent for credentials path")?;
        let key = get_or_create_key(&key_path, parent)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|e| e.to_string())?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plain.as_ref())
            .map_err(|e| e.to_string())?;
        let mut f = open_private_file(path).map_err(|e| e.to_string())?;
        f.write_all(ENCRYPTED_MAGIC).map_err(|e| e.to_string())?;
        f.write_all(nonce.as_slice()).map_err(|e| e.to_string())?;
        f.write_all(&ciphertext).map_err(|e| e.to_string())?;
        f.flush().map_err(|e| e.to_string())
    }
}

/// Default credentials path: ~/.corriere/credentials.
pub fn default_credentials_path() -> Option<PathBuf> {
    crate::config::default_config_dir().map(|d| d.join("credentials"))
}

fn key_path(credentials_path: &Path) -> Option<PathBuf> {
    credentials_path.parent().map(|p| p.join(".key"))
}

fn read_key(key_path: &Path) -> Result<[u8; KEY_LEN], String> {
    let buf = fs::read(key_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            "encrypted credentials file but key file not found".to_string()
        } else {
            e.to_string()
        }
    })?;
    if buf.len() != KEY_LEN {
        return Err("key file has wrong length".to_string());
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&buf);
    Ok(key)
}

fn get_or_create_key(key_path: &Path, parent_dir: &Path) -> Result<[u8; KEY_LEN], String> {
    if key_path.exists() {
        return read_key(key_path);
    }
    fs::create_dir_all(parent_dir).map_err(|e| e.to_string())?;
    #[cfg(unix)]
    drop(fs::set_permissions(parent_dir, PermissionsExt::from_mode(0o700)));
    let mut key = [0u8; KEY_LEN];
    getrandom::getrandom(&mut key).map_err(|e| e.to_string())?;
    let mut f = open_private_file(key_path).map_err(|e| e.to_string())?;
    f.write_all(&key).map_err(|e| e.to_string())?;
    f.flush().map_err(|e| e.to_string())?;
    Ok(key)
}

/// Create or truncate a file readable only by its owner.
fn open_private_file(path: &Path) -> std::io::Result<File> {
    #[cfg(unix)]
    {
        fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .mode(0o600)
            .open(path)
    }
    #[cfg(not(unix))]
    {
        File::create(path)
    }
}
