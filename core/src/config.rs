/*
 * config.rs
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

//! Engine configuration. Loaded from a JSON file (every field optional) or built in code.
//! Process-wide one-shot state lives in [`EngineInit`], which is handed to the manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::client::ClientConfig;

use crate::net;

/// Whether a cached entry whose max-age elapsed may be served without revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Expired entries are always revalidated with the server (ETag / Last-Modified).
    #[default]
    Revalidate,
    /// Expired entries without must-revalidate are served directly.
    AllowDirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

fn default_proxy_port() -> u16 {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Disk cache directory. None keeps every entry in memory.
    pub cache_dir: Option<PathBuf>,
    /// Eviction threshold for the disk cache in bytes; 0 disables eviction.
    pub max_cache_size: u64,
    pub clean_cache_on_start: bool,
    /// Store new entries in memory even when a cache directory is configured.
    pub memory_cache: bool,
    pub disable_cache: bool,
    pub reuse_policy: ReusePolicy,
    pub user_agent: String,
    /// Aggregate cap over all sessions in bytes per second; 0 is unlimited.
    pub max_rate: u64,
    pub connect_timeout_ms: u64,
    /// Maximum silence on an established transport; 0 waits forever.
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub max_redirects: u32,
    pub poll_interval_ms: u64,
    pub proxy: Option<ProxyConfig>,
    pub http2: bool,
    pub http3: bool,
    pub credentials_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_cache_size: 0,
            clean_cache_on_start: false,
            memory_cache: false,
            disable_cache: false,
            reuse_policy: ReusePolicy::Revalidate,
            user_agent: format!("Corriere/{}", env!("CARGO_PKG_VERSION")),
            max_rate: 0,
            connect_timeout_ms: 15_000,
            request_timeout_ms: 0,
            max_retries: 20,
            max_redirects: 4,
            poll_interval_ms: 5,
            proxy: None,
            http2: true,
            http3: false,
            credentials_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON document. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(format!("{}: {}", path.display(), e)),
        };
        serde_json::from_str(&raw).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::write(path, json).map_err(|e| e.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Default config file: ~/.corriere/config.json.
    pub fn default_path() -> Option<PathBuf> {
        default_config_dir().map(|d| d.join("config.json"))
    }
}

/// Default config directory: ~/.corriere.
pub fn default_config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from).map(|h| h.join(".corriere"))
}

/// One-shot process state shared by every manager in the process.
pub struct EngineInit {
    pid: u32,
    started: Instant,
    tls: Arc<ClientConfig>,
    tls_h1_only: Arc<ClientConfig>,
}

static ENGINE_INIT: OnceLock<Arc<EngineInit>> = OnceLock::new();

impl EngineInit {
    /// Initialise once; later calls return the same state.
    pub fn global() -> Arc<EngineInit> {
        ENGINE_INIT
            .get_or_init(|| {
                Arc::new(EngineInit {
                    pid: std::process::id(),
                    started: Instant::now(),
                    tls: net::client_config(&[b"h2", b"http/1.1"]),
                    tls_h1_only: net::client_config(&[b"http/1.1"]),
                })
            })
            .clone()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// TLS configuration; offers h2 through ALPN when `h2` is set.
    pub fn tls_config(&self, h2: bool) -> Arc<ClientConfig> {
        if h2 {
            self.tls.clone()
        } else {
            self.tls_h1_only.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.max_redirects, 4);
        assert_eq!(cfg.max_retries, 20);
        assert_eq!(cfg.reuse_policy, ReusePolicy::Revalidate);
        assert!(cfg.user_agent.starts_with("Corriere/"));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "max_rate": 1000, "reuse_policy": "allow_direct", "proxy": { "host": "px" } }"#,
        )
        .unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.max_rate, 1000);
        assert_eq!(cfg.reuse_policy, ReusePolicy::AllowDirect);
        assert_eq!(cfg.proxy.as_ref().map(|p| p.port), Some(80));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let mut cfg = EngineConfig::default();
        cfg.max_cache_size = 4096;
        cfg.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().max_cache_size, 4096);
    }

    #[test]
    fn init_is_idempotent() {
        let a = EngineInit::global();
        let b = EngineInit::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.pid(), std::process::id());
    }
}
