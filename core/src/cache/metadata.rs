/*
 * metadata.rs
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

//! On-disk metadata record stored beside each cache content file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use super::{process_alive, CacheError};
use crate::uri::ByteRange;

/// JSON metadata record for one disk cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheMetadata {
    pub url: String,
    pub range: Option<ByteRange>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub mime_type: Option<String>,
    pub content_length: Option<u64>,
    /// Seconds after `created` during which the content is fresh.
    pub max_age: Option<u64>,
    pub must_revalidate: bool,
    pub no_cache: bool,
    /// Unix seconds of the last full write or successful revalidation.
    pub created: i64,
    pub last_hit: i64,
    pub num_hits: u32,
    /// Process id of the writer while a write is in progress.
    pub in_write: Option<u32>,
    pub to_delete: bool,
    /// Process ids currently using the entry.
    pub users: BTreeSet<u32>,
}

/// Outcome of validating a record against a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Complete content of the given size.
    Valid(u64),
    /// Another live process is writing it.
    InProgress(u32),
    Corrupted(String),
}

impl CacheMetadata {
    pub fn new(url: &str, range: Option<ByteRange>, now: i64) -> Self {
        Self {
            url: url.to_string(),
            range,
            created: now,
            ..Default::default()
        }
    }

    /// `Ok(None)` when no record exists yet.
    pub fn load(path: &Path) -> Result<Option<Self>, CacheError> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| CacheError::Metadata(e.to_string()))
    }

    /// Write through a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| CacheError::Metadata(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Drop user markers of dead processes. Returns true if a process other than `pid`
    /// still uses the entry.
    pub fn prune_users(&mut self, pid: u32) -> bool {
        self.users.retain(|&p| p == pid || process_alive(p));
        self.users.iter().any(|&p| p != pid)
    }

    /// Unix time after which the content is stale, if a max-age is known.
    pub fn expires_at(&self) -> Option<i64> {
        self.max_age.map(|a| self.created.saturating_add(a as i64))
    }

    /// Validate against the requested resource and the content file on disk.
    pub fn check(&self, url: &str, range: Option<ByteRange>, content: &Path, pid: u32) -> Condition {
        if !self.url.eq_ignore_ascii_case(url) {
            return Condition::Corrupted("url mismatch".into());
        }
        if self.range != range {
            return Condition::Corrupted("range mismatch".into());
        }
        if self.no_cache {
            return Condition::Corrupted("stored with no-cache".into());
        }
        let size = match fs::metadata(content) {
            Ok(m) => m.len(),
            Err(_) => return Condition::Corrupted("missing content file".into()),
        };
        if let Some(writer) = self.in_write {
            if writer != pid && process_alive(writer) {
                return Condition::InProgress(writer);
            }
            return Condition::Corrupted("writer died mid-write".into());
        }
        match self.content_length {
            Some(len) if len == size => Condition::Valid(size),
            Some(len) => Condition::Corrupted(format!("size {} differs from {}", size, len)),
            None => Condition::Corrupted("missing content length".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dir: &Path, body: &[u8]) -> (CacheMetadata, std::path::PathBuf) {
        let content = dir.join("cache_x.dat");
        fs::write(&content, body).unwrap();
        let mut m = CacheMetadata::new("http://h/a.mp4", None, 100);
        m.content_length = Some(body.len() as u64);
        (m, content)
    }

    #[test]
    fn valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let (m, content) = record(dir.path(), b"hello");
        assert_eq!(m.check("http://h/a.mp4", None, &content, 1), Condition::Valid(5));
    }

    #[test]
    fn mismatches_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, content) = record(dir.path(), b"hello");
        assert!(matches!(
            m.check("http://h/b.mp4", None, &content, 1),
            Condition::Corrupted(_)
        ));
        assert!(matches!(
            m.check("http://h/a.mp4", Some(ByteRange::new(0, Some(9))), &content, 1),
            Condition::Corrupted(_)
        ));
        m.content_length = Some(4);
        assert!(matches!(m.check("http://h/a.mp4", None, &content, 1), Condition::Corrupted(_)));
        m.content_length = None;
        assert!(matches!(m.check("http://h/a.mp4", None, &content, 1), Condition::Corrupted(_)));
    }

    #[test]
    fn dead_writer_is_corruption_live_writer_is_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, content) = record(dir.path(), b"hello");
        m.in_write = Some(2147483000);
        assert!(matches!(m.check("http://h/a.mp4", None, &content, 1), Condition::Corrupted(_)));
        let me = std::process::id();
        m.in_write = Some(me);
        assert_eq!(m.check("http://h/a.mp4", None, &content, me + 1), Condition::InProgress(me));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_x.json");
        assert!(CacheMetadata::load(&path).unwrap().is_none());
        let mut m = CacheMetadata::new("http://h/a", Some(ByteRange::new(10, None)), 5);
        m.users.insert(42);
        m.etag = Some("\"v1\"".into());
        m.save(&path).unwrap();
        assert_eq!(CacheMetadata::load(&path).unwrap(), Some(m));
    }

    #[test]
    fn prune_removes_dead_users() {
        let mut m = CacheMetadata::default();
        let me = std::process::id();
        m.users.insert(me);
        m.users.insert(2147483000);
        assert!(!m.prune_users(me));
        assert_eq!(m.users.len(), 1);
    }
}
