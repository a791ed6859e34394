/*
 * mod.rs
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

//! Response cache: disk or memory entries shared by every session fetching the same resource,
//! with cross-process coordination through metadata records and lock files.

mod cleanup;
mod entry;
mod lock;
mod memory;
mod metadata;

pub use entry::{cache_key, url_extension, CacheEntry, CacheReader, EntryPaths, ReadStatus, Reuse, StorageKind};
pub use lock::{NamedLock, ENTRY_LOCK_SPIN};
pub use memory::{MemoryBlob, MIN_MEMORY_CAPACITY};
pub use metadata::{CacheMetadata, Condition};

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::uri::ByteRange;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("corrupted cache entry: {0}")]
    Corrupted(String),

    #[error("cache content length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: u64, found: u64 },

    #[error("timed out acquiring cache lock {0}")]
    LockTimeout(String),

    #[error("cache entry is being written by another session")]
    WriteLocked,

    #[error("cache metadata error: {0}")]
    Metadata(String),

    #[error("out of memory growing cache blob")]
    OutOfMemory,

    #[error("external cache content was invalidated")]
    Invalidated,
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        CacheError::Io(Arc::new(e))
    }
}

/// True when a process with this id exists.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn process_alive(pid: u32) -> bool {
    pid != 0
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Live cache entries of this process, plus the on-disk directory they share with others.
#[derive(Debug)]
pub struct CacheStore {
    dir: Option<PathBuf>,
    max_size: u64,
    pid: u32,
    entries: Mutex<Vec<Arc<CacheEntry>>>,
}

impl CacheStore {
    /// `dir == None` keeps every entry in memory.
    pub fn new(dir: Option<PathBuf>, max_size: u64, pid: u32) -> Result<Self, CacheError> {
        if let Some(d) = &dir {
            std::fs::create_dir_all(d)?;
        }
        Ok(Self {
            dir,
            max_size,
            pid,
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The live entry for `(url, range)`, or a new one. Disk entries are validated against
    /// their metadata record; `CacheError::Corrupted` means the session must not cache.
    pub fn find_or_create(
        &self,
        url: &str,
        range: Option<ByteRange>,
        memory: bool,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock();
        if let Some(e) = entries
            .iter()
            .find(|e| e.url() == url && e.range() == range && !e.is_deleted())
        {
            debug!(target: "corriere::cache", url, "reusing live entry");
            return Ok(Arc::clone(e));
        }
        let entry = match (&self.dir, memory) {
            (Some(dir), false) => CacheEntry::open_disk(dir, url, range, self.pid)?,
            _ => CacheEntry::in_memory(url, range, self.pid),
        };
        entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    /// Forget an entry once nothing is attached and it is not persistent.
    pub fn release(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.lock();
        if entry.session_count() == 0 && (!entry.is_persistent() || entry.is_deleted()) {
            entries.retain(|e| !Arc::ptr_eq(e, entry));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict down to the configured budget. Returns the remaining disk usage.
    pub fn cleanup(&self) -> Result<u64, CacheError> {
        match &self.dir {
            Some(dir) if self.max_size > 0 => cleanup::evict(dir, self.max_size, self.pid),
            _ => Ok(0),
        }
    }

    /// Delete every disk entry no live process uses.
    pub fn clean_all(&self) -> Result<usize, CacheError> {
        match &self.dir {
            Some(dir) => {
                let n = cleanup::remove_unused(dir, self.pid)?;
                info!(target: "corriere::cache", removed = n, "cleaned cache directory");
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_resource_shares_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(Some(dir.path().to_path_buf()), 0, std::process::id()).unwrap();
        let a = store.find_or_create("http://h/a.ts", None, false).unwrap();
        let b = store.find_or_create("http://h/a.ts", None, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = store
            .find_or_create("http://h/a.ts", Some(ByteRange::new(0, Some(9))), false)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn released_entries_leave_the_store_unless_persistent() {
        let store = CacheStore::new(None, 0, 1).unwrap();
        let a = store.find_or_create("http://h/a", None, true).unwrap();
        a.attach(1);
        a.detach(1);
        store.release(&a);
        assert!(store.is_empty());
        let m = store.find_or_create("http://h/manifest", None, true).unwrap();
        m.set_persistent(true);
        m.attach(1);
        m.detach(1);
        store.release(&m);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
